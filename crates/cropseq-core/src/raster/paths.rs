//! Year → raster path resolution for annual land-cover products.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{CropSeqError, Result};

/// Candidate file locations for `year`, in lookup order: a per-year
/// sub-directory first, then files directly under `base`.
pub fn candidate_paths(base: &Path, year: u16, resolution: &str) -> Vec<PathBuf> {
    let year_dir = base.join(year.to_string());
    vec![
        year_dir.join(format!("{year}_{resolution}_cdls.tif")),
        year_dir.join(format!("{year}_30m_cdls.tif")),
        year_dir.join(format!("cdl_{year}.tif")),
        year_dir.join(format!("{year}_cdl.tif")),
        base.join(format!("{year}_{resolution}_cdls.tif")),
        base.join(format!("{year}_30m_cdls.tif")),
        base.join(format!("cdl_{year}.tif")),
        base.join(format!("{year}_cdl.tif")),
    ]
}

/// Resolve one raster per year in `start..=end`.
///
/// A missing year is fatal: the signature of every pixel depends on all
/// years being present.
pub fn resolve_year_paths(base: &Path, start: u16, end: u16, resolution: &str) -> Result<BTreeMap<u16, PathBuf>> {
    let mut out = BTreeMap::new();
    for year in start..=end {
        let candidates = candidate_paths(base, year, resolution);
        match candidates.iter().find(|p| p.is_file()) {
            Some(found) => {
                out.insert(year, found.clone());
            }
            None => {
                return Err(CropSeqError::InputNotFound { year, searched: candidates });
            }
        }
    }
    Ok(out)
}
