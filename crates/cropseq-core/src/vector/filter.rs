//! Crop-presence filter.
use log::info;
use serde::{Deserialize, Serialize};

use super::{PolygonLayer, PolygonRecord};

/// Keeps a record when its net crop years (`count0 − count45`) reach
/// `min_crop_years`, or when it has at least one net crop year and covers
/// at least `min_area_single_year`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropPresenceFilter {
    pub min_crop_years: i64,
    pub min_area_single_year: f64,
}

impl Default for CropPresenceFilter {
    fn default() -> Self {
        Self { min_crop_years: 2, min_area_single_year: 10_000.0 }
    }
}

impl CropPresenceFilter {
    pub fn keeps(&self, record: &PolygonRecord) -> bool {
        let net = record.net_crop_years();
        net >= self.min_crop_years || (record.area >= self.min_area_single_year && net >= 1)
    }

    /// Drop rejected records in place; returns how many were removed.
    pub fn apply(&self, layer: &mut PolygonLayer) -> usize {
        let before = layer.len();
        layer.records.retain(|r| self.keeps(r));
        let removed = before - layer.len();
        info!("crop presence filter kept {} of {} polygons", layer.len(), before);
        removed
    }
}
