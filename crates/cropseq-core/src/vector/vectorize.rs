//! Coded raster → polygon records with per-year history attached.
use log::info;

use super::trace::{to_world, trace_regions};
use super::{PolygonLayer, PolygonRecord};
use crate::raster::CodedRaster;
use crate::signature::lookup::LookupTable;

/// One record per 4-connected region of constant code, nodata excluded.
/// Records come out in row-major order of each region's first pixel.
pub fn vectorize(coded: &CodedRaster, lookup: &LookupTable) -> PolygonLayer {
    let transform = coded.transform;
    let mut layer = PolygonLayer::new(lookup.years.clone(), coded.crs.clone());
    let mut missing = 0usize;

    for region in trace_regions(coded) {
        let entry = lookup.get(region.code);
        if entry.is_none() {
            missing += 1;
        }
        for lattice in &region.polygons {
            let geometry = to_world(lattice, |x, y| transform.apply(x, y));
            let record = PolygonRecord::new(region.code, geometry, entry);
            if record.area > 0.0 {
                layer.records.push(record);
            }
        }
    }

    if missing > 0 {
        info!("{missing} regions had codes absent from the lookup; year values left null");
    }
    info!("vectorized {}x{} raster into {} polygons", coded.width, coded.height, layer.len());
    layer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{GeoTransform, Raster};
    use crate::signature::lookup::LookupEntry;
    use crate::signature::NODATA_CODE;
    use approx::assert_relative_eq;

    fn lookup() -> LookupTable {
        let mut t = LookupTable::new(vec![2020, 2021]);
        t.insert(0, LookupEntry::from_values(vec![1, 1], 45));
        t.insert(1, LookupEntry::from_values(vec![5, 45], 45));
        t
    }

    #[rustfmt::skip]
    fn coded() -> CodedRaster {
        Raster::from_vec(vec![
            0, 0, 1, 1,
            0, 1, 1, 0,
            2, 2, 0, 0,
        ], 4, 3, GeoTransform::north_up(1000.0, 2000.0, 30.0), Some("EPSG:5070".into()))
        .unwrap()
    }

    #[test]
    fn areas_cover_every_pixel() {
        let layer = vectorize(&coded(), &lookup());
        assert_relative_eq!(layer.total_area(), 12.0 * 900.0, max_relative = 1e-12);
        assert_eq!(layer.crs.as_deref(), Some("EPSG:5070"));
    }

    #[test]
    fn disjoint_regions_of_one_code_stay_separate() {
        let layer = vectorize(&coded(), &lookup());
        let zeros: Vec<_> = layer.records.iter().filter(|r| r.code == 0).collect();
        assert_eq!(zeros.len(), 2);
        assert_relative_eq!(zeros[0].area, 3.0 * 900.0);
        assert_relative_eq!(zeros[1].area, 3.0 * 900.0);
    }

    #[test]
    fn missing_code_yields_nulls_and_zero_counts() {
        let layer = vectorize(&coded(), &lookup());
        let unknown = layer.records.iter().find(|r| r.code == 2).unwrap();
        assert_eq!(unknown.values, None);
        assert_eq!((unknown.count0, unknown.count45), (0, 0));
        let known = layer.records.iter().find(|r| r.code == 1).unwrap();
        assert_eq!(known.values.as_deref(), Some(&[5u8, 45][..]));
        assert_eq!((known.count0, known.count45), (2, 1));
    }

    #[test]
    fn nodata_is_excluded() {
        let mut r = coded().with_nodata(Some(NODATA_CODE));
        r.set(2, 0, NODATA_CODE);
        r.set(2, 1, NODATA_CODE);
        let layer = vectorize(&r, &lookup());
        assert!(layer.records.iter().all(|p| p.code != NODATA_CODE && p.code != 2));
        assert_relative_eq!(layer.total_area(), 10.0 * 900.0, max_relative = 1e-12);
    }

    #[test]
    fn repeated_runs_are_identical() {
        assert_eq!(vectorize(&coded(), &lookup()), vectorize(&coded(), &lookup()));
    }
}
