//! Douglas–Peucker simplification with validity repair.
use geo::Simplify;
use log::{info, warn};

use super::geometry::{is_valid, repair};
use super::PolygonLayer;
use crate::stats::RunStats;

/// Simplify every record with `tolerance` (CRS units). Results that come
/// out invalid are repaired; records that cannot be repaired are dropped.
/// A non-positive tolerance leaves the layer untouched.
pub fn simplify_layer(layer: &mut PolygonLayer, tolerance: f64, stats: &mut RunStats) {
    if tolerance <= 0.0 {
        return;
    }
    let before = layer.len();
    let mut repaired = 0;
    layer.records.retain_mut(|record| {
        let simplified = record.geometry.simplify(&tolerance);
        if is_valid(&simplified) {
            record.set_geometry(simplified);
            return true;
        }
        match repair(&simplified) {
            Some(fixed) => {
                repaired += 1;
                record.set_geometry(fixed);
                true
            }
            None => false,
        }
    });
    let dropped = before - layer.len();
    stats.geometry_repaired += repaired;
    stats.simplify_dropped += dropped;
    if dropped > 0 {
        warn!("simplification dropped {dropped} polygons that could not be repaired");
    }
    info!("simplified {} polygons at tolerance {tolerance} ({repaired} repaired)", layer.len());
}
