//! Polygon records and the raster → polygon stages.
pub mod filter;
pub mod geojson;
pub mod geometry;
pub mod simplify;
pub mod trace;
pub mod vectorize;

use geo::{Area, Polygon};
use log::warn;

use crate::signature::lookup::LookupEntry;
use crate::stats::RunStats;
use geometry::{is_valid, repair};

/// One output feature: a region of constant signature code.
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonRecord {
    pub code: u32,
    pub geometry: Polygon<f64>,
    /// Planar area of `geometry`, kept in sync by every stage that edits it.
    pub area: f64,
    /// Per-year categories; `None` when the code had no lookup entry.
    pub values: Option<Vec<u8>>,
    pub count0: u32,
    pub count45: u32,
}

impl PolygonRecord {
    /// Build a record and copy history from `entry`. A missing entry leaves
    /// the year values null and both counts at zero.
    pub fn new(code: u32, geometry: Polygon<f64>, entry: Option<&LookupEntry>) -> Self {
        let area = geometry.unsigned_area();
        Self {
            code,
            geometry,
            area,
            values: entry.map(|e| e.values.clone()),
            count0: entry.map_or(0, |e| e.count0),
            count45: entry.map_or(0, |e| e.count45),
        }
    }

    pub fn set_geometry(&mut self, geometry: Polygon<f64>) {
        self.area = geometry.unsigned_area();
        self.geometry = geometry;
    }

    pub fn net_crop_years(&self) -> i64 {
        i64::from(self.count0) - i64::from(self.count45)
    }
}

/// A polygon set sharing one year list and CRS.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolygonLayer {
    pub years: Vec<u16>,
    pub crs: Option<String>,
    pub records: Vec<PolygonRecord>,
}

impl PolygonLayer {
    pub fn new(years: Vec<u16>, crs: Option<String>) -> Self {
        Self { years, crs, records: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_area(&self) -> f64 {
        self.records.iter().map(|r| r.area).sum()
    }

    /// Repair invalid geometries in place and drop the ones that cannot be
    /// repaired.
    pub fn ensure_valid(&mut self, stats: &mut RunStats) {
        let before = self.records.len();
        let mut repaired = 0;
        self.records.retain_mut(|r| {
            if is_valid(&r.geometry) {
                return true;
            }
            match repair(&r.geometry) {
                Some(fixed) => {
                    r.set_geometry(fixed);
                    repaired += 1;
                    true
                }
                None => false,
            }
        });
        let dropped = before - self.records.len();
        stats.geometry_repaired += repaired;
        stats.geometry_dropped += dropped;
        if dropped > 0 {
            warn!("dropped {dropped} polygons with unrepairable geometry");
        }
    }
}
