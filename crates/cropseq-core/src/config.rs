//! Run parameters for the whole-extent and tiled pipelines.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::eliminate::EliminateParams;
use crate::error::Result;
use crate::vector::filter::CropPresenceFilter;

/// All tunables of a run. Missing JSON fields fall back to [`Default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineParams {
    pub start_year: u16,
    pub end_year: u16,
    /// Prefix of the per-year output columns, e.g. `cdl_2020`.
    pub year_prefix: String,
    /// Category counted as barren in `count45`.
    pub barren_value: u8,
    pub min_crop_years: i64,
    /// Minimum area for a polygon with a single crop year to survive.
    pub min_area_single_year: f64,
    /// Elimination tiers for the whole-extent pipeline, ascending.
    pub eliminate_thresholds: Vec<f64>,
    pub max_iterations: usize,
    /// Douglas–Peucker tolerance in CRS units; 0 disables simplification.
    pub simplify_tolerance: f64,
    /// Encoder window edge in pixels.
    pub window_size: usize,
    /// Tile edge in CRS units.
    pub tile_size: f64,
    pub tile_overlap: f64,
    /// Elimination tiers applied per tile.
    pub tile_thresholds: Vec<f64>,
    /// Tile worker count; 0 uses available parallelism.
    pub workers: usize,
    pub keep_intermediates: bool,
    /// Translate tile codes into one shared signature table.
    pub global_lookup: bool,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            start_year: 2017,
            end_year: 2024,
            year_prefix: "cdl".to_string(),
            barren_value: 45,
            min_crop_years: 2,
            min_area_single_year: 10_000.0,
            eliminate_thresholds: vec![100.0, 1_000.0, 10_000.0],
            max_iterations: 10,
            simplify_tolerance: 60.0,
            window_size: 4096,
            tile_size: 50_000.0,
            tile_overlap: 1_000.0,
            tile_thresholds: vec![100.0, 1_000.0, 5_000.0],
            workers: 0,
            keep_intermediates: false,
            global_lookup: false,
        }
    }
}

impl PipelineParams {
    /// Load from a JSON file; a missing path yields the defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn years(&self) -> Vec<u16> {
        (self.start_year..=self.end_year).collect()
    }

    pub fn filter(&self) -> CropPresenceFilter {
        CropPresenceFilter {
            min_crop_years: self.min_crop_years,
            min_area_single_year: self.min_area_single_year,
        }
    }

    pub fn eliminate_params(&self, thresholds: &[f64]) -> EliminateParams {
        EliminateParams {
            thresholds: thresholds.to_vec(),
            max_iterations: self.max_iterations,
        }
    }

    /// Worker count with 0 resolved against the machine.
    pub fn resolved_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism().map_or(1, |n| n.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let p: PipelineParams = serde_json::from_str(r#"{"start_year": 2020, "global_lookup": true}"#).unwrap();
        assert_eq!(p.start_year, 2020);
        assert!(p.global_lookup);
        assert_eq!(p.end_year, 2024);
        assert_eq!(p.tile_thresholds, vec![100.0, 1_000.0, 5_000.0]);
        assert_eq!(p.years().len(), 5);
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let p = PipelineParams::from_json_file(dir.path().join("absent.json")).unwrap();
        assert_eq!(p, PipelineParams::default());

        let path = dir.path().join("params.json");
        fs::write(&path, r#"{"simplify_tolerance": 0.0}"#).unwrap();
        assert_eq!(PipelineParams::from_json_file(&path).unwrap().simplify_tolerance, 0.0);
    }

    #[test]
    fn workers_resolve_to_positive() {
        let p = PipelineParams::default();
        assert!(p.resolved_workers() >= 1);
        let p = PipelineParams { workers: 3, ..Default::default() };
        assert_eq!(p.resolved_workers(), 3);
    }
}
