//! Crop-sequence field boundaries from yearly land-cover rasters.
//!
//! Per-year category grids are packed into temporal signature codes,
//! vectorized into polygons carrying their year-by-year history, filtered
//! for crop presence and cleaned of slivers by tiered elimination. Large
//! extents run tile by tile and are reconciled into one mosaic.

pub mod config;
pub mod eliminate;
pub mod error;
pub mod pipeline;
pub mod raster;
pub mod signature;
pub mod stats;
pub mod tiling;
pub mod vector;

pub use config::PipelineParams;
pub use error::{CropSeqError, Result};
pub use pipeline::{CreateResult, FieldPipeline, TiledResult};
pub use stats::RunStats;
