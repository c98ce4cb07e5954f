//! Error type shared by every stage of the crop-sequence pipeline.
//!
//! Only conditions that must stop a run surface as `Err`. Recoverable
//! per-feature, per-iteration and per-tile problems are counted in
//! [`crate::stats::RunStats`] instead.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CropSeqError {
    #[error("no raster found for year {year} (searched {searched:?})")]
    InputNotFound { year: u16, searched: Vec<PathBuf> },

    #[error("{years} years cannot be packed into a 64-bit signature (max {max})")]
    EncodingOverflow { years: usize, max: usize },

    #[error("signature table is full: more than {0} distinct signatures")]
    CodeSpaceExhausted(u32),

    #[error("raster shape mismatch: expected {expected_width}x{expected_height}, got {width}x{height}")]
    ShapeMismatch {
        expected_width: usize,
        expected_height: usize,
        width: usize,
        height: usize,
    },

    #[error("buffer holds {actual} pixels, raster needs {expected}")]
    BufferMismatch { expected: usize, actual: usize },

    #[error("{years} years given for {layers} raster layers")]
    YearCountMismatch { years: usize, layers: usize },

    #[error("rasters in a stack must share one geotransform")]
    TransformMismatch,

    #[error("stack must contain at least one year")]
    EmptyStack,

    #[error("window {col_off},{row_off} {width}x{height} exceeds raster {raster_width}x{raster_height}")]
    WindowOutOfBounds {
        col_off: usize,
        row_off: usize,
        width: usize,
        height: usize,
        raster_width: usize,
        raster_height: usize,
    },

    #[error("unsupported pixel type in {0}: expected single-band 8-bit categories")]
    UnsupportedPixelType(PathBuf),

    #[error("invalid tiling: tile size {tile_size} with overlap {overlap} gives a non-positive step")]
    InvalidTiling { tile_size: f64, overlap: f64 },

    #[error("invalid lookup sidecar: {0}")]
    InvalidLookup(String),

    #[error("invalid polygon file: {0}")]
    InvalidGeoJson(String),

    #[error("no tile produced output")]
    EmptyMosaic,

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CropSeqError>;
