//! Overlapping tile grids over a projected extent.
pub mod orchestrator;

use serde::{Deserialize, Serialize};

use crate::error::{CropSeqError, Result};
use crate::raster::Bounds;

/// One tile of the grid. `idx` is the row-major position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tile {
    pub idx: usize,
    pub row: usize,
    pub col: usize,
    pub bounds: Bounds,
}

impl Tile {
    /// Working sub-directory name, e.g. `tile_0007`.
    pub fn dir_name(&self) -> String {
        format!("tile_{:04}", self.idx)
    }
}

/// Tiles of `tile_size` stepping by `tile_size − overlap` from the extent's
/// minimum corner, row-major with rows along y. Bounds are clipped to the
/// extent, so the last row and column may be narrower.
pub fn generate_tiles(extent: &Bounds, tile_size: f64, overlap: f64) -> Result<Vec<Tile>> {
    let step = tile_size - overlap;
    if !(step > 0.0) || !tile_size.is_finite() {
        return Err(CropSeqError::InvalidTiling { tile_size, overlap });
    }

    let mut tiles = Vec::new();
    let mut y = extent.min_y;
    let mut row = 0;
    while y < extent.max_y {
        let mut x = extent.min_x;
        let mut col = 0;
        while x < extent.max_x {
            tiles.push(Tile {
                idx: tiles.len(),
                row,
                col,
                bounds: Bounds::new(x, y, (x + tile_size).min(extent.max_x), (y + tile_size).min(extent.max_y)),
            });
            x += step;
            col += 1;
        }
        y += step;
        row += 1;
    }
    Ok(tiles)
}
