//! Categorical rasters, pixel windows and per-year stacks.
//!
//! Grids are row-major with row 0 at the top of the image (north for the
//! usual north-up transform). Coordinate math uses f64.
pub mod geotiff;
pub mod paths;

use serde::{Deserialize, Serialize};

use crate::error::{CropSeqError, Result};

// ── Georeferencing ───────────────────────────────────────────────────────────

/// Affine pixel → coordinate transform in GDAL coefficient order:
///
///   x = origin_x + col · pixel_width  + row · row_rotation
///   y = origin_y + col · col_rotation + row · pixel_height
///
/// `pixel_height` is negative for north-up rasters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub pixel_width: f64,
    pub row_rotation: f64,
    pub origin_y: f64,
    pub col_rotation: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square pixels of `pixel_size` units.
    pub fn north_up(origin_x: f64, origin_y: f64, pixel_size: f64) -> Self {
        Self {
            origin_x,
            pixel_width: pixel_size,
            row_rotation: 0.0,
            origin_y,
            col_rotation: 0.0,
            pixel_height: -pixel_size,
        }
    }

    /// Map a (fractional) pixel-corner position to coordinates.
    #[inline]
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width + row * self.row_rotation,
            self.origin_y + col * self.col_rotation + row * self.pixel_height,
        )
    }

    /// Transform of the sub-grid starting at `window`'s top-left pixel.
    pub fn for_window(&self, window: &PixelWindow) -> Self {
        let (x, y) = self.apply(window.col_off as f64, window.row_off as f64);
        Self {
            origin_x: x,
            origin_y: y,
            ..*self
        }
    }

    /// Planar area of one pixel.
    pub fn pixel_area(&self) -> f64 {
        (self.pixel_width * self.pixel_height - self.row_rotation * self.col_rotation).abs()
    }

    /// Bounds covered by a `width` × `height` grid under this transform.
    pub fn bounds(&self, width: usize, height: usize) -> Bounds {
        let corners = [
            self.apply(0.0, 0.0),
            self.apply(width as f64, 0.0),
            self.apply(0.0, height as f64),
            self.apply(width as f64, height as f64),
        ];
        let mut b = Bounds::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (x, y) in corners {
            b.min_x = b.min_x.min(x);
            b.min_y = b.min_y.min(y);
            b.max_x = b.max_x.max(x);
            b.max_y = b.max_y.max(y);
        }
        b
    }

    /// Pixel window covering `bounds`, truncated to whole pixels and clipped
    /// to a `width` × `height` grid. Only axis-aligned transforms are
    /// supported; returns `None` for rotated grids or an empty intersection.
    pub fn window_for_bounds(&self, bounds: &Bounds, width: usize, height: usize) -> Option<PixelWindow> {
        if self.row_rotation != 0.0 || self.col_rotation != 0.0 {
            return None;
        }
        let (c0, c1) = ordered(
            (bounds.min_x - self.origin_x) / self.pixel_width,
            (bounds.max_x - self.origin_x) / self.pixel_width,
        );
        let (r0, r1) = ordered(
            (bounds.min_y - self.origin_y) / self.pixel_height,
            (bounds.max_y - self.origin_y) / self.pixel_height,
        );

        let col_off = c0.max(0.0).trunc() as usize;
        let row_off = r0.max(0.0).trunc() as usize;
        let col_end = (c1.max(0.0).trunc() as usize).min(width);
        let row_end = (r1.max(0.0).trunc() as usize).min(height);
        if col_off >= col_end || row_off >= row_end {
            return None;
        }
        Some(PixelWindow::new(col_off, row_off, col_end - col_off, row_end - row_off))
    }
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self::north_up(0.0, 0.0, 1.0)
    }
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Axis-aligned rectangle in projected coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

// ── Windows ──────────────────────────────────────────────────────────────────

/// Rectangular block of pixels inside a larger grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelWindow {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

impl PixelWindow {
    pub fn new(col_off: usize, row_off: usize, width: usize, height: usize) -> Self {
        Self { col_off, row_off, width, height }
    }

    pub fn full(width: usize, height: usize) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Fail unless the window lies inside a `width` × `height` grid.
    pub fn check_within(&self, width: usize, height: usize) -> Result<()> {
        if self.col_off + self.width > width || self.row_off + self.height > height {
            return Err(CropSeqError::WindowOutOfBounds {
                col_off: self.col_off,
                row_off: self.row_off,
                width: self.width,
                height: self.height,
                raster_width: width,
                raster_height: height,
            });
        }
        Ok(())
    }
}

/// Non-overlapping `size` × `size` windows covering a grid, row-major.
/// Edge windows are truncated to the grid.
pub fn generate_windows(width: usize, height: usize, size: usize) -> Vec<PixelWindow> {
    let size = size.max(1);
    let mut out = Vec::new();
    let mut row = 0;
    while row < height {
        let mut col = 0;
        while col < width {
            out.push(PixelWindow::new(col, row, size.min(width - col), size.min(height - row)));
            col += size;
        }
        row += size;
    }
    out
}

// ── Raster grid ──────────────────────────────────────────────────────────────

/// A georeferenced single-band grid, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Raster<T> {
    pub data: Vec<T>,
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    /// CRS identifier, e.g. `EPSG:5070`.
    pub crs: Option<String>,
    pub nodata: Option<T>,
}

/// Per-year land-cover categories (0–255).
pub type CategoryRaster = Raster<u8>;

/// Signature codes produced by the encoder.
pub type CodedRaster = Raster<u32>;

impl<T: Copy + PartialEq> Raster<T> {
    /// Create a raster filled with `fill`.
    pub fn new(width: usize, height: usize, transform: GeoTransform, crs: Option<String>, fill: T) -> Self {
        Self {
            data: vec![fill; width * height],
            width,
            height,
            transform,
            crs,
            nodata: None,
        }
    }

    /// Wrap an existing row-major buffer.
    pub fn from_vec(
        data: Vec<T>,
        width: usize,
        height: usize,
        transform: GeoTransform,
        crs: Option<String>,
    ) -> Result<Self> {
        if data.len() != width * height {
            return Err(CropSeqError::BufferMismatch {
                expected: width * height,
                actual: data.len(),
            });
        }
        Ok(Self { data, width, height, transform, crs, nodata: None })
    }

    pub fn with_nodata(mut self, nodata: Option<T>) -> Self {
        self.nodata = nodata;
        self
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[row * self.width + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, val: T) {
        self.data[row * self.width + col] = val;
    }

    #[inline]
    pub fn is_nodata(&self, val: T) -> bool {
        self.nodata == Some(val)
    }

    pub fn bounds(&self) -> Bounds {
        self.transform.bounds(self.width, self.height)
    }

    /// Copy of the pixels under `window`, with the window's transform.
    pub fn window(&self, window: &PixelWindow) -> Result<Self> {
        window.check_within(self.width, self.height)?;
        let mut data = Vec::with_capacity(window.pixel_count());
        for r in window.row_off..window.row_off + window.height {
            let start = r * self.width + window.col_off;
            data.extend_from_slice(&self.data[start..start + window.width]);
        }
        Ok(Self {
            data,
            width: window.width,
            height: window.height,
            transform: self.transform.for_window(window),
            crs: self.crs.clone(),
            nodata: self.nodata,
        })
    }

    /// Write `block` into this raster with its top-left pixel at
    /// (`col_off`, `row_off`).
    pub fn write_block(&mut self, col_off: usize, row_off: usize, block: &Raster<T>) -> Result<()> {
        PixelWindow::new(col_off, row_off, block.width, block.height)
            .check_within(self.width, self.height)?;
        for r in 0..block.height {
            let dst = (row_off + r) * self.width + col_off;
            let src = r * block.width;
            self.data[dst..dst + block.width].copy_from_slice(&block.data[src..src + block.width]);
        }
        Ok(())
    }
}

// ── Sources ──────────────────────────────────────────────────────────────────

/// Anything a per-year category grid can be read from, one window at a time.
pub trait RasterSource: Sync {
    fn width(&self) -> usize;
    fn height(&self) -> usize;
    fn transform(&self) -> GeoTransform;
    fn crs(&self) -> Option<String>;
    fn nodata(&self) -> Option<u8>;
    fn read_window(&self, window: &PixelWindow) -> Result<CategoryRaster>;
}

impl RasterSource for CategoryRaster {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn transform(&self) -> GeoTransform {
        self.transform
    }

    fn crs(&self) -> Option<String> {
        self.crs.clone()
    }

    fn nodata(&self) -> Option<u8> {
        self.nodata
    }

    fn read_window(&self, window: &PixelWindow) -> Result<CategoryRaster> {
        self.window(window)
    }
}

// ── Stack ────────────────────────────────────────────────────────────────────

/// Ordered per-year rasters sharing one shape and transform.
#[derive(Debug, Clone)]
pub struct Stack {
    pub years: Vec<u16>,
    pub layers: Vec<CategoryRaster>,
}

impl Stack {
    /// Build a stack, checking that every layer matches the first.
    pub fn new(years: Vec<u16>, layers: Vec<CategoryRaster>) -> Result<Self> {
        let Some(first) = layers.first() else {
            return Err(CropSeqError::EmptyStack);
        };
        if years.len() != layers.len() {
            return Err(CropSeqError::YearCountMismatch {
                years: years.len(),
                layers: layers.len(),
            });
        }
        for layer in &layers[1..] {
            if layer.width != first.width || layer.height != first.height {
                return Err(CropSeqError::ShapeMismatch {
                    expected_width: first.width,
                    expected_height: first.height,
                    width: layer.width,
                    height: layer.height,
                });
            }
            if layer.transform != first.transform {
                return Err(CropSeqError::TransformMismatch);
            }
        }
        Ok(Self { years, layers })
    }

    /// Read `window` from every year's source, in year order.
    pub fn read<S: RasterSource + ?Sized>(sources: &[(u16, &S)], window: &PixelWindow) -> Result<Self> {
        let mut years = Vec::with_capacity(sources.len());
        let mut layers = Vec::with_capacity(sources.len());
        for (year, source) in sources {
            years.push(*year);
            layers.push(source.read_window(window)?);
        }
        Self::new(years, layers)
    }

    pub fn n_years(&self) -> usize {
        self.layers.len()
    }

    pub fn width(&self) -> usize {
        self.layers[0].width
    }

    pub fn height(&self) -> usize {
        self.layers[0].height
    }

    pub fn transform(&self) -> GeoTransform {
        self.layers[0].transform
    }

    pub fn crs(&self) -> Option<String> {
        self.layers[0].crs.clone()
    }

    /// Nodata value shared by all layers, if every layer declares the same one.
    pub fn nodata(&self) -> Option<u8> {
        let nd = self.layers[0].nodata?;
        self.layers.iter().all(|l| l.nodata == Some(nd)).then_some(nd)
    }

    /// True when no layer holds a non-background (non-zero, non-nodata) pixel.
    pub fn is_empty_of_data(&self) -> bool {
        self.layers
            .iter()
            .all(|l| l.data.iter().all(|&v| v == 0 || l.is_nodata(v)))
    }

    /// Per-year values at one pixel, year order.
    pub fn pixel_values(&self, idx: usize, out: &mut [u8]) {
        for (slot, layer) in out.iter_mut().zip(&self.layers) {
            *slot = layer.data[idx];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid(width: usize, height: usize) -> CategoryRaster {
        let data = (0..width * height).map(|i| i as u8).collect();
        Raster::from_vec(data, width, height, GeoTransform::north_up(100.0, 500.0, 30.0), Some("EPSG:5070".into()))
            .unwrap()
    }

    #[test]
    fn transform_maps_corners() {
        let t = GeoTransform::north_up(100.0, 500.0, 30.0);
        assert_eq!(t.apply(0.0, 0.0), (100.0, 500.0));
        assert_eq!(t.apply(2.0, 1.0), (160.0, 470.0));
        assert_relative_eq!(t.pixel_area(), 900.0);
        let b = t.bounds(4, 3);
        assert_eq!(b, Bounds::new(100.0, 410.0, 220.0, 500.0));
    }

    #[test]
    fn window_for_bounds_truncates_and_clips() {
        let t = GeoTransform::north_up(0.0, 300.0, 30.0);
        // x 45..200 → cols 1.5..6.67 → 1..6; y 100..290 → rows 0.33..6.67 → 0..6.
        let w = t.window_for_bounds(&Bounds::new(45.0, 100.0, 200.0, 290.0), 5, 10).unwrap();
        assert_eq!(w, PixelWindow::new(1, 0, 4, 6));
        assert!(t.window_for_bounds(&Bounds::new(1000.0, 0.0, 1100.0, 10.0), 5, 10).is_none());
    }

    #[test]
    fn window_copy_and_write_back() {
        let r = grid(5, 4);
        let w = PixelWindow::new(1, 2, 3, 2);
        let sub = r.window(&w).unwrap();
        assert_eq!(sub.data, vec![11, 12, 13, 16, 17, 18]);
        assert_eq!(sub.transform.origin_x, 130.0);
        assert_eq!(sub.transform.origin_y, 440.0);

        let mut target = Raster::new(5, 4, r.transform, None, 0u8);
        target.write_block(1, 2, &sub).unwrap();
        assert_eq!(target.get(3, 3), 18);
        assert_eq!(target.get(0, 0), 0);
        assert!(target.write_block(4, 3, &sub).is_err());
    }

    #[test]
    fn generate_windows_covers_grid_once() {
        let ws = generate_windows(10, 7, 4);
        assert_eq!(ws.len(), 3 * 2);
        assert_eq!(ws[2], PixelWindow::new(8, 0, 2, 4));
        assert_eq!(ws[5], PixelWindow::new(8, 4, 2, 3));
        let total: usize = ws.iter().map(|w| w.pixel_count()).sum();
        assert_eq!(total, 70);
    }

    #[test]
    fn stack_rejects_mismatched_layers() {
        let a = grid(5, 4);
        let b = grid(4, 4);
        assert!(matches!(
            Stack::new(vec![2020, 2021], vec![a.clone(), b]),
            Err(CropSeqError::ShapeMismatch { .. })
        ));
        let mut c = a.clone();
        c.transform.origin_x += 1.0;
        assert!(matches!(Stack::new(vec![2020, 2021], vec![a, c]), Err(CropSeqError::TransformMismatch)));
        assert!(matches!(Stack::new(vec![], vec![]), Err(CropSeqError::EmptyStack)));
    }

    #[test]
    fn empty_stack_detection_ignores_nodata() {
        let t = GeoTransform::default();
        let zeros = Raster::new(3, 3, t, None, 0u8);
        let mut filled = Raster::new(3, 3, t, None, 255u8).with_nodata(Some(255));
        let stack = Stack::new(vec![2020, 2021], vec![zeros.clone(), filled.clone()]).unwrap();
        assert!(stack.is_empty_of_data());

        filled.set(1, 1, 5);
        let stack = Stack::new(vec![2020, 2021], vec![zeros, filled]).unwrap();
        assert!(!stack.is_empty_of_data());
    }
}
