//! Whole-extent and tiled drivers.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::config::PipelineParams;
use crate::eliminate::{tiered_eliminate, TierReport};
use crate::error::{CropSeqError, Result};
use crate::raster::geotiff::write_coded_raster;
use crate::raster::RasterSource;
use crate::signature::lookup::LookupTable;
use crate::signature::{encode_windowed, SignatureTable};
use crate::stats::RunStats;
use crate::tiling::generate_tiles;
use crate::tiling::orchestrator::{merge_tile_outputs, processed_outputs, write_shared_lookup, TileOrchestrator, TileOutcome};
use crate::vector::geojson::write_geojson;
use crate::vector::simplify::simplify_layer;
use crate::vector::vectorize::vectorize;
use crate::vector::PolygonLayer;

pub const CODED_FILE: &str = "coded.tif";
pub const LOOKUP_FILE: &str = "lookup.json";
pub const POLYGON_FILE: &str = "polygons.geojson";

// ── Results ──────────────────────────────────────────────────────────────────

/// Output of a whole-extent run.
pub struct CreateResult {
    pub layer: PolygonLayer,
    pub lookup: LookupTable,
    pub tiers: Vec<TierReport>,
    pub stats: RunStats,
    pub coded_path: PathBuf,
    pub lookup_path: PathBuf,
    pub polygons_path: PathBuf,
}

/// Output of a tiled run.
pub struct TiledResult {
    pub layer: PolygonLayer,
    pub outcomes: Vec<TileOutcome>,
    pub stats: RunStats,
    pub polygons_path: PathBuf,
    /// Shared lookup, written only for `global_lookup` runs.
    pub lookup_path: Option<PathBuf>,
}

// ── Driver ───────────────────────────────────────────────────────────────────

pub struct FieldPipeline<'a> {
    params: &'a PipelineParams,
}

impl<'a> FieldPipeline<'a> {
    pub fn new(params: &'a PipelineParams) -> Self {
        Self { params }
    }

    /// Run the whole extent in one pass, writing the coded raster, the
    /// lookup sidecar and the polygons into `out_dir`.
    ///
    /// Pipeline order:
    ///   1. Windowed encoding with one signature table for the run
    ///   2. Vectorization and validity check
    ///   3. Crop-presence filter
    ///   4. Tiered elimination
    ///   5. Simplification
    ///   6. Polygon output
    pub fn create<S: RasterSource + ?Sized>(&self, sources: &[(u16, &S)], out_dir: &Path) -> Result<CreateResult> {
        let p = self.params;
        let years: Vec<u16> = sources.iter().map(|(y, _)| *y).collect();
        let mut stats = RunStats::default();
        fs::create_dir_all(out_dir)?;

        // ── 1. Encoding ─────────────────────────────────────────────────────
        let mut table = SignatureTable::new(sources.len(), p.barren_value)?;
        let coded = encode_windowed(sources, p.window_size, &mut table)?;
        let lookup = table.to_lookup(&years);
        drop(table);
        info!("{} distinct signatures over {} years", lookup.len(), years.len());

        let coded_path = out_dir.join(CODED_FILE);
        let lookup_path = out_dir.join(LOOKUP_FILE);
        write_coded_raster(&coded_path, &coded)?;
        lookup.write(&lookup_path)?;

        // ── 2. Vectorization ────────────────────────────────────────────────
        let mut layer = vectorize(&coded, &lookup);
        drop(coded);
        stats.polygons_vectorized = layer.len();
        layer.ensure_valid(&mut stats);
        info!("vectorized {} polygons", layer.len());

        // ── 3. Crop-presence filter ─────────────────────────────────────────
        stats.polygons_filtered_out = p.filter().apply(&mut layer);
        info!("{} polygons after crop-presence filter", layer.len());

        // ── 4. Tiered elimination ───────────────────────────────────────────
        let tiers = tiered_eliminate(&mut layer, &p.eliminate_params(&p.eliminate_thresholds), &mut stats);

        // ── 5. Simplification ───────────────────────────────────────────────
        simplify_layer(&mut layer, p.simplify_tolerance, &mut stats);

        // ── 6. Output ───────────────────────────────────────────────────────
        stats.polygons_out = layer.len();
        let polygons_path = out_dir.join(POLYGON_FILE);
        write_geojson(&polygons_path, &layer, &p.year_prefix)?;
        info!("wrote {} polygons to {}", layer.len(), polygons_path.display());

        Ok(CreateResult { layer, lookup, tiers, stats, coded_path, lookup_path, polygons_path })
    }

    /// Tile the sources' extent, process every tile (at most `max_tiles`)
    /// and reconcile the results into `work_dir/polygons.geojson`.
    pub fn tiled<S: RasterSource + ?Sized>(
        &self,
        sources: &[(u16, &S)],
        work_dir: &Path,
        max_tiles: Option<usize>,
    ) -> Result<TiledResult> {
        let p = self.params;
        let Some((_, first)) = sources.first() else {
            return Err(CropSeqError::EmptyStack);
        };
        fs::create_dir_all(work_dir)?;

        let extent = first.transform().bounds(first.width(), first.height());
        let mut tiles = generate_tiles(&extent, p.tile_size, p.tile_overlap)?;
        if let Some(max) = max_tiles {
            tiles.truncate(max);
        }

        let orchestrator = TileOrchestrator::new(sources.to_vec(), p, work_dir)?;
        let (outcomes, mut stats) = orchestrator.run(&tiles);
        let layer = merge_tile_outputs(&processed_outputs(&outcomes), &p.year_prefix, &mut stats)?;

        let polygons_path = work_dir.join(POLYGON_FILE);
        write_geojson(&polygons_path, &layer, &p.year_prefix)?;
        let lookup_path = match orchestrator.shared_lookup() {
            Some(lookup) => Some(write_shared_lookup(&lookup, work_dir)?),
            None => None,
        };
        info!("wrote {} polygons to {}", layer.len(), polygons_path.display());

        Ok(TiledResult { layer, outcomes, stats, polygons_path, lookup_path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::geotiff::read_coded_raster;
    use crate::raster::{CategoryRaster, GeoTransform, Raster};
    use crate::vector::geojson::read_geojson;
    use approx::assert_relative_eq;

    /// Four 300 m fields on a 30 m grid, plus a 2×2 patch with its own
    /// signature inside the top-left field.
    fn years() -> (CategoryRaster, CategoryRaster) {
        let t = GeoTransform::north_up(0.0, 600.0, 30.0);
        let crs = Some("EPSG:5070".to_string());
        let mut y0 = Raster::new(20, 20, t, crs.clone(), 0u8);
        let mut y1 = Raster::new(20, 20, t, crs, 0u8);
        for r in 0..20 {
            for c in 0..20 {
                y0.set(r, c, if c < 10 { 1 } else { 5 });
                y1.set(r, c, if r < 10 { 1 } else { 24 });
            }
        }
        for r in 2..4 {
            for c in 2..4 {
                y0.set(r, c, 3);
                y1.set(r, c, 3);
            }
        }
        (y0, y1)
    }

    fn params() -> PipelineParams {
        PipelineParams {
            start_year: 2020,
            end_year: 2021,
            window_size: 7,
            tile_size: 300.0,
            tile_overlap: 0.0,
            workers: 2,
            ..Default::default()
        }
    }

    #[test]
    fn create_absorbs_patch_and_writes_outputs() {
        let (a, b) = years();
        let p = params();
        let dir = tempfile::tempdir().unwrap();
        let result = FieldPipeline::new(&p).create(&[(2020, &a), (2021, &b)], dir.path()).unwrap();

        assert_eq!(result.lookup.len(), 5);
        assert_eq!(result.stats.polygons_vectorized, 5);
        assert_eq!(result.stats.polygons_merged, 1);
        assert_eq!(result.layer.len(), 4);
        assert_eq!(result.stats.polygons_out, 4);
        assert!(result.tiers.iter().all(|t| t.converged));
        for r in &result.layer.records {
            assert_relative_eq!(r.area, 90_000.0, max_relative = 1e-9);
        }

        let coded = read_coded_raster(&result.coded_path).unwrap();
        assert_eq!((coded.width, coded.height), (20, 20));
        assert_eq!(LookupTable::read(&result.lookup_path).unwrap(), result.lookup);
        let back = read_geojson(&result.polygons_path, "cdl").unwrap();
        assert_eq!(back.len(), 4);
        assert_eq!(back.crs.as_deref(), Some("EPSG:5070"));
    }

    #[test]
    fn tiled_run_with_shared_lookup() {
        let (a, b) = years();
        let p = PipelineParams { global_lookup: true, ..params() };
        let dir = tempfile::tempdir().unwrap();
        let result = FieldPipeline::new(&p).tiled(&[(2020, &a), (2021, &b)], dir.path(), None).unwrap();

        assert_eq!(result.stats.tiles_total, 4);
        assert_eq!(result.stats.tiles_processed, 4);
        assert_eq!(result.layer.len(), 4);
        let lookup = LookupTable::read(result.lookup_path.unwrap()).unwrap();
        assert_eq!(lookup.len(), 5);
        assert!(result.polygons_path.exists());
    }

    #[test]
    fn max_tiles_caps_the_run() {
        let (a, b) = years();
        let p = params();
        let dir = tempfile::tempdir().unwrap();
        let result = FieldPipeline::new(&p).tiled(&[(2020, &a), (2021, &b)], dir.path(), Some(2)).unwrap();
        assert_eq!(result.stats.tiles_total, 2);
        assert_eq!(result.layer.len(), 2);
        assert!(result.lookup_path.is_none());
    }
}
