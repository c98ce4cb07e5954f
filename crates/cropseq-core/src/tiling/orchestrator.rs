//! Per-tile pipeline runs and mosaic reconciliation.
//!
//! Each tile runs encode → vectorize → filter → eliminate → simplify on its
//! own window and writes its polygons under `tile_<idx>/`. Tiles are
//! isolated: a read error, an empty window or a failure anywhere in the
//! tile's pipeline marks that tile skipped and the run carries on.
//!
//! Reconciliation concatenates tile outputs, drops exact duplicates and
//! dissolves records carrying the same signature. Polygons cut by a tile
//! edge are stitched only through that dissolve; no re-vectorisation across
//! seams takes place.
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use geo::Polygon;
use log::{debug, info, warn};
#[cfg(feature = "threading")]
use rayon::prelude::*;

use super::Tile;
use crate::config::PipelineParams;
use crate::eliminate::tiered_eliminate;
use crate::error::{CropSeqError, Result};
use crate::pipeline::{CODED_FILE, LOOKUP_FILE, POLYGON_FILE};
use crate::raster::geotiff::write_coded_raster;
use crate::raster::{CodedRaster, RasterSource, Stack};
use crate::signature::lookup::LookupTable;
use crate::signature::{encode_stack, SignatureTable, NODATA_CODE};
use crate::stats::RunStats;
use crate::vector::geojson::{read_geojson, write_geojson};
use crate::vector::geometry::union_all;
use crate::vector::simplify::simplify_layer;
use crate::vector::vectorize::vectorize;
use crate::vector::{PolygonLayer, PolygonRecord};

#[derive(Debug, Clone, PartialEq)]
pub enum TileStatus {
    /// Polygons written to the given file.
    Processed(PathBuf),
    /// Window outside the rasters, no data, or nothing survived filtering.
    Empty,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct TileOutcome {
    pub tile: Tile,
    pub status: TileStatus,
    pub stats: RunStats,
}

/// Drives the per-tile pipeline over one set of per-year sources.
pub struct TileOrchestrator<'a, S: RasterSource + ?Sized> {
    sources: Vec<(u16, &'a S)>,
    params: &'a PipelineParams,
    work_dir: PathBuf,
    shared: Option<Mutex<SignatureTable>>,
}

impl<'a, S: RasterSource + ?Sized> TileOrchestrator<'a, S> {
    pub fn new(sources: Vec<(u16, &'a S)>, params: &'a PipelineParams, work_dir: impl Into<PathBuf>) -> Result<Self> {
        if sources.is_empty() {
            return Err(CropSeqError::EmptyStack);
        }
        let shared = if params.global_lookup {
            Some(Mutex::new(SignatureTable::new(sources.len(), params.barren_value)?))
        } else {
            None
        };
        Ok(Self { sources, params, work_dir: work_dir.into(), shared })
    }

    pub fn years(&self) -> Vec<u16> {
        self.sources.iter().map(|(y, _)| *y).collect()
    }

    /// Shared lookup of a `global_lookup` run.
    pub fn shared_lookup(&self) -> Option<LookupTable> {
        let years = self.years();
        self.shared
            .as_ref()
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner).to_lookup(&years))
    }

    /// Run one tile, turning every error and panic into a skipped tile.
    pub fn process_tile(&self, tile: &Tile) -> TileOutcome {
        let mut stats = RunStats::default();
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.run_tile(tile, &mut stats)));
        let status = match result {
            Ok(Ok(Some(path))) => {
                stats.tiles_processed = 1;
                TileStatus::Processed(path)
            }
            Ok(Ok(None)) => {
                stats = RunStats { tiles_empty: 1, ..Default::default() };
                TileStatus::Empty
            }
            Ok(Err(e)) => {
                warn!("tile {} failed: {e}", tile.idx);
                stats = RunStats { tiles_failed: 1, ..Default::default() };
                TileStatus::Failed(e.to_string())
            }
            Err(_) => {
                warn!("tile {} panicked; skipped", tile.idx);
                stats = RunStats { tiles_failed: 1, ..Default::default() };
                TileStatus::Failed("panic during tile processing".into())
            }
        };
        stats.tiles_total = 1;
        info!("tile {} ({}, {}): {:?}", tile.idx, tile.row, tile.col, status);
        TileOutcome { tile: *tile, status, stats }
    }

    fn run_tile(&self, tile: &Tile, stats: &mut RunStats) -> Result<Option<PathBuf>> {
        let p = self.params;
        let (_, first) = self.sources[0];
        let Some(window) = first.transform().window_for_bounds(&tile.bounds, first.width(), first.height()) else {
            debug!("tile {}: no pixels inside bounds", tile.idx);
            return Ok(None);
        };

        let stack = Stack::read(&self.sources, &window)?;
        if stack.is_empty_of_data() {
            debug!("tile {}: no data", tile.idx);
            return Ok(None);
        }

        let (mut coded, mut lookup) = encode_stack(&stack, p.barren_value)?;
        drop(stack);
        if let Some(shared) = &self.shared {
            translate_codes(&mut coded, &mut lookup, shared)?;
        }

        let dir = self.work_dir.join(tile.dir_name());
        fs::create_dir_all(&dir)?;
        let coded_path = dir.join(CODED_FILE);
        let lookup_path = dir.join(LOOKUP_FILE);
        write_coded_raster(&coded_path, &coded)?;
        lookup.write(&lookup_path)?;

        let mut layer = vectorize(&coded, &lookup);
        stats.polygons_vectorized += layer.len();
        layer.ensure_valid(stats);
        stats.polygons_filtered_out += p.filter().apply(&mut layer);
        if !layer.is_empty() {
            tiered_eliminate(&mut layer, &p.eliminate_params(&p.tile_thresholds), stats);
            simplify_layer(&mut layer, p.simplify_tolerance, stats);
        }

        if !p.keep_intermediates {
            fs::remove_file(&coded_path)?;
            fs::remove_file(&lookup_path)?;
        }
        if layer.is_empty() {
            if !p.keep_intermediates {
                fs::remove_dir_all(&dir)?;
            }
            return Ok(None);
        }

        let out = dir.join(POLYGON_FILE);
        write_geojson(&out, &layer, &p.year_prefix)?;
        Ok(Some(out))
    }

    /// Process every tile, in parallel on `workers` threads when the
    /// `threading` feature is on. Outcomes come back in tile order.
    pub fn run(&self, tiles: &[Tile]) -> (Vec<TileOutcome>, RunStats) {
        info!("processing {} tiles", tiles.len());
        let outcomes = self.run_all(tiles);
        let mut stats = RunStats::default();
        for o in &outcomes {
            stats.merge(&o.stats);
        }
        info!(
            "tiles: {} processed, {} empty, {} failed of {}",
            stats.tiles_processed, stats.tiles_empty, stats.tiles_failed, stats.tiles_total
        );
        (outcomes, stats)
    }

    #[cfg(feature = "threading")]
    fn run_all(&self, tiles: &[Tile]) -> Vec<TileOutcome> {
        match rayon::ThreadPoolBuilder::new().num_threads(self.params.resolved_workers()).build() {
            Ok(pool) => pool.install(|| tiles.par_iter().map(|t| self.process_tile(t)).collect()),
            Err(e) => {
                warn!("could not start worker pool ({e}); processing tiles sequentially");
                tiles.iter().map(|t| self.process_tile(t)).collect()
            }
        }
    }

    #[cfg(not(feature = "threading"))]
    fn run_all(&self, tiles: &[Tile]) -> Vec<TileOutcome> {
        tiles.iter().map(|t| self.process_tile(t)).collect()
    }
}

/// Rewrite a tile's local codes as codes of the shared table.
fn translate_codes(coded: &mut CodedRaster, lookup: &mut LookupTable, shared: &Mutex<SignatureTable>) -> Result<()> {
    let remap = shared.lock().unwrap_or_else(PoisonError::into_inner).absorb(lookup)?;
    for code in coded.data.iter_mut() {
        if *code != NODATA_CODE {
            if let Some(&g) = remap.get(code) {
                *code = g;
            }
        }
    }
    let mut translated = LookupTable::new(lookup.years.clone());
    for (code, entry) in std::mem::take(&mut lookup.entries) {
        if let Some(&g) = remap.get(&code) {
            translated.insert(g, entry);
        }
    }
    *lookup = translated;
    Ok(())
}

// ── Reconciliation ───────────────────────────────────────────────────────────

/// Polygon files of processed tiles, in tile order.
pub fn processed_outputs(outcomes: &[TileOutcome]) -> Vec<PathBuf> {
    outcomes
        .iter()
        .filter_map(|o| match &o.status {
            TileStatus::Processed(p) => Some(p.clone()),
            _ => None,
        })
        .collect()
}

/// Read every tile output and reconcile them into one layer.
pub fn merge_tile_outputs(paths: &[PathBuf], prefix: &str, stats: &mut RunStats) -> Result<PolygonLayer> {
    if paths.is_empty() {
        return Err(CropSeqError::EmptyMosaic);
    }
    let layers = paths
        .iter()
        .map(|p| read_geojson(p, prefix))
        .collect::<Result<Vec<_>>>()?;
    reconcile(layers, stats)
}

fn geometry_key(poly: &Polygon<f64>) -> Vec<u64> {
    let mut key = Vec::new();
    for ring in std::iter::once(poly.exterior()).chain(poly.interiors()) {
        key.push(ring.0.len() as u64);
        for c in ring.coords() {
            key.push(c.x.to_bits());
            key.push(c.y.to_bits());
        }
    }
    key
}

/// What makes two tile records "the same attributes". Per-tile codes are
/// only comparable through their per-year values; records without values
/// fall back to the code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum DissolveKey {
    Signature(Vec<u8>),
    Code(u32),
}

impl DissolveKey {
    fn of(record: &PolygonRecord) -> Self {
        match &record.values {
            Some(v) => Self::Signature(v.clone()),
            None => Self::Code(record.code),
        }
    }
}

/// Concatenate, drop exact duplicates, then dissolve records sharing a
/// signature. Dissolved multi-part results become one record per part and
/// keep the code of the first record in tile order.
pub fn reconcile(layers: Vec<PolygonLayer>, stats: &mut RunStats) -> Result<PolygonLayer> {
    let Some(first) = layers.first() else {
        return Err(CropSeqError::EmptyMosaic);
    };
    let mut out = PolygonLayer::new(first.years.clone(), first.crs.clone());

    let mut seen: HashSet<(DissolveKey, Vec<u64>)> = HashSet::new();
    let mut groups: BTreeMap<DissolveKey, Vec<PolygonRecord>> = BTreeMap::new();
    let mut total = 0;
    let mut duplicates = 0;
    for record in layers.into_iter().flat_map(|l| l.records) {
        total += 1;
        let key = DissolveKey::of(&record);
        if !seen.insert((key.clone(), geometry_key(&record.geometry))) {
            duplicates += 1;
            continue;
        }
        groups.entry(key).or_default().push(record);
    }
    stats.duplicates_dropped += duplicates;
    info!("merging {total} tile polygons ({duplicates} duplicates)");

    for (_, mut records) in groups {
        if records.len() == 1 {
            out.records.append(&mut records);
            continue;
        }
        let template = records[0].clone();
        let geoms: Vec<Polygon<f64>> = records.iter().map(|r| r.geometry.clone()).collect();
        let Some(dissolved) = union_all(geoms) else {
            warn!("dissolve of code {} failed; keeping {} parts as is", template.code, records.len());
            stats.merges_skipped += 1;
            out.records.append(&mut records);
            continue;
        };
        for part in dissolved.0 {
            let mut record = template.clone();
            record.set_geometry(part);
            out.records.push(record);
        }
    }

    out.ensure_valid(stats);
    stats.polygons_out = out.len();
    info!("mosaic holds {} polygons", out.len());
    Ok(out)
}

/// Write the shared lookup of a `global_lookup` run next to the tiles.
pub fn write_shared_lookup(lookup: &LookupTable, work_dir: &Path) -> Result<PathBuf> {
    let path = work_dir.join(LOOKUP_FILE);
    lookup.write(&path)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{Bounds, CategoryRaster, GeoTransform, PixelWindow, Raster};
    use crate::tiling::generate_tiles;
    use approx::assert_relative_eq;

    /// 20×20 pixels of 30 m covering (0, 0)–(600, 600): four 10×10 fields
    /// with distinct two-year signatures.
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
        (y0, y1)
    }

    fn params(global_lookup: bool) -> PipelineParams {
        PipelineParams {
            start_year: 2020,
            end_year: 2021,
            workers: 2,
            global_lookup,
            ..Default::default()
        }
    }

    fn extent() -> Bounds {
        Bounds::new(0.0, 0.0, 600.0, 600.0)
    }

    #[test]
    fn overlapping_tiles_reconcile_to_whole_fields() {
        let (a, b) = years();
        let p = params(false);
        let dir = tempfile::tempdir().unwrap();
        let orch = TileOrchestrator::new(vec![(2020, &a), (2021, &b)], &p, dir.path()).unwrap();
        let tiles = generate_tiles(&extent(), 400.0, 100.0).unwrap();
        let (outcomes, mut stats) = orch.run(&tiles);
        assert_eq!(stats.tiles_total, tiles.len());
        assert_eq!(stats.tiles_failed, 0);

        let merged = merge_tile_outputs(&processed_outputs(&outcomes), "cdl", &mut stats).unwrap();
        assert_eq!(merged.len(), 4);
        for r in &merged.records {
            assert_relative_eq!(r.area, 90_000.0, max_relative = 1e-9);
        }
        assert_eq!(stats.polygons_out, 4);
        // Intermediates are removed, tile polygons stay.
        let tile0 = dir.path().join("tile_0000");
        assert!(tile0.join(POLYGON_FILE).exists());
        assert!(!tile0.join(CODED_FILE).exists());
        assert!(!tile0.join(LOOKUP_FILE).exists());
    }

    #[test]
    fn global_lookup_gives_consistent_codes() {
        let (a, b) = years();
        let p = params(true);
        let dir = tempfile::tempdir().unwrap();
        let orch = TileOrchestrator::new(vec![(2020, &a), (2021, &b)], &p, dir.path()).unwrap();
        let tiles = generate_tiles(&extent(), 300.0, 0.0).unwrap();
        let (outcomes, mut stats) = orch.run(&tiles);
        let merged = merge_tile_outputs(&processed_outputs(&outcomes), "cdl", &mut stats).unwrap();

        let lookup = orch.shared_lookup().unwrap();
        assert_eq!(lookup.len(), 4);
        let codes: HashSet<u32> = merged.records.iter().map(|r| r.code).collect();
        assert_eq!(codes.len(), 4);
        for r in &merged.records {
            assert_eq!(lookup.get(r.code).map(|e| e.values.clone()), r.values);
        }
    }

    #[test]
    fn keep_intermediates_retains_tile_files() {
        let (a, b) = years();
        let p = PipelineParams { keep_intermediates: true, ..params(false) };
        let dir = tempfile::tempdir().unwrap();
        let orch = TileOrchestrator::new(vec![(2020, &a), (2021, &b)], &p, dir.path()).unwrap();
        let tiles = generate_tiles(&extent(), 300.0, 0.0).unwrap();
        orch.run(&tiles);
        let tile3 = dir.path().join("tile_0003");
        assert!(tile3.join(CODED_FILE).exists());
        assert_eq!(LookupTable::read(tile3.join(LOOKUP_FILE)).unwrap().len(), 1);
    }

    #[test]
    fn empty_tiles_are_skipped_and_empty_mosaic_is_an_error() {
        let t = GeoTransform::north_up(0.0, 600.0, 30.0);
        let zeros = Raster::new(20, 20, t, None, 0u8);
        let p = params(false);
        let dir = tempfile::tempdir().unwrap();
        let orch = TileOrchestrator::new(vec![(2020, &zeros), (2021, &zeros)], &p, dir.path()).unwrap();
        let tiles = generate_tiles(&extent(), 300.0, 0.0).unwrap();
        let (outcomes, mut stats) = orch.run(&tiles);
        assert_eq!(stats.tiles_empty, 4);
        assert!(outcomes.iter().all(|o| o.status == TileStatus::Empty));
        assert!(matches!(
            merge_tile_outputs(&processed_outputs(&outcomes), "cdl", &mut stats),
            Err(CropSeqError::EmptyMosaic)
        ));
    }

    /// Source that fails (or panics) for windows right of `bad_col`.
    struct Flaky {
        inner: CategoryRaster,
        bad_col: usize,
        panic: bool,
    }

    impl RasterSource for Flaky {
        fn width(&self) -> usize {
            self.inner.width
        }
        fn height(&self) -> usize {
            self.inner.height
        }
        fn transform(&self) -> GeoTransform {
            self.inner.transform
        }
        fn crs(&self) -> Option<String> {
            self.inner.crs.clone()
        }
        fn nodata(&self) -> Option<u8> {
            self.inner.nodata
        }
        fn read_window(&self, window: &PixelWindow) -> Result<CategoryRaster> {
            if window.col_off >= self.bad_col {
                if self.panic {
                    panic!("decoder blew up");
                }
                return Err(CropSeqError::Io(std::io::Error::other("truncated strip")));
            }
            self.inner.window(window)
        }
    }

    #[test]
    fn failing_tiles_are_isolated() {
        let (a, b) = years();
        let p = params(false);
        for panic in [false, true] {
            let fa = Flaky { inner: a.clone(), bad_col: 10, panic };
            let fb = Flaky { inner: b.clone(), bad_col: 10, panic };
            let dir = tempfile::tempdir().unwrap();
            let orch = TileOrchestrator::new(vec![(2020, &fa), (2021, &fb)], &p, dir.path()).unwrap();
            let tiles = generate_tiles(&extent(), 300.0, 0.0).unwrap();
            let (outcomes, mut stats) = orch.run(&tiles);
            assert_eq!(stats.tiles_failed, 2);
            assert_eq!(stats.tiles_processed, 2);
            assert!(matches!(outcomes[1].status, TileStatus::Failed(_)));
            let merged = merge_tile_outputs(&processed_outputs(&outcomes), "cdl", &mut stats).unwrap();
            assert_eq!(merged.len(), 2);
        }
    }

    #[test]
    fn reconcile_drops_duplicates_and_dissolves_signatures() {
        use geo::polygon;
        let sq = |x0: f64| polygon![(x: x0, y: 0.0), (x: x0 + 10.0, y: 0.0), (x: x0 + 10.0, y: 10.0), (x: x0, y: 10.0)];
        let rec = |code: u32, values: Vec<u8>, x0: f64| {
            let mut r = PolygonRecord::new(code, sq(x0), None);
            r.values = Some(values);
            r
        };
        let mut a = PolygonLayer::new(vec![2020], None);
        a.records = vec![rec(0, vec![1], 0.0), rec(1, vec![5], 30.0)];
        let mut b = PolygonLayer::new(vec![2020], None);
        // Same signature as a's first, adjacent: dissolves. Exact copy of
        // a's second: dropped. Same code but another signature: kept apart.
        b.records = vec![rec(0, vec![1], 10.0), rec(1, vec![5], 30.0), rec(0, vec![7], 50.0)];

        let mut stats = RunStats::default();
        let out = reconcile(vec![a, b], &mut stats).unwrap();
        assert_eq!(stats.duplicates_dropped, 1);
        assert_eq!(out.len(), 3);
        let dissolved = out.records.iter().find(|r| r.values == Some(vec![1])).unwrap();
        assert_relative_eq!(dissolved.area, 200.0, epsilon = 1e-9);
    }
}
