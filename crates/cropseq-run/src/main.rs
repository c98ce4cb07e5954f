/// Field-boundary driver: yearly land-cover rasters → crop-sequence polygons.
///
/// `create` runs the whole extent with windowed encoding; `tiled` splits the
/// extent into overlapping tiles and reconciles them. Both write
/// `run_summary.json` with the run statistics next to the polygons.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cropseq_core::eliminate::TierReport;
use cropseq_core::raster::geotiff::GeoTiffSource;
use cropseq_core::raster::paths::resolve_year_paths;
use cropseq_core::tiling::orchestrator::TileStatus;
use cropseq_core::{FieldPipeline, PipelineParams, RunStats};
use env_logger::{Builder, Env};
use log::{info, warn};
use serde::Serialize;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "cropseq-run", about = "Build crop-sequence field polygons from yearly land-cover rasters")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process the whole extent in one pass
    Create(CommonArgs),
    /// Process the extent tile by tile and merge the results
    Tiled(TiledArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Directory holding the yearly rasters
    #[arg(short, long)]
    input_dir: PathBuf,

    /// Output directory (created if absent)
    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// JSON parameter file; missing fields keep their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    start_year: Option<u16>,

    #[arg(long)]
    end_year: Option<u16>,

    /// Resolution tag in raster file names
    #[arg(long, default_value = "30m")]
    resolution: String,

    /// Simplification tolerance in CRS units (0 disables)
    #[arg(long)]
    simplify: Option<f64>,
}

#[derive(Args, Debug)]
struct TiledArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Tile edge in CRS units
    #[arg(long)]
    tile_size: Option<f64>,

    #[arg(long)]
    overlap: Option<f64>,

    /// Worker threads (0 = all cores)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Process only the first N tiles
    #[arg(long)]
    max_tiles: Option<usize>,

    /// Keep per-tile coded rasters and lookups
    #[arg(long)]
    keep_intermediates: bool,

    /// Share one signature table across tiles
    #[arg(long)]
    global_lookup: bool,
}

// ── Summary ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct RunSummary {
    mode: &'static str,
    years: Vec<u16>,
    params: PipelineParams,
    stats: RunStats,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tiers: Vec<TierReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    failed_tiles: Vec<FailedTile>,
    polygons: PathBuf,
}

#[derive(Serialize)]
struct FailedTile {
    idx: usize,
    row: usize,
    col: usize,
    error: String,
}

// ── Setup ────────────────────────────────────────────────────────────────────

fn load_params(args: &CommonArgs) -> Result<PipelineParams> {
    let mut params = match &args.config {
        Some(path) => PipelineParams::from_json_file(path)
            .with_context(|| format!("reading parameters from {}", path.display()))?,
        None => PipelineParams::default(),
    };
    if let Some(y) = args.start_year {
        params.start_year = y;
    }
    if let Some(y) = args.end_year {
        params.end_year = y;
    }
    if let Some(t) = args.simplify {
        params.simplify_tolerance = t;
    }
    Ok(params)
}

fn open_sources(args: &CommonArgs, params: &PipelineParams) -> Result<Vec<(u16, GeoTiffSource)>> {
    let paths = resolve_year_paths(&args.input_dir, params.start_year, params.end_year, &args.resolution)
        .with_context(|| format!("locating rasters under {}", args.input_dir.display()))?;
    paths
        .into_iter()
        .map(|(year, path)| {
            info!("{year}: {}", path.display());
            let source = GeoTiffSource::open(&path).with_context(|| format!("opening {}", path.display()))?;
            Ok((year, source))
        })
        .collect()
}

fn write_summary(dir: &Path, summary: &RunSummary) -> Result<()> {
    let path = dir.join("run_summary.json");
    let json = serde_json::to_string_pretty(summary)?;
    fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    info!("run summary written to {}", path.display());
    Ok(())
}

// ── Commands ─────────────────────────────────────────────────────────────────

fn run_create(args: CommonArgs) -> Result<()> {
    let params = load_params(&args)?;
    let opened = open_sources(&args, &params)?;
    let sources: Vec<(u16, &GeoTiffSource)> = opened.iter().map(|(y, s)| (*y, s)).collect();

    let result = FieldPipeline::new(&params)
        .create(&sources, &args.output)
        .context("whole-extent pipeline failed")?;

    write_summary(
        &args.output,
        &RunSummary {
            mode: "create",
            years: params.years(),
            stats: result.stats,
            tiers: result.tiers,
            failed_tiles: Vec::new(),
            polygons: result.polygons_path,
            params,
        },
    )
}

fn run_tiled(args: TiledArgs) -> Result<()> {
    let mut params = load_params(&args.common)?;
    if let Some(s) = args.tile_size {
        params.tile_size = s;
    }
    if let Some(o) = args.overlap {
        params.tile_overlap = o;
    }
    if let Some(w) = args.workers {
        params.workers = w;
    }
    params.keep_intermediates |= args.keep_intermediates;
    params.global_lookup |= args.global_lookup;

    let opened = open_sources(&args.common, &params)?;
    let sources: Vec<(u16, &GeoTiffSource)> = opened.iter().map(|(y, s)| (*y, s)).collect();

    let result = FieldPipeline::new(&params)
        .tiled(&sources, &args.common.output, args.max_tiles)
        .context("tiled pipeline failed")?;

    let failed_tiles: Vec<FailedTile> = result
        .outcomes
        .iter()
        .filter_map(|o| match &o.status {
            TileStatus::Failed(error) => Some(FailedTile {
                idx: o.tile.idx,
                row: o.tile.row,
                col: o.tile.col,
                error: error.clone(),
            }),
            _ => None,
        })
        .collect();
    if !failed_tiles.is_empty() {
        warn!("{} tiles failed; see run_summary.json", failed_tiles.len());
    }

    write_summary(
        &args.common.output,
        &RunSummary {
            mode: "tiled",
            years: params.years(),
            stats: result.stats,
            tiers: Vec::new(),
            failed_tiles,
            polygons: result.polygons_path,
            params,
        },
    )
}

fn main() -> Result<()> {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    match Cli::parse().command {
        Command::Create(args) => run_create(args),
        Command::Tiled(args) => run_tiled(args),
    }
}
