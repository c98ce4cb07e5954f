/// Lookup inspection tool: prints signature counts and the count0/count45
/// distributions of a lookup sidecar as JSON.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use cropseq_core::signature::lookup::LookupTable;

#[derive(Parser, Debug)]
#[command(name = "signature_stats", about = "Summarise a signature lookup sidecar")]
struct Args {
    /// Lookup sidecar written by cropseq-run
    lookup: PathBuf,

    /// Print compact JSON on one line
    #[arg(long)]
    compact: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let table = LookupTable::read(&args.lookup).with_context(|| format!("reading {}", args.lookup.display()))?;
    let stats = table.signature_stats();
    let json = if args.compact {
        serde_json::to_string(&stats)?
    } else {
        serde_json::to_string_pretty(&stats)?
    };
    println!("{json}");
    Ok(())
}
