use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use radload_core::{render_table, StreamAggregator};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "radius-parse")]
#[command(about = "Summarize radius-load output into per-phase latency and error statistics")]
struct Args {
    /// JSON-lines file to read (stdin when omitted)
    input: Option<PathBuf>,

    /// Report format
    #[arg(long, value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Table,
    Json,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let mut aggregator = StreamAggregator::new();

    let report = match &args.input {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("Failed to open input {:?}", path))?;
            aggregator.ingest(BufReader::with_capacity(1 << 20, file))
        }
        None => aggregator.ingest(io::stdin().lock()),
    }
    .context("Failed to read input")?;

    if report.malformed > 0 {
        info!(
            "Skipped {} malformed line(s) out of {}",
            report.malformed, report.lines
        );
    }

    let summaries = aggregator.finish();
    match args.format {
        Format::Table => print!("{}", render_table(&summaries)),
        Format::Json => println!("{}", serde_json::to_string_pretty(&summaries)?),
    }

    Ok(())
}
