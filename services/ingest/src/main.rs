//! Ingest Service - Loads raw market panels into the store
//!
//! Responsibilities:
//! - Read a raw panel (explicit file or newest artifact from the collector)
//! - Transform, validate and reconcile it against stored history
//! - Commit the write-set in retried batches and refresh the dataset view
//! - Track runs in `ingest_runs` for auditing
//!
//! Usage:
//!   # Newest collected artifact for every dataset:
//!   cargo run --bin market-ingest
//!
//!   # One dataset from a given file:
//!   cargo run --bin market-ingest -- --dataset vacancy-index --input data/raw/vacancy-index/x.csv
//!
//!   # See what would change without writing:
//!   cargo run --bin market-ingest -- --dataset rent-estimates --dry-run

use anyhow::{Context, Result};
use clap::Parser;
use market_ingest::{run_with_audit, DatasetKind, FileSource, PgStore, Settings};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "market-ingest", about = "Loads raw market panels into the store")]
struct Args {
    /// Datasets to load (default: all)
    #[arg(long, value_enum, value_delimiter = ',')]
    dataset: Vec<DatasetKind>,

    /// Raw panel to load instead of the newest collected artifact (single dataset only)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Reconcile against the store but write nothing
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Override the dataset's minimum source row count
    #[arg(long)]
    min_rows: Option<usize>,

    /// Override the dataset's minimum period column count
    #[arg(long)]
    min_periods: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{e:#}"), "ingest aborted");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<u8> {
    let settings = Settings::from_env().context("Invalid configuration")?;

    let datasets = if args.dataset.is_empty() {
        DatasetKind::ALL.to_vec()
    } else {
        args.dataset.clone()
    };
    if args.input.is_some() && datasets.len() != 1 {
        anyhow::bail!("--input requires exactly one --dataset");
    }

    let mut config = settings.pipeline();
    config.dry_run = args.dry_run;
    config.volume.min_rows = args.min_rows;
    config.volume.min_period_columns = args.min_periods;

    let store = PgStore::connect(&settings.db_url)
        .await
        .context("Failed to connect to database")?;

    let fetcher = match &args.input {
        Some(path) => FileSource::Path(path.clone()),
        None => FileSource::Latest(settings.raw_fs_dir.clone()),
    };

    info!(datasets = datasets.len(), dry_run = config.dry_run, "=== Market Ingest ===");

    let mut exit = 0;
    for kind in datasets {
        let summary = run_with_audit(kind, &fetcher, &store, &config)
            .await
            .context("Failed to record ingest run")?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        exit = exit.max(summary.exit_code());
    }

    Ok(exit)
}
