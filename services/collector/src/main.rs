//! Collector Service - Downloads raw market panels from provider sites
//!
//! Responsibilities:
//! - Find the current CSV for each dataset (direct URL or link on a page)
//! - Apply rate limiting to avoid degrading source sites
//! - Store raw artifacts on the filesystem, addressed by content hash
//! - Optionally hand the download straight to the ingest pipeline
//!
//! Usage:
//!   # Every enabled source:
//!   cargo run --bin market-collector
//!
//!   # One dataset, then load it:
//!   cargo run --bin market-collector -- --dataset vacancy-index --ingest
//!
//!   # Specific source from config:
//!   cargo run --bin market-collector -- --config config/sources.json --source-id zillow-median-sale-price

mod http;
mod sources;

use anyhow::{Context, Result};
use clap::Parser;
use http::{ArtifactOutcome, HttpSourceFetcher};
use market_ingest::{run_with_audit, DatasetKind, PgStore, Settings};
use sources::{Source, SourcesConfig};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "market-collector", about = "Collects raw market panels from provider sites")]
struct Args {
    /// Path to sources config file
    #[arg(long, default_value = "config/sources.json")]
    config: String,

    /// Only this source id
    #[arg(long)]
    source_id: Option<String>,

    /// Only these datasets
    #[arg(long, value_enum, value_delimiter = ',')]
    dataset: Vec<DatasetKind>,

    /// Save the artifact even if identical content is already on disk
    #[arg(long, default_value = "false")]
    force: bool,

    /// Run the ingest pipeline on each download
    #[arg(long, default_value = "false")]
    ingest: bool,

    /// With --ingest: reconcile but write nothing
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Include sources marked disabled
    #[arg(long, default_value = "false")]
    include_disabled: bool,
}

/// Print summary of available sources
fn print_sources_summary(config: &SourcesConfig) {
    println!("\nConfigured sources:");
    println!("{:-<60}", "");
    for source in &config.sources {
        let status = if source.enabled { "✓" } else { "✗" };
        println!(
            "  {} {} - {} [{}]",
            status, source.id, source.name, source.dataset
        );
        if !source.description.is_empty() {
            println!("      {}", source.description);
        }
    }
    println!("{:-<60}", "");
}

fn select<'a>(config: &'a SourcesConfig, args: &Args) -> Vec<&'a Source> {
    config
        .sources
        .iter()
        .filter(|s| args.include_disabled || s.enabled)
        .filter(|s| args.source_id.as_ref().map_or(true, |id| &s.id == id))
        .filter(|s| args.dataset.is_empty() || args.dataset.contains(&s.dataset))
        .collect()
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
            error!(error = %format!("{e:#}"), "collector aborted");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<u8> {
    let settings = Settings::from_env().context("Invalid configuration")?;

    info!(config = %args.config, "=== Market Collector ===");
    let sources_config = SourcesConfig::load(&args.config).await?;
    info!(version = %sources_config.version, "loaded sources config");

    let selected = select(&sources_config, &args);
    if selected.is_empty() {
        print_sources_summary(&sources_config);
        anyhow::bail!("No sources match the filter criteria");
    }
    let datasets: Vec<DatasetKind> = selected.iter().map(|s| s.dataset).collect();

    let fetcher = HttpSourceFetcher::new(
        selected.into_iter().cloned().collect(),
        settings.raw_fs_dir.clone(),
        Duration::from_millis(settings.rate_limit_ms),
        Duration::from_secs(settings.http_timeout_secs),
        args.force,
    )?;

    if args.ingest {
        let store = PgStore::connect(&settings.db_url)
            .await
            .context("Failed to connect to database")?;
        let mut config = settings.pipeline();
        config.dry_run = args.dry_run;

        let mut exit = 0;
        for kind in datasets {
            let summary = run_with_audit(kind, &fetcher, &store, &config)
                .await
                .context("Failed to record ingest run")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            exit = exit.max(summary.exit_code());
        }
        return Ok(exit);
    }

    let mut collected = 0;
    let mut failed = 0;
    for kind in datasets {
        match fetcher.collect(kind.spec()).await {
            Ok(c) => {
                let location = match &c.artifact {
                    Some(ArtifactOutcome::Stored(path)) => format!("saved {}", path.display()),
                    Some(ArtifactOutcome::Duplicate(path)) => format!("unchanged {}", path.display()),
                    None => "not saved".to_string(),
                };
                println!("  ✓ {kind}: {} bytes, sha256 {} ({location}) from {}", c.bytes.len(), c.content_hash, c.url);
                collected += 1;
            }
            Err(e) => {
                error!(dataset = %kind, error = %e, "collection failed");
                println!("  ✗ {kind}: {e}");
                failed += 1;
            }
        }
    }

    println!("\n=== Collection Summary ===");
    println!("Collected: {}", collected);
    println!("Failed: {}", failed);

    Ok(if failed > 0 { 1 } else { 0 })
}
