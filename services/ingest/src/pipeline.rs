//! One dataset run: fetch -> read -> transform -> validate -> reconcile -> commit.
//!
//! Every failure is fatal for the run and ends up in the summary; nothing
//! after the failing stage runs. Validation failures never touch the store.

use crate::config::PipelineConfig;
use crate::dataset::DatasetKind;
use crate::error::{IngestError, Result, StoreError};
use crate::orchestrator::{BatchUpserter, ViewRefresh};
use crate::reader::read_panel;
use crate::reconcile::Reconciler;
use crate::source::SourceFetcher;
use crate::store::{load_snapshot, PgStore, Store};
use crate::transform::Transformer;
use crate::validate::Validator;
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunError {
    pub kind: &'static str,
    pub message: String,
}

impl From<&IngestError> for RunError {
    fn from(err: &IngestError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub dataset: DatasetKind,
    pub dry_run: bool,
    pub new_geographies: usize,
    pub new_periods: usize,
    pub updated: usize,
    pub preserved: usize,
    /// Records the reconciler wants written.
    pub planned_writes: usize,
    /// Records the store accepted.
    pub written: u64,
    pub view_refresh: ViewRefresh,
    pub errors: Vec<RunError>,
}

impl RunSummary {
    pub fn new(dataset: DatasetKind, dry_run: bool) -> Self {
        Self {
            dataset,
            dry_run,
            new_geographies: 0,
            new_periods: 0,
            updated: 0,
            preserved: 0,
            planned_writes: 0,
            written: 0,
            view_refresh: ViewRefresh::NotAttempted,
            errors: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Process exit status: 0 on success, 1 on any fatal error.
    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

pub async fn run_dataset(
    kind: DatasetKind,
    fetcher: &dyn SourceFetcher,
    store: &dyn Store,
    config: &PipelineConfig,
) -> RunSummary {
    let mut summary = RunSummary::new(kind, config.dry_run);
    if let Err(e) = execute(kind, fetcher, store, config, &mut summary).await {
        error!(dataset = %kind, error_kind = e.kind(), error = %e, "dataset run failed");
        summary.errors.push(RunError::from(&e));
    }
    summary
}

/// `run_dataset` bracketed by an `ingest_runs` audit row. Dry runs are not
/// audited. Only audit-trail failures surface as `Err`.
pub async fn run_with_audit(
    kind: DatasetKind,
    fetcher: &dyn SourceFetcher,
    store: &PgStore,
    config: &PipelineConfig,
) -> std::result::Result<RunSummary, StoreError> {
    if config.dry_run {
        return Ok(run_dataset(kind, fetcher, store, config).await);
    }

    let run_id = store.create_run(&kind.to_string(), &fetcher.describe(kind.spec())).await?;
    let summary = run_dataset(kind, fetcher, store, config).await;

    let detail = serde_json::to_value(&summary).unwrap_or_default();
    let (status, error) = match summary.errors.first() {
        None => ("ok", None),
        Some(e) => ("failed", Some(e.message.as_str())),
    };
    store.finish_run(run_id, status, &detail, error).await?;
    Ok(summary)
}

async fn execute(
    kind: DatasetKind,
    fetcher: &dyn SourceFetcher,
    store: &dyn Store,
    config: &PipelineConfig,
    summary: &mut RunSummary,
) -> Result<()> {
    let spec = kind.spec();
    info!(dataset = %kind, source = %fetcher.describe(spec), dry_run = config.dry_run, "run started");

    let bytes = fetcher.fetch(spec).await?;
    let table = read_panel(&bytes, spec)?;
    let records = Transformer::new(spec).transform(&table)?;

    Validator::new(spec, config.volume_for(spec))
        .validate(&table, &records)
        .into_result()?;

    let snapshot = load_snapshot(store, spec, &records, config.batch_size, config.call_timeout).await?;
    let reconciliation = Reconciler::new(spec, config.reconcile).reconcile(records, &snapshot);

    let counts = reconciliation.counts;
    summary.new_geographies = counts.new_geographies;
    summary.new_periods = counts.new_periods;
    summary.updated = counts.updated;
    summary.preserved = counts.preserved;
    summary.planned_writes = reconciliation.write_count();

    if config.dry_run {
        info!(
            dataset = %kind,
            planned_writes = summary.planned_writes,
            "dry run; nothing written"
        );
        return Ok(());
    }

    let writes = reconciliation.into_writes();
    let report = BatchUpserter::new(store, config.batch_size, config.retry, config.call_timeout)
        .commit(spec, &writes, Utc::now())
        .await?;
    summary.written = report.written;
    summary.view_refresh = report.view_refresh;

    info!(
        dataset = %kind,
        new_geographies = counts.new_geographies,
        new_periods = counts.new_periods,
        updated = counts.updated,
        preserved = counts.preserved,
        written = report.written,
        view_refresh = report.view_refresh.as_str(),
        "run finished"
    );
    Ok(())
}
