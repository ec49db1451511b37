//! Batch upsert orchestrator.
//!
//! Chunks the write-set, upserts each chunk with bounded retry, and stops at
//! the first chunk that exhausts its attempts. Chunks committed before that
//! stay committed; a re-run converges because upserts are idempotent. The
//! derived view is refreshed only after every chunk landed, and a refresh
//! failure never fails the run.

use crate::dataset::DatasetSpec;
use crate::error::{IngestError, Result, StoreError};
use crate::record::LongRecord;
use crate::store::{with_timeout, Store};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per batch, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// What happened to the derived view after a commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewRefresh {
    /// The run stopped before reaching the refresh step.
    #[default]
    NotAttempted,
    Refreshed,
    Failed,
    /// Empty write-set: the view already reflects the table.
    SkippedNoWrites,
}

impl ViewRefresh {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotAttempted => "not_attempted",
            Self::Refreshed => "refreshed",
            Self::Failed => "failed",
            Self::SkippedNoWrites => "skipped_no_writes",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub written: u64,
    pub batches: usize,
    pub view_refresh: ViewRefresh,
}

pub struct BatchUpserter<'a> {
    store: &'a dyn Store,
    batch_size: usize,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl<'a> BatchUpserter<'a> {
    pub fn new(store: &'a dyn Store, batch_size: usize, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            retry,
            call_timeout,
        }
    }

    pub async fn commit(
        &self,
        spec: &DatasetSpec,
        writes: &[LongRecord],
        stamped_at: DateTime<Utc>,
    ) -> Result<CommitReport> {
        let mut report = CommitReport::default();
        if writes.is_empty() {
            report.view_refresh = ViewRefresh::SkippedNoWrites;
            info!(dataset = %spec.kind, view = spec.layout.view, "nothing to write; view refresh skipped");
            return Ok(report);
        }

        let total = writes.len().div_ceil(self.batch_size);
        for (idx, batch) in writes.chunks(self.batch_size).enumerate() {
            let batch_no = idx + 1;
            match self.upsert_with_retry(spec, batch_no, batch, stamped_at).await {
                Ok(written) => {
                    report.written += written;
                    report.batches += 1;
                    info!(
                        dataset = %spec.kind,
                        batch = batch_no,
                        of = total,
                        rows = batch.len(),
                        "batch committed"
                    );
                }
                Err(e) => {
                    error!(
                        dataset = %spec.kind,
                        batch = batch_no,
                        of = total,
                        committed = report.written,
                        error = %e,
                        "batch failed after retries; aborting run"
                    );
                    return Err(IngestError::Store(e));
                }
            }
        }

        match with_timeout(self.call_timeout, self.store.refresh_view(spec)).await {
            Ok(()) => {
                report.view_refresh = ViewRefresh::Refreshed;
                info!(dataset = %spec.kind, view = spec.layout.view, "view refreshed");
            }
            Err(e) => {
                report.view_refresh = ViewRefresh::Failed;
                warn!(dataset = %spec.kind, view = spec.layout.view, error = %e, "view refresh failed");
            }
        }

        Ok(report)
    }

    async fn upsert_with_retry(
        &self,
        spec: &DatasetSpec,
        batch_no: usize,
        batch: &[LongRecord],
        stamped_at: DateTime<Utc>,
    ) -> std::result::Result<u64, StoreError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let call = self.store.upsert_batch(spec, batch, stamped_at);
            match with_timeout(self.call_timeout, call).await {
                Ok(n) => return Ok(n),
                Err(e) if attempt >= max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        dataset = %spec.kind,
                        batch = batch_no,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "batch upsert failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetKind;
    use crate::record::{Attributes, GeographyKey, LocationType, Metrics, Period, RecordKey};
    use crate::store::MemoryStore;
    use tokio::time::Instant;

    fn records(n: usize) -> Vec<LongRecord> {
        (0..n)
            .map(|i| LongRecord {
                geography: GeographyKey {
                    geo_id: format!("{i:05}"),
                    location_type: LocationType::County,
                },
                period: Period::new("2024_01"),
                attributes: Attributes {
                    name: format!("county {i}"),
                    ..Attributes::default()
                },
                metrics: Metrics::from_values(vec![Some(i as f64)]),
            })
            .collect()
    }

    fn upserter(store: &MemoryStore, batch_size: usize) -> BatchUpserter<'_> {
        BatchUpserter::new(store, batch_size, RetryPolicy::default(), Duration::from_secs(30))
    }

    const KIND: DatasetKind = DatasetKind::TimeOnMarket;

    // ---
    // Retry policy
    // ---

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(6), Duration::from_secs(10));
        assert_eq!(policy.delay_for(200), Duration::from_secs(10));
    }

    // ---
    // Commit
    // ---

    #[tokio::test(start_paused = true)]
    async fn test_commit_chunks_and_refreshes() {
        let store = MemoryStore::new();
        let report = upserter(&store, 500)
            .commit(KIND.spec(), &records(1200), Utc::now())
            .await
            .unwrap();

        assert_eq!(
            report,
            CommitReport {
                written: 1200,
                batches: 3,
                view_refresh: ViewRefresh::Refreshed
            }
        );
        assert_eq!(store.upsert_calls(), 3);
        assert_eq!(store.refresh_calls(), 1);
        assert_eq!(store.records(KIND).len(), 1200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried_with_backoff() {
        let store = MemoryStore::new();
        store.fail_next_upserts(2);

        let started = Instant::now();
        let report = upserter(&store, 10)
            .commit(KIND.spec(), &records(5), Utc::now())
            .await
            .unwrap();

        assert_eq!(report.written, 5);
        assert_eq!(store.upsert_calls(), 3);
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_batch_aborts_run() {
        let store = MemoryStore::new();
        store.fail_upserts_after(1, 3);

        let err = upserter(&store, 2)
            .commit(KIND.spec(), &records(6), Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Store(StoreError::Rejected(_))));
        // Batch 1 committed, batch 2 tried three times, batch 3 never sent.
        assert_eq!(store.upsert_calls(), 4);
        assert_eq!(store.records(KIND).len(), 2);
        assert!(store.get(KIND, &RecordKey::new("00004", "2024_01")).is_none());
        assert_eq!(store.refresh_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out() {
        let store = MemoryStore::new();
        store.delay_upserts(Duration::from_secs(60));

        let err = upserter(&store, 10)
            .commit(KIND.spec(), &records(1), Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Store(StoreError::Timeout(_))));
        assert_eq!(store.upsert_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_does_not_fail_commit() {
        let store = MemoryStore::new();
        store.fail_refresh(true);

        let report = upserter(&store, 10)
            .commit(KIND.spec(), &records(3), Utc::now())
            .await
            .unwrap();

        assert_eq!(report.written, 3);
        assert_eq!(report.view_refresh, ViewRefresh::Failed);
        assert_eq!(store.records(KIND).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_write_set_skips_refresh() {
        let store = MemoryStore::new();
        let report = upserter(&store, 10).commit(KIND.spec(), &[], Utc::now()).await.unwrap();
        assert_eq!(report.written, 0);
        assert_eq!(report.view_refresh, ViewRefresh::SkippedNoWrites);
        assert_ne!(report.view_refresh, ViewRefresh::default());
        assert_eq!(store.upsert_calls(), 0);
        assert_eq!(store.refresh_calls(), 0);
    }

    #[test]
    fn test_view_refresh_serializes_snake_case() {
        let json = serde_json::to_string(&ViewRefresh::SkippedNoWrites).unwrap();
        assert_eq!(json, "\"skipped_no_writes\"");
        assert_eq!(ViewRefresh::NotAttempted.as_str(), "not_attempted");
    }
}
