//! Store contract and snapshot loading.
//!
//! The store is the only thing the pipeline mutates, and only through
//! `upsert_batch`. Implementations write exactly what they are given; the
//! preservation policy lives in the reconciliation engine.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::dataset::DatasetSpec;
use crate::error::StoreError;
use crate::reconcile::Snapshot;
use crate::record::{ExistingRecord, LongRecord, RecordKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait Store: Send + Sync {
    /// Stored rows for exactly these keys. Never a table scan.
    async fn fetch_existing(
        &self,
        spec: &DatasetSpec,
        keys: &[RecordKey],
    ) -> Result<HashMap<RecordKey, ExistingRecord>, StoreError>;

    /// The subset of `geo_ids` with at least one stored period.
    async fn known_geographies(
        &self,
        spec: &DatasetSpec,
        geo_ids: &[String],
    ) -> Result<HashSet<String>, StoreError>;

    /// Insert-or-replace keyed by (geography id, period). Must be safe to
    /// retry with the same input. Returns the number of rows written.
    async fn upsert_batch(
        &self,
        spec: &DatasetSpec,
        records: &[LongRecord],
        stamped_at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Refresh the dataset's derived view.
    async fn refresh_view(&self, spec: &DatasetSpec) -> Result<(), StoreError>;
}

/// Bound a store call. Elapsed time becomes `StoreError::Timeout`.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Read the snapshot the engine needs for `incoming`, in chunks of
/// `chunk_size` keys. Reads are not retried: a failure here fails the run
/// before anything is written.
pub async fn load_snapshot(
    store: &dyn Store,
    spec: &DatasetSpec,
    incoming: &[LongRecord],
    chunk_size: usize,
    call_timeout: Duration,
) -> Result<Snapshot, StoreError> {
    let chunk_size = chunk_size.max(1);
    let keys: Vec<RecordKey> = incoming.iter().map(LongRecord::key).collect();
    let geo_ids: Vec<String> = incoming
        .iter()
        .map(|r| r.geography.geo_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut records = HashMap::with_capacity(keys.len());
    for chunk in keys.chunks(chunk_size) {
        records.extend(with_timeout(call_timeout, store.fetch_existing(spec, chunk)).await?);
    }

    let mut geographies = HashSet::new();
    for chunk in geo_ids.chunks(chunk_size) {
        geographies.extend(with_timeout(call_timeout, store.known_geographies(spec, chunk)).await?);
    }

    debug!(
        dataset = %spec.kind,
        keys = keys.len(),
        existing = records.len(),
        known_geographies = geographies.len(),
        "loaded store snapshot"
    );
    Ok(Snapshot::new(records, geographies))
}
