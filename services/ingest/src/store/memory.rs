//! In-memory store for tests and dry local runs.
//!
//! Not durable. Supports fault injection so retry, timeout and abort paths can
//! be exercised without a database.

use super::Store;
use crate::dataset::{DatasetKind, DatasetSpec};
use crate::error::StoreError;
use crate::record::{ExistingRecord, LongRecord, RecordKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

type Table = BTreeMap<RecordKey, ExistingRecord>;

#[derive(Debug, Default)]
struct Faults {
    passing_upserts: usize,
    failing_upserts: usize,
    upsert_delay: Option<Duration>,
    fail_refresh: bool,
    fail_reads: bool,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<DatasetKind, Table>>,
    faults: Mutex<Faults>,
    upsert_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Rejected("memory store lock poisoned".into())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put rows in place as if a previous run had written them.
    pub fn seed(&self, kind: DatasetKind, records: Vec<LongRecord>, stamped_at: DateTime<Utc>) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let table = tables.entry(kind).or_default();
        for record in records {
            table.insert(
                record.key(),
                ExistingRecord {
                    record,
                    last_update_time: stamped_at,
                },
            );
        }
    }

    /// The next `n` upsert calls fail before writing anything.
    pub fn fail_next_upserts(&self, n: usize) {
        self.fail_upserts_after(0, n);
    }

    /// Let `ok` upsert calls through, then fail the following `failures`.
    pub fn fail_upserts_after(&self, ok: usize, failures: usize) {
        self.with_faults(|f| {
            f.passing_upserts = ok;
            f.failing_upserts = failures;
        });
    }

    /// Every upsert call sleeps this long first.
    pub fn delay_upserts(&self, delay: Duration) {
        self.with_faults(|f| f.upsert_delay = Some(delay));
    }

    pub fn fail_refresh(&self, fail: bool) {
        self.with_faults(|f| f.fail_refresh = fail);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.with_faults(|f| f.fail_reads = fail);
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// All stored rows for a dataset, ordered by key.
    pub fn records(&self, kind: DatasetKind) -> Vec<ExistingRecord> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .get(&kind)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, kind: DatasetKind, key: &RecordKey) -> Option<ExistingRecord> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.get(&kind).and_then(|t| t.get(key)).cloned()
    }

    fn with_faults<R>(&self, f: impl FnOnce(&mut Faults) -> R) -> R {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut faults)
    }

    fn check_reads(&self) -> Result<(), StoreError> {
        if self.with_faults(|f| f.fail_reads) {
            return Err(StoreError::Rejected("injected read failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn fetch_existing(
        &self,
        spec: &DatasetSpec,
        keys: &[RecordKey],
    ) -> Result<HashMap<RecordKey, ExistingRecord>, StoreError> {
        self.check_reads()?;
        let tables = self.tables.read().map_err(poisoned)?;
        let Some(table) = tables.get(&spec.kind) else {
            return Ok(HashMap::new());
        };
        Ok(keys
            .iter()
            .filter_map(|k| table.get(k).map(|r| (k.clone(), r.clone())))
            .collect())
    }

    async fn known_geographies(
        &self,
        spec: &DatasetSpec,
        geo_ids: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        self.check_reads()?;
        let tables = self.tables.read().map_err(poisoned)?;
        let Some(table) = tables.get(&spec.kind) else {
            return Ok(HashSet::new());
        };
        let wanted: HashSet<&str> = geo_ids.iter().map(String::as_str).collect();
        Ok(table
            .keys()
            .filter(|k| wanted.contains(k.geo_id.as_str()))
            .map(|k| k.geo_id.clone())
            .collect())
    }

    async fn upsert_batch(
        &self,
        spec: &DatasetSpec,
        records: &[LongRecord],
        stamped_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);

        let (fail, delay) = self.with_faults(|f| {
            let fail = if f.passing_upserts > 0 {
                f.passing_upserts -= 1;
                false
            } else if f.failing_upserts > 0 {
                f.failing_upserts -= 1;
                true
            } else {
                false
            };
            (fail, f.upsert_delay)
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(StoreError::Rejected("injected upsert failure".into()));
        }

        let mut tables = self.tables.write().map_err(poisoned)?;
        let table = tables.entry(spec.kind).or_default();
        for record in records {
            table.insert(
                record.key(),
                ExistingRecord {
                    record: record.clone(),
                    last_update_time: stamped_at,
                },
            );
        }
        Ok(records.len() as u64)
    }

    async fn refresh_view(&self, _spec: &DatasetSpec) -> Result<(), StoreError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.with_faults(|f| f.fail_refresh) {
            return Err(StoreError::Rejected("injected refresh failure".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Attributes, GeographyKey, LocationType, Metrics, Period};

    fn rec(geo: &str, period: &str, value: f64) -> LongRecord {
        LongRecord {
            geography: GeographyKey {
                geo_id: geo.into(),
                location_type: LocationType::County,
            },
            period: Period::new(period),
            attributes: Attributes {
                name: geo.into(),
                ..Attributes::default()
            },
            metrics: Metrics::from_values(vec![Some(value)]),
        }
    }

    #[tokio::test]
    async fn test_exact_key_reads() {
        let store = MemoryStore::new();
        let kind = DatasetKind::TimeOnMarket;
        store.seed(kind, vec![rec("01001", "2024_01", 30.0), rec("01003", "2024_01", 31.0)], Utc::now());

        let keys = vec![RecordKey::new("01001", "2024_01"), RecordKey::new("01001", "2024_02")];
        let found = store.fetch_existing(kind.spec(), &keys).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key(&keys[0]));

        let known = store
            .known_geographies(kind.spec(), &["01003".to_string(), "99999".to_string()])
            .await
            .unwrap();
        assert_eq!(known, HashSet::from(["01003".to_string()]));
    }

    #[tokio::test]
    async fn test_datasets_do_not_share_rows() {
        let store = MemoryStore::new();
        store.seed(DatasetKind::TimeOnMarket, vec![rec("01001", "2024_01", 30.0)], Utc::now());
        let keys = vec![RecordKey::new("01001", "2024_01")];
        let found = store.fetch_existing(DatasetKind::VacancyIndex.spec(), &keys).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_injected_upsert_failure_writes_nothing() {
        let store = MemoryStore::new();
        let kind = DatasetKind::TimeOnMarket;
        store.fail_next_upserts(1);

        let batch = vec![rec("01001", "2024_01", 30.0)];
        assert!(store.upsert_batch(kind.spec(), &batch, Utc::now()).await.is_err());
        assert!(store.records(kind).is_empty());

        assert_eq!(store.upsert_batch(kind.spec(), &batch, Utc::now()).await.unwrap(), 1);
        assert_eq!(store.records(kind).len(), 1);
        assert_eq!(store.upsert_calls(), 2);
    }
}
