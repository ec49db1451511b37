//! Reconciliation engine.
//!
//! Merges an incoming batch into the persisted history without regressing
//! values the store already has. Every incoming cell is a candidate: it
//! overrides the stored value only when it actually reports something (see
//! `ZeroPolicy`). When both sides report different values the incoming one
//! wins. There is no numeric comparison.
//!
//! The engine never writes. It reads a `Snapshot` and returns one
//! `MergeDecision` per incoming record plus the write-set for the orchestrator.
//! Running it twice over the same input and the store state produced by the
//! first run classifies everything `Preserved`.

use crate::dataset::DatasetSpec;
use crate::record::{ExistingRecord, LongRecord, Metrics, RecordKey};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilePolicy {
    /// Re-write preserved records so their `last_update_time` moves forward.
    pub stamp_preserved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Classification {
    /// The store has no period at all for this geography.
    NewGeography,
    /// The geography is known, this period is not.
    NewPeriod,
    /// At least one metric changed value.
    Updated,
    /// Nothing changed.
    Preserved,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeDecision {
    pub key: RecordKey,
    pub classification: Classification,
    pub merged: LongRecord,
    pub write: bool,
}

/// The slice of store state the engine needs: stored rows for the exact
/// incoming keys, and which incoming geography ids the store already knows.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    records: HashMap<RecordKey, ExistingRecord>,
    geographies: HashSet<String>,
}

impl Snapshot {
    /// Geography ids of `records` are folded into `geographies`, so a stored
    /// row always implies a known geography.
    pub fn new(records: HashMap<RecordKey, ExistingRecord>, mut geographies: HashSet<String>) -> Self {
        geographies.extend(records.keys().map(|k| k.geo_id.clone()));
        Self { records, geographies }
    }

    pub fn get(&self, key: &RecordKey) -> Option<&ExistingRecord> {
        self.records.get(key)
    }

    pub fn knows_geography(&self, geo_id: &str) -> bool {
        self.geographies.contains(geo_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileCounts {
    pub new_geographies: usize,
    pub new_periods: usize,
    pub updated: usize,
    pub preserved: usize,
}

impl ReconcileCounts {
    fn record(&mut self, classification: Classification) {
        match classification {
            Classification::NewGeography => self.new_geographies += 1,
            Classification::NewPeriod => self.new_periods += 1,
            Classification::Updated => self.updated += 1,
            Classification::Preserved => self.preserved += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.new_geographies + self.new_periods + self.updated + self.preserved
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub decisions: Vec<MergeDecision>,
    pub counts: ReconcileCounts,
}

impl Reconciliation {
    pub fn write_count(&self) -> usize {
        self.decisions.iter().filter(|d| d.write).count()
    }

    /// Merged records to hand to the orchestrator, in input order.
    pub fn into_writes(self) -> Vec<LongRecord> {
        self.decisions
            .into_iter()
            .filter(|d| d.write)
            .map(|d| d.merged)
            .collect()
    }
}

pub struct Reconciler<'a> {
    spec: &'a DatasetSpec,
    policy: ReconcilePolicy,
}

impl<'a> Reconciler<'a> {
    pub fn new(spec: &'a DatasetSpec, policy: ReconcilePolicy) -> Self {
        Self { spec, policy }
    }

    pub fn reconcile(&self, incoming: Vec<LongRecord>, snapshot: &Snapshot) -> Reconciliation {
        let mut out = Reconciliation {
            decisions: Vec::with_capacity(incoming.len()),
            counts: ReconcileCounts::default(),
        };

        for record in incoming {
            let decision = self.decide(record, snapshot);
            out.counts.record(decision.classification);
            out.decisions.push(decision);
        }

        debug!(
            dataset = %self.spec.kind,
            new_geographies = out.counts.new_geographies,
            new_periods = out.counts.new_periods,
            updated = out.counts.updated,
            preserved = out.counts.preserved,
            "reconciled batch"
        );
        out
    }

    fn decide(&self, incoming: LongRecord, snapshot: &Snapshot) -> MergeDecision {
        let key = incoming.key();

        let Some(existing) = snapshot.get(&key) else {
            let classification = if snapshot.knows_geography(&key.geo_id) {
                Classification::NewPeriod
            } else {
                Classification::NewGeography
            };
            return MergeDecision {
                key,
                classification,
                merged: incoming,
                write: true,
            };
        };

        let (metrics, changed) = merge_metrics(self.spec, &existing.record.metrics, &incoming.metrics);

        // Stored attributes are kept; only metrics move.
        let mut merged = existing.record.clone();
        merged.metrics = metrics;

        let classification = if changed {
            Classification::Updated
        } else {
            Classification::Preserved
        };
        MergeDecision {
            key,
            classification,
            merged,
            write: changed || self.policy.stamp_preserved,
        }
    }
}

/// Per-field merge. Returns the merged metrics and whether any field changed.
pub fn merge_metrics(spec: &DatasetSpec, existing: &Metrics, incoming: &Metrics) -> (Metrics, bool) {
    let mut merged = existing.clone();
    let mut changed = false;
    for (idx, metric) in spec.metrics.iter().enumerate() {
        let candidate = incoming.get(idx);
        if metric.zero_policy.reports(candidate) && candidate != existing.get(idx) {
            merged.set(idx, candidate);
            changed = true;
        }
    }
    (merged, changed)
}
