//! Long-form records: one observation set per (geography, period).

use crate::dataset::DatasetSpec;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum LocationType {
    City,
    County,
    Metro,
    State,
    Region,
    Country,
}

impl LocationType {
    /// Case-insensitive. Zillow labels metros `msa`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "city" => Some(Self::City),
            "county" => Some(Self::County),
            "metro" | "msa" => Some(Self::Metro),
            "state" => Some(Self::State),
            "region" => Some(Self::Region),
            "country" | "national" => Some(Self::Country),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::City => "City",
            Self::County => "County",
            Self::Metro => "Metro",
            Self::State => "State",
            Self::Region => "Region",
            Self::Country => "Country",
        }
    }
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a place. `geo_id` is a FIPS code or provider region id and is
/// always kept as text: leading zeros are significant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GeographyKey {
    pub geo_id: String,
    pub location_type: LocationType,
}

/// A period label in the dataset's own format (`YYYY_MM` or `YYYY-MM-DD`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Period(String);

impl Period {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store primary key. The geography id is unique within a dataset, so the
/// location type is not part of the conflict target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RecordKey {
    pub geo_id: String,
    pub period: Period,
}

impl RecordKey {
    pub fn new(geo_id: impl Into<String>, period: impl Into<String>) -> Self {
        Self {
            geo_id: geo_id.into(),
            period: Period::new(period),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.geo_id, self.period)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Attributes {
    pub name: String,
    pub population: i64,
    pub state: String,
    pub county: String,
    pub metro: String,
    pub size_rank: i64,
}

/// Metric values in the order of `DatasetSpec::metrics`.
#[derive(Debug, Clone, PartialEq)]
pub struct Metrics(Vec<Option<f64>>);

impl Metrics {
    pub fn empty(spec: &DatasetSpec) -> Self {
        Self(vec![None; spec.metrics.len()])
    }

    pub fn from_values(values: Vec<Option<f64>>) -> Self {
        Self(values)
    }

    pub fn get(&self, idx: usize) -> Option<f64> {
        self.0.get(idx).copied().flatten()
    }

    pub fn set(&mut self, idx: usize, value: Option<f64>) {
        self.0[idx] = value;
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<f64>> + '_ {
        self.0.iter().copied()
    }

    pub fn named(&self, spec: &DatasetSpec) -> BTreeMap<&'static str, Option<f64>> {
        spec.metric_names().zip(self.iter()).collect()
    }
}

impl Serialize for Metrics {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

/// Canonical unit after transform.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LongRecord {
    pub geography: GeographyKey,
    pub period: Period,
    pub attributes: Attributes,
    pub metrics: Metrics,
}

impl LongRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            geo_id: self.geography.geo_id.clone(),
            period: self.period.clone(),
        }
    }
}

/// The store's current row for a key.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingRecord {
    pub record: LongRecord,
    pub last_update_time: DateTime<Utc>,
}
