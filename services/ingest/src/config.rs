//! Settings from the environment, and the explicit per-run configuration
//! derived from them.

use crate::dataset::{DatasetSpec, VolumeRules};
use crate::error::{IngestError, Result};
use crate::orchestrator::RetryPolicy;
use crate::reconcile::ReconcilePolicy;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const MAX_BATCH_SIZE: usize = 5000;

#[derive(Debug, Clone)]
pub struct Settings {
    pub db_url: String,
    pub raw_fs_dir: PathBuf,
    pub batch_size: usize,
    pub retry_max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub store_timeout_secs: u64,
    pub stamp_preserved: bool,
    pub rate_limit_ms: u64,
    pub http_timeout_secs: u64,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys take their default; set but
    /// unparseable keys are configuration errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let db_url = lookup("DB_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| IngestError::Configuration("DB_URL env var missing".into()))?;

        let settings = Self {
            db_url,
            raw_fs_dir: PathBuf::from(lookup("RAW_FS_DIR").unwrap_or_else(|| "./data/raw".to_string())),
            batch_size: parse_or(&lookup, "BATCH_SIZE", 500)?,
            retry_max_attempts: parse_or(&lookup, "RETRY_MAX_ATTEMPTS", 3)?,
            retry_base_ms: parse_or(&lookup, "RETRY_BASE_MS", 500)?,
            retry_max_ms: parse_or(&lookup, "RETRY_MAX_MS", 10_000)?,
            store_timeout_secs: parse_or(&lookup, "STORE_TIMEOUT_SECS", 30)?,
            stamp_preserved: parse_flag(&lookup, "STAMP_PRESERVED", false)?,
            rate_limit_ms: parse_or(&lookup, "RATE_LIMIT_MS", 1000)?,
            http_timeout_secs: parse_or(&lookup, "HTTP_TIMEOUT_SECS", 120)?,
        };

        if !(1..=MAX_BATCH_SIZE).contains(&settings.batch_size) {
            return Err(IngestError::Configuration(format!(
                "BATCH_SIZE must be between 1 and {MAX_BATCH_SIZE}, got {}",
                settings.batch_size
            )));
        }
        if settings.retry_max_attempts == 0 {
            return Err(IngestError::Configuration("RETRY_MAX_ATTEMPTS must be at least 1".into()));
        }
        if settings.store_timeout_secs == 0 {
            return Err(IngestError::Configuration("STORE_TIMEOUT_SECS must be at least 1".into()));
        }

        Ok(settings)
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            batch_size: self.batch_size,
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                base_delay: Duration::from_millis(self.retry_base_ms),
                max_delay: Duration::from_millis(self.retry_max_ms),
            },
            call_timeout: Duration::from_secs(self.store_timeout_secs),
            reconcile: ReconcilePolicy {
                stamp_preserved: self.stamp_preserved,
            },
            ..PipelineConfig::default()
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| IngestError::Configuration(format!("{key} has invalid value '{raw}'"))),
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(IngestError::Configuration(format!(
                "{key} must be true or false, got '{raw}'"
            ))),
        },
    }
}

/// Volume thresholds that replace the dataset's own, when set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeOverride {
    pub min_rows: Option<usize>,
    pub min_period_columns: Option<usize>,
}

/// Everything a dataset run needs beyond the store and the raw bytes.
/// Built once, passed down explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub call_timeout: Duration,
    pub reconcile: ReconcilePolicy,
    pub volume: VolumeOverride,
    /// Reconcile against the store but write nothing.
    pub dry_run: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(30),
            reconcile: ReconcilePolicy::default(),
            volume: VolumeOverride::default(),
            dry_run: false,
        }
    }
}

impl PipelineConfig {
    /// An explicit period-column minimum replaces the dataset's coverage rule.
    pub fn volume_for(&self, spec: &DatasetSpec) -> VolumeRules {
        let coverage = match self.volume.min_period_columns {
            Some(_) => None,
            None => spec.volume.coverage,
        };
        VolumeRules {
            min_rows: self.volume.min_rows.unwrap_or(spec.volume.min_rows),
            min_period_columns: self
                .volume
                .min_period_columns
                .unwrap_or(spec.volume.min_period_columns),
            earliest_period: spec.volume.earliest_period,
            coverage,
        }
    }
}
