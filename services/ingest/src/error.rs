//! Error taxonomy for a dataset run.
//!
//! Every variant is fatal for the run it occurs in. Only `Store` errors raised
//! by an upsert batch are ever retried, and only inside the orchestrator.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The raw panel could not be obtained.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// The panel cannot be turned into well-formed long records.
    #[error("format error: {0}")]
    Format(String),

    /// The transformed dataset was rejected by the validator.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Missing or malformed settings. Raised before any work starts.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl IngestError {
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Short stable label used in run summaries and audit rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::Format(_) => "format",
            Self::Validation(_) => "validation",
            Self::Store(_) => "store",
            Self::Configuration(_) => "configuration",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store refused the call for a reason of its own.
    #[error("{0}")]
    Rejected(String),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_errors_are_retryable() {
        assert!(IngestError::Store(StoreError::Rejected("boom".into())).is_retryable());
        assert!(!IngestError::format("dup").is_retryable());
        assert!(!IngestError::Validation("short".into()).is_retryable());
        assert!(!IngestError::Configuration("DB_URL".into()).is_retryable());
    }

    #[test]
    fn test_timeout_message_names_duration() {
        let err = IngestError::from(StoreError::Timeout(Duration::from_secs(30)));
        assert_eq!(err.kind(), "store");
        assert!(err.to_string().contains("30s"));
    }
}
