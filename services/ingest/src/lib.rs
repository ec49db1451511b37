//! Market Ingest - real-estate panel pipeline
//!
//! Turns provider panels (one row per geography, one column per period) into
//! long records, validates them, reconciles them against what the store
//! already holds without regressing known values, and commits the result in
//! retried batches before refreshing the dataset's derived view.

pub mod config;
pub mod dataset;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod reader;
pub mod reconcile;
pub mod record;
pub mod source;
pub mod store;
pub mod transform;
pub mod validate;

pub use config::{PipelineConfig, Settings, VolumeOverride};
pub use dataset::{DatasetKind, DatasetSpec};
pub use error::{IngestError, Result, StoreError};
pub use orchestrator::ViewRefresh;
pub use pipeline::{run_dataset, run_with_audit, RunError, RunSummary};
pub use source::{FileSource, SourceFetcher};
pub use store::{MemoryStore, PgStore, Store};
