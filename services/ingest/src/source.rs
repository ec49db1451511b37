//! Where raw panel bytes come from.
//!
//! The pipeline only needs bytes; how they are obtained is behind
//! `SourceFetcher`. This crate ships the filesystem implementation. The
//! collector service provides the HTTP one.

use crate::dataset::DatasetSpec;
use crate::error::{IngestError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::info;

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, spec: &DatasetSpec) -> Result<Vec<u8>>;

    /// Short label recorded in the run audit trail.
    fn describe(&self, spec: &DatasetSpec) -> String;
}

/// Raw artifact file name: `<UTC timestamp>_<first 12 hex chars of sha256>.csv`.
/// Names sort chronologically.
pub fn artifact_file_name(captured_at: DateTime<Utc>, content_hash_hex: &str) -> String {
    let prefix: String = content_hash_hex.chars().take(12).collect();
    format!("{}_{}.csv", captured_at.format("%Y%m%dT%H%M%SZ"), prefix)
}

pub fn dataset_dir(raw_root: &Path, spec: &DatasetSpec) -> PathBuf {
    raw_root.join(spec.slug)
}

/// Newest `.csv` artifact under `<raw_root>/<slug>/`.
pub async fn latest_raw_file(raw_root: &Path, spec: &DatasetSpec) -> Result<PathBuf> {
    let dir = dataset_dir(raw_root, spec);
    let mut entries = tokio::fs::read_dir(&dir)
        .await
        .map_err(|e| IngestError::Fetch(format!("cannot list {}: {e}", dir.display())))?;

    let mut latest: Option<PathBuf> = None;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| IngestError::Fetch(format!("cannot list {}: {e}", dir.display())))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        if latest.as_ref().map_or(true, |best| path.file_name() > best.file_name()) {
            latest = Some(path);
        }
    }

    latest.ok_or_else(|| IngestError::Fetch(format!("no raw artifacts in {}", dir.display())))
}

/// Reads a panel from disk: an explicit file, or the newest artifact for the
/// dataset under the raw root.
#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Latest(PathBuf),
}

impl FileSource {
    async fn resolve(&self, spec: &DatasetSpec) -> Result<PathBuf> {
        match self {
            FileSource::Path(path) => Ok(path.clone()),
            FileSource::Latest(root) => latest_raw_file(root, spec).await,
        }
    }
}

#[async_trait]
impl SourceFetcher for FileSource {
    async fn fetch(&self, spec: &DatasetSpec) -> Result<Vec<u8>> {
        let path = self.resolve(spec).await?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| IngestError::Fetch(format!("cannot read {}: {e}", path.display())))?;
        info!(dataset = %spec.kind, path = %path.display(), bytes = bytes.len(), "loaded raw panel");
        Ok(bytes)
    }

    fn describe(&self, spec: &DatasetSpec) -> String {
        match self {
            FileSource::Path(path) => format!("file:{}", path.display()),
            FileSource::Latest(root) => format!("file:{}/latest", dataset_dir(root, spec).display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetKind;
    use chrono::TimeZone;

    #[test]
    fn test_artifact_names_sort_by_time() {
        let early = Utc.with_ymd_and_hms(2025, 1, 9, 23, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 1, 10, 1, 0, 0).unwrap();
        let a = artifact_file_name(early, "ffffffffffffffffffff");
        let b = artifact_file_name(late, "000000000000000000");
        assert_eq!(a, "20250109T230000Z_ffffffffffff.csv");
        assert!(a < b);
    }

    #[tokio::test]
    async fn test_latest_raw_file_picks_newest_csv() {
        let root = tempfile::tempdir().unwrap();
        let spec = DatasetKind::VacancyIndex.spec();
        let dir = dataset_dir(root.path(), spec);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("20250101T000000Z_aaaaaaaaaaaa.csv"), "old").unwrap();
        std::fs::write(dir.join("20250201T000000Z_bbbbbbbbbbbb.csv"), "new").unwrap();
        std::fs::write(dir.join("20250301T000000Z_cccccccccccc.html"), "debug").unwrap();

        let latest = latest_raw_file(root.path(), spec).await.unwrap();
        assert!(latest.ends_with("20250201T000000Z_bbbbbbbbbbbb.csv"));

        let bytes = FileSource::Latest(root.path().to_path_buf()).fetch(spec).await.unwrap();
        assert_eq!(bytes, b"new");
    }

    #[tokio::test]
    async fn test_missing_artifacts_is_fetch_error() {
        let root = tempfile::tempdir().unwrap();
        let err = latest_raw_file(root.path(), DatasetKind::RentEstimates.spec())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Fetch(_)));
    }
}
