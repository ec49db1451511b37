//! HTTP source fetcher and raw artifact storage.

use crate::sources::{discover_csv_url, Locator, Source};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use market_ingest::source::{artifact_file_name, dataset_dir};
use market_ingest::{DatasetKind, DatasetSpec, IngestError, SourceFetcher};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;
use tracing::{info, warn};
use url::Url;

const USER_AGENT: &str = "MarketPanels/1.0 (housing market data collector)";

/// Lower-case hex sha256.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactOutcome {
    Stored(PathBuf),
    /// Same content already on disk.
    Duplicate(PathBuf),
}

/// Write `bytes` under `<raw_root>/<slug>/` unless an artifact with the same
/// content hash is already there (`force` writes anyway).
pub async fn save_artifact(
    raw_root: &Path,
    spec: &DatasetSpec,
    bytes: &[u8],
    hash: &str,
    captured_at: DateTime<Utc>,
    force: bool,
) -> std::io::Result<ArtifactOutcome> {
    let dir = dataset_dir(raw_root, spec);
    fs::create_dir_all(&dir).await?;

    let name = artifact_file_name(captured_at, hash);
    if !force {
        let suffix = name.split_once('_').map(|(_, s)| s.to_string()).unwrap_or_default();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().ends_with(&suffix) {
                return Ok(ArtifactOutcome::Duplicate(entry.path()));
            }
        }
    }

    let path = dir.join(name);
    fs::write(&path, bytes).await?;
    Ok(ArtifactOutcome::Stored(path))
}

#[derive(Debug)]
pub struct Collected {
    pub url: Url,
    pub bytes: Vec<u8>,
    pub content_hash: String,
    pub artifact: Option<ArtifactOutcome>,
}

pub struct HttpSourceFetcher {
    client: reqwest::Client,
    sources: HashMap<DatasetKind, Source>,
    rate_limit: Duration,
    raw_root: PathBuf,
    force: bool,
}

impl HttpSourceFetcher {
    pub fn new(
        sources: Vec<Source>,
        raw_root: PathBuf,
        rate_limit: Duration,
        http_timeout: Duration,
        force: bool,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            sources: sources.into_iter().map(|s| (s.dataset, s)).collect(),
            rate_limit,
            raw_root,
            force,
        })
    }

    fn source(&self, spec: &DatasetSpec) -> Result<&Source, IngestError> {
        self.sources
            .get(&spec.kind)
            .ok_or_else(|| IngestError::Fetch(format!("no source configured for {}", spec.kind)))
    }

    async fn get(&self, url: &Url) -> Result<Vec<u8>, IngestError> {
        // Rate limit: wait before every request
        sleep(self.rate_limit).await;

        info!(url = %url, "fetching");
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| IngestError::Fetch(format!("{url}: {e}")))?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| IngestError::Fetch(format!("{url}: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn resolve(&self, source: &Source) -> Result<Url, IngestError> {
        let locator = source
            .locator()
            .map_err(|e| IngestError::Configuration(format!("{e:#}")))?;
        match locator {
            Locator::Direct(url) => Ok(url),
            Locator::Page { url, patterns, exclude } => {
                let page = self.get(&url).await?;
                let page = String::from_utf8_lossy(&page);
                let found = discover_csv_url(&page, &url, &patterns, &exclude).ok_or_else(|| {
                    IngestError::Fetch(format!("[{}] no CSV link found on {url}", source.id))
                })?;
                info!(source = %source.id, csv = %found, "discovered CSV link");
                Ok(found)
            }
        }
    }

    /// Download the dataset's current CSV and keep a raw copy. Failing to keep
    /// the copy is logged, not fatal.
    pub async fn collect(&self, spec: &DatasetSpec) -> Result<Collected, IngestError> {
        let source = self.source(spec)?;
        let url = self.resolve(source).await?;
        let bytes = self.get(&url).await?;
        let hash = content_hash(&bytes);
        info!(source = %source.id, provider = %source.provider, bytes = bytes.len(), hash = %hash, "downloaded");

        let artifact = match save_artifact(&self.raw_root, spec, &bytes, &hash, Utc::now(), self.force).await {
            Ok(outcome) => {
                match &outcome {
                    ArtifactOutcome::Stored(path) => info!(path = %path.display(), "artifact saved"),
                    ArtifactOutcome::Duplicate(path) => {
                        info!(path = %path.display(), "artifact already on disk")
                    }
                }
                Some(outcome)
            }
            Err(e) => {
                warn!(source = %source.id, error = %e, "could not save raw artifact");
                None
            }
        };

        Ok(Collected {
            url,
            bytes,
            content_hash: hash,
            artifact,
        })
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch(&self, spec: &DatasetSpec) -> market_ingest::Result<Vec<u8>> {
        Ok(self.collect(spec).await?.bytes)
    }

    fn describe(&self, spec: &DatasetSpec) -> String {
        match self.sources.get(&spec.kind) {
            Some(source) => match (&source.csv_url, &source.page_url) {
                (Some(csv), _) => csv.clone(),
                (None, Some(page)) => format!("{} (page)", page),
                (None, None) => source.id.clone(),
            },
            None => "unconfigured".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_identical_content_saved_once() {
        let root = tempfile::tempdir().unwrap();
        let spec = DatasetKind::VacancyIndex.spec();
        let bytes = b"location_name\n";
        let hash = content_hash(bytes);
        let first = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();

        let stored = save_artifact(root.path(), spec, bytes, &hash, first, false).await.unwrap();
        let ArtifactOutcome::Stored(path) = stored else {
            panic!("expected a new artifact");
        };
        assert!(path.starts_with(root.path().join("vacancy-index")));

        let again = save_artifact(root.path(), spec, bytes, &hash, later, false).await.unwrap();
        assert_eq!(again, ArtifactOutcome::Duplicate(path));

        let forced = save_artifact(root.path(), spec, bytes, &hash, later, true).await.unwrap();
        assert!(matches!(forced, ArtifactOutcome::Stored(_)));
        assert_eq!(std::fs::read_dir(root.path().join("vacancy-index")).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_unconfigured_dataset_is_fetch_error() {
        let fetcher = HttpSourceFetcher::new(
            Vec::new(),
            PathBuf::from("./unused"),
            Duration::ZERO,
            Duration::from_secs(1),
            false,
        )
        .unwrap();
        let err = fetcher.fetch(DatasetKind::MedianSalePrice.spec()).await.unwrap_err();
        assert!(matches!(err, IngestError::Fetch(_)));
    }
}
