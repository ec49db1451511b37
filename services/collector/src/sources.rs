//! Source configuration and CSV link discovery.

use anyhow::{Context, Result};
use market_ingest::DatasetKind;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use url::Url;

#[derive(Debug, Deserialize)]
pub struct SourcesConfig {
    pub version: String,
    pub sources: Vec<Source>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub provider: String,
    pub dataset: DatasetKind,
    /// Stable CSV location. Takes precedence over page discovery.
    #[serde(default)]
    pub csv_url: Option<String>,
    /// Page that links to the current CSV.
    #[serde(default)]
    pub page_url: Option<String>,
    /// Tried in order against the page source; first match wins.
    #[serde(default)]
    pub link_patterns: Vec<String>,
    /// Candidates containing any of these substrings are skipped.
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// How to reach a source's CSV.
#[derive(Debug, Clone)]
pub enum Locator {
    Direct(Url),
    Page {
        url: Url,
        patterns: Vec<Regex>,
        exclude: Vec<String>,
    },
}

impl Source {
    pub fn locator(&self) -> Result<Locator> {
        if let Some(csv_url) = &self.csv_url {
            let url = Url::parse(csv_url).with_context(|| format!("[{}] invalid csv_url", self.id))?;
            return Ok(Locator::Direct(url));
        }
        let page_url = self
            .page_url
            .as_deref()
            .with_context(|| format!("[{}] needs csv_url or page_url", self.id))?;
        if self.link_patterns.is_empty() {
            anyhow::bail!("[{}] page_url given without link_patterns", self.id);
        }
        let patterns = self
            .link_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("[{}] invalid link pattern {p}", self.id)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Locator::Page {
            url: Url::parse(page_url).with_context(|| format!("[{}] invalid page_url", self.id))?,
            patterns,
            exclude: self.exclude.clone(),
        })
    }
}

impl SourcesConfig {
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read sources config")?;
        Self::parse(&content)
    }

    /// Parse and check every source. Two enabled sources for one dataset are
    /// ambiguous and rejected.
    pub fn parse(content: &str) -> Result<Self> {
        let config: SourcesConfig = serde_json::from_str(content).context("Failed to parse sources config")?;

        let mut datasets = HashSet::new();
        for source in &config.sources {
            source.locator()?;
            if source.enabled && !datasets.insert(source.dataset) {
                anyhow::bail!(
                    "AMBIGUITY: more than one enabled source for dataset {}",
                    source.dataset
                );
            }
        }
        Ok(config)
    }
}

/// First link in `page` matching one of `patterns`, resolved against the page URL.
///
/// Page sources often embed URLs JSON-escaped (`https:\/\/...`) or
/// HTML-escaped (`&amp;`); both are undone before matching.
pub fn discover_csv_url(page: &str, page_url: &Url, patterns: &[Regex], exclude: &[String]) -> Option<Url> {
    let text = page.replace("\\/", "/").replace("&amp;", "&");
    for pattern in patterns {
        for found in pattern.find_iter(&text) {
            let candidate = found.as_str();
            if exclude.iter().any(|x| candidate.contains(x.as_str())) {
                continue;
            }
            let absolute = if candidate.starts_with("//") {
                format!("https:{candidate}")
            } else {
                candidate.to_string()
            };
            if let Ok(url) = page_url.join(&absolute) {
                return Some(url);
            }
        }
    }
    None
}
