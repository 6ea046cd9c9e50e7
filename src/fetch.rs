//! The fetcher seam: how a single id is probed against a source.
//!
//! A [`Fetcher`] encapsulates the actual request, response parsing, and the
//! classification of "does not exist" versus "transient failure". The engine
//! core never inspects payload contents; it only reacts to the tri-state
//! [`FetchOutcome`].

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::SourceConfig;
use crate::models::FetchOutcome;

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Probe one id. Never returns an error: every failure mode is folded
    /// into the outcome classification.
    async fn probe(&self, partition: &str, id: u64) -> FetchOutcome;
}

/// Probes `GET {base_url}/{id}` over HTTP.
///
/// 404 means the id does not exist at the source; any other non-success
/// status, transport error, or timeout is transient. Ids are globally unique
/// at the source, so the partition key does not appear in the URL.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFetcher {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn probe(&self, _partition: &str, id: u64) -> FetchOutcome {
        let url = format!("{}/{}", self.base_url, id);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => FetchOutcome::NotFound,
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => FetchOutcome::Success(body),
                Err(e) => FetchOutcome::TransientError(format!("reading body: {e}")),
            },
            Ok(resp) => FetchOutcome::TransientError(format!("http status {}", resp.status())),
            Err(e) => FetchOutcome::TransientError(e.to_string()),
        }
    }
}

/// Probes a local directory of previously captured raw responses, laid out
/// as `{root}/{partition}/{id}.json`.
///
/// Lets a dump of raw payloads be re-ingested without touching the network,
/// and gives the tests a deterministic source: a present file is a Success,
/// an absent one is the source saying NotFound.
pub struct ArchiveFetcher {
    root: PathBuf,
}

impl ArchiveFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Fetcher for ArchiveFetcher {
    async fn probe(&self, partition: &str, id: u64) -> FetchOutcome {
        let path = self.root.join(partition).join(format!("{id}.json"));
        if !path.exists() {
            return FetchOutcome::NotFound;
        }
        match std::fs::read_to_string(&path) {
            Ok(body) => FetchOutcome::Success(body),
            Err(e) => FetchOutcome::TransientError(format!("{}: {e}", path.display())),
        }
    }
}

/// Build the fetcher described by the source configuration.
pub fn build_fetcher(source: &SourceConfig) -> Result<Box<dyn Fetcher>> {
    match source.kind.as_str() {
        "http" => {
            let base_url = source
                .base_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("source.base_url is not configured"))?;
            Ok(Box::new(HttpFetcher::new(base_url, source.timeout_secs)?))
        }
        "archive" => {
            let root = source
                .archive_root
                .clone()
                .ok_or_else(|| anyhow::anyhow!("source.archive_root is not configured"))?;
            Ok(Box::new(ArchiveFetcher::new(root)))
        }
        other => anyhow::bail!("Unknown source kind: '{}'", other),
    }
}
