use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::PartitionBand;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    pub source: SourceConfig,
    pub partitions: Vec<PartitionConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root of the partitioned raw record tree.
    pub root: PathBuf,
    /// Directory consolidated artifacts are written to.
    pub consolidated: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Probe backend: `http` or `archive`.
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Base URL for the `http` backend; ids are appended as the final path
    /// segment.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Root directory for the `archive` backend
    /// (`{archive_root}/{partition}/{id}.json`).
    #[serde(default)]
    pub archive_root: Option<PathBuf>,
    /// Record collection fetched units belong to (e.g. `match_stats`).
    pub dataset: String,
    /// Sub-collection newly fetched records are filed under (e.g. a season
    /// label).
    pub category: String,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Manifest flush cadence during a chunk, in completed probes.
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
    #[serde(default = "default_max_consecutive_misses")]
    pub max_consecutive_misses: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_kind() -> String {
    "http".to_string()
}
fn default_delay_ms() -> u64 {
    1000
}
fn default_chunk_size() -> u64 {
    200
}
fn default_flush_every() -> usize {
    25
}
fn default_max_consecutive_misses() -> u32 {
    30
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct PartitionConfig {
    pub key: String,
    pub min_id: u64,
    pub max_id: u64,
}

impl Config {
    /// All configured partition bands, in configuration order.
    pub fn bands(&self) -> Vec<PartitionBand> {
        self.partitions
            .iter()
            .map(|p| PartitionBand {
                key: p.key.clone(),
                min_id: p.min_id,
                max_id: p.max_id,
            })
            .collect()
    }

    pub fn band(&self, key: &str) -> Option<PartitionBand> {
        self.partitions.iter().find(|p| p.key == key).map(|p| PartitionBand {
            key: p.key.clone(),
            min_id: p.min_id,
            max_id: p.max_id,
        })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.partitions.is_empty() {
        anyhow::bail!("at least one [[partitions]] entry is required");
    }
    for (i, p) in config.partitions.iter().enumerate() {
        if p.key.trim().is_empty() {
            anyhow::bail!("partitions[{}].key must not be empty", i);
        }
        if p.min_id > p.max_id {
            anyhow::bail!(
                "partition '{}': min_id {} exceeds max_id {}",
                p.key,
                p.min_id,
                p.max_id
            );
        }
        if config.partitions[..i].iter().any(|q| q.key == p.key) {
            anyhow::bail!("duplicate partition key '{}'", p.key);
        }
    }

    if config.source.dataset.trim().is_empty() {
        anyhow::bail!("source.dataset must not be empty");
    }
    if config.source.category.trim().is_empty() {
        anyhow::bail!("source.category must not be empty");
    }
    if config.source.chunk_size == 0 {
        anyhow::bail!("source.chunk_size must be > 0");
    }
    if config.source.flush_every == 0 {
        anyhow::bail!("source.flush_every must be > 0");
    }
    if config.source.max_consecutive_misses == 0 {
        anyhow::bail!("source.max_consecutive_misses must be > 0");
    }

    match config.source.kind.as_str() {
        "http" => {
            if config.source.base_url.is_none() {
                anyhow::bail!("source.base_url must be set when kind is 'http'");
            }
        }
        "archive" => {
            if config.source.archive_root.is_none() {
                anyhow::bail!("source.archive_root must be set when kind is 'archive'");
            }
        }
        other => anyhow::bail!("Unknown source kind: '{}'. Must be http or archive.", other),
    }

    Ok(config)
}
