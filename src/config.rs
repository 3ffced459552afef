use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub index: IndexConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub projects: ProjectsConfig,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Base URL of the search index backend, e.g. `http://localhost:9200`.
    pub url: String,
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,
    #[serde(default = "default_scroll_size")]
    pub scroll_size: usize,
    /// How long `bulk_upsert_sync` waits for writes to become visible.
    #[serde(default = "default_sync_wait_secs")]
    pub sync_wait_secs: u64,
}

fn default_bulk_size() -> usize {
    500
}
fn default_scroll_size() -> usize {
    100
}
fn default_sync_wait_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdentityConfig {
    /// Base URL of the identity-management backend. When unset, enrichment
    /// runs without identity resolution.
    #[serde(default)]
    pub url: Option<String>,
    /// Label used when no enrollment covers a record's timestamp.
    #[serde(default = "default_unaffiliated")]
    pub unaffiliated: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            url: None,
            unaffiliated: default_unaffiliated(),
        }
    }
}

fn default_unaffiliated() -> String {
    "Unknown".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProjectsConfig {
    /// Path to the JSON project-mapping file. Optional.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// One configured data source. The key under `[sources.<name>]` is the
/// connector name used for checkpointing the enriched index.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Source kind. Currently `jsonl` is built in; other kinds are
    /// registered programmatically.
    pub kind: String,
    /// Stable identifier of the upstream repository/channel.
    pub origin: String,
    /// Path to the record file, for file-backed kinds.
    #[serde(default)]
    pub path: Option<PathBuf>,
    pub raw_index: String,
    pub enriched_index: String,
    #[serde(default)]
    pub category: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if !(100..=1000).contains(&config.index.bulk_size) {
        anyhow::bail!(
            "index.bulk_size must be between 100 and 1000, got {}",
            config.index.bulk_size
        );
    }

    if config.index.scroll_size == 0 {
        anyhow::bail!("index.scroll_size must be > 0");
    }

    for (name, source) in &config.sources {
        if source.origin.is_empty() {
            anyhow::bail!("sources.{}.origin must not be empty", name);
        }
        if source.raw_index == source.enriched_index {
            anyhow::bail!(
                "sources.{}: raw_index and enriched_index must differ",
                name
            );
        }
        if source.kind == "jsonl" && source.path.is_none() {
            anyhow::bail!("sources.{}: jsonl sources require a path", name);
        }
    }

    Ok(config)
}
