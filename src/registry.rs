//! Registry of configured data sources.
//!
//! Each [`SourceConnector`] bundles everything the engines need to drive
//! one source end to end: its fetcher, its enricher, its capabilities, and
//! the pair of indices it writes to. Sources form a closed set, built from
//! the config file plus any programmatic registrations — there is no
//! dynamic subclass dispatch.

use serde_json::Value;

use crate::config::Config;
use crate::enricher::Enricher;
use crate::fetcher::{Fetcher, SourceCapabilities};
use crate::source_jsonl::{JsonlEnricher, JsonlFetcher};

/// One registered data source.
pub struct SourceConnector {
    /// Connector name (the `[sources.<name>]` key); scopes the enrichment
    /// checkpoint in the enriched index.
    pub name: String,
    /// Stable identifier of the upstream repository/channel; scopes the
    /// raw-sync checkpoint in the raw index.
    pub origin: String,
    pub raw_index: String,
    pub enriched_index: String,
    /// Default fetch category when the CLI does not pass one.
    pub category: Option<String>,
    /// Extra mapping installed on the raw index at creation.
    pub raw_mapping: Option<Value>,
    /// Extra mapping installed on the enriched index at creation.
    pub enriched_mapping: Option<Value>,
    pub fetcher: Box<dyn Fetcher>,
    pub enricher: Box<dyn Enricher>,
}

impl SourceConnector {
    pub fn capabilities(&self) -> SourceCapabilities {
        self.fetcher.capabilities()
    }
}

/// Registry for sources (built-in kinds and custom registrations).
pub struct SourceRegistry {
    sources: Vec<SourceConnector>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    /// Build a registry from all `[sources.*]` entries in the config.
    ///
    /// Unknown kinds are rejected here, pre-flight, rather than at run
    /// time.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        for (name, cfg) in &config.sources {
            match cfg.kind.as_str() {
                "jsonl" => {
                    let path = cfg
                        .path
                        .clone()
                        .ok_or_else(|| anyhow::anyhow!("sources.{}: missing path", name))?;
                    registry.register(SourceConnector {
                        name: name.clone(),
                        origin: cfg.origin.clone(),
                        raw_index: cfg.raw_index.clone(),
                        enriched_index: cfg.enriched_index.clone(),
                        category: cfg.category.clone(),
                        raw_mapping: None,
                        enriched_mapping: None,
                        fetcher: Box::new(JsonlFetcher::new(path)),
                        enricher: Box::new(JsonlEnricher::new(name)),
                    });
                }
                other => anyhow::bail!(
                    "sources.{}: unknown kind '{}'. Built-in kinds: jsonl",
                    name,
                    other
                ),
            }
        }
        Ok(registry)
    }

    pub fn register(&mut self, source: SourceConnector) {
        self.sources.push(source);
    }

    pub fn sources(&self) -> &[SourceConnector] {
        &self.sources
    }

    pub fn find(&self, name: &str) -> Option<&SourceConnector> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
