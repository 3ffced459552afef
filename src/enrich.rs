//! Enrichment engine.
//!
//! Consumes the raw-index cursor, applies the source's
//! [`Enricher`](crate::enricher::Enricher) mapping,
//! and flushes enriched documents to the enriched index in bulk packs. The
//! enrichment checkpoint is tracked independently of the raw sync
//! checkpoint: it is the max `metadata__updated_on` already present in the
//! enriched index for this connector, so enrichment lags raw ingestion
//! without a shared log.
//!
//! Before enrichment begins, a one-time priming pass walks the full raw
//! cursor collecting every distinct identity key and resolves them against
//! the identity backend, so the same identity is not resolved N times
//! within one run. The resolver's own memoization makes the enrichment
//! pass's lookups cache hits.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::enricher::{EnrichContext, Mapped};
use crate::error::Result;
use crate::identity::{IdentityKey, IdentityResolver};
use crate::index::{Filter, IndexStore};
use crate::models::{EnrichReport, RawRecord};
use crate::projects::ProjectMap;
use crate::raw_sync::{RawSyncEngine, UPDATED_ON_FIELD};
use crate::registry::SourceConnector;

pub const CONNECTOR_FIELD: &str = "connector_name";
pub const ENRICHED_ON_FIELD: &str = "metadata__enriched_on";

/// Per-invocation enrichment parameters.
#[derive(Debug, Clone)]
pub struct EnrichOptions {
    /// When false, re-enrich the whole raw index.
    pub incremental: bool,
    pub page_size: usize,
}

impl Default for EnrichOptions {
    fn default() -> Self {
        Self {
            incremental: true,
            page_size: 100,
        }
    }
}

pub struct EnrichmentEngine<'a, S: IndexStore + ?Sized> {
    store: &'a S,
    bulk_size: usize,
}

impl<'a, S: IndexStore + ?Sized> EnrichmentEngine<'a, S> {
    pub fn new(store: &'a S, bulk_size: usize) -> Self {
        Self {
            store,
            bulk_size: bulk_size.max(1),
        }
    }

    /// Run one enrichment pass for `source`.
    ///
    /// `resolver` is the per-run identity resolver, or `None` when identity
    /// resolution is disabled. A mapping failure for one record is logged
    /// and skipped; it never aborts the run.
    pub async fn enrich(
        &self,
        source: &SourceConnector,
        raw_engine: &RawSyncEngine<'a, S>,
        mut resolver: Option<&mut IdentityResolver>,
        projects: &ProjectMap,
        opts: &EnrichOptions,
    ) -> Result<EnrichReport> {
        let checkpoint = if opts.incremental {
            self.store
                .max_field(
                    &source.enriched_index,
                    UPDATED_ON_FIELD,
                    &[Filter::term(CONNECTOR_FIELD, &source.name)],
                )
                .await?
        } else {
            None
        };

        info!(
            source = %source.name,
            from = ?checkpoint,
            "starting enrichment"
        );

        if let Some(resolver) = resolver.as_deref_mut() {
            self.prime_identities(source, raw_engine, resolver, checkpoint, opts)
                .await?;
        }

        let mut report = EnrichReport {
            resumed_from: checkpoint,
            ..EnrichReport::default()
        };
        let mut pack: Vec<Value> = Vec::with_capacity(self.bulk_size);

        let mut cursor = raw_engine.cursor(
            &source.raw_index,
            Some(&source.origin),
            None,
            checkpoint,
            opts.page_size,
        );

        while let Some(raw) = cursor.next().await? {
            let mut ctx = EnrichContext {
                resolver: resolver.as_deref_mut(),
                projects,
            };
            let mapped = match source.enricher.map(&raw, &mut ctx).await {
                Ok(mapped) => mapped,
                Err(err) => {
                    warn!(
                        source = %source.name,
                        unique_id = %raw.unique_id,
                        %err,
                        "mapping failed, skipping record"
                    );
                    report.failed += 1;
                    continue;
                }
            };

            let enriched_on = Utc::now();
            match mapped {
                Mapped::Skip => {
                    report.skipped += 1;
                    debug!(unique_id = %raw.unique_id, "record excluded by mapping");
                }
                Mapped::One(mut doc) => {
                    decorate(&mut doc, &raw, &source.name, projects, enriched_on);
                    set_id(&mut doc, raw.unique_id.clone());
                    pack.push(doc);
                }
                Mapped::Many(docs) => {
                    for (seq, mut doc) in docs.into_iter().enumerate() {
                        decorate(&mut doc, &raw, &source.name, projects, enriched_on);
                        set_id(&mut doc, format!("{}_{}", raw.unique_id, seq));
                        pack.push(doc);
                    }
                }
            }

            while pack.len() >= self.bulk_size {
                let rest = pack.split_off(self.bulk_size);
                report.enriched += self.flush(&source.enriched_index, &mut pack).await? as u64;
                pack = rest;
            }
        }

        if !pack.is_empty() {
            report.enriched += self.flush(&source.enriched_index, &mut pack).await? as u64;
        }

        if report.enriched == 0 {
            info!(source = %source.name, "nothing to enrich, no upload issued");
        } else {
            info!(
                source = %source.name,
                enriched = report.enriched,
                skipped = report.skipped,
                failed = report.failed,
                "enrichment finished"
            );
        }
        Ok(report)
    }

    /// Walk the raw cursor once, resolving every distinct identity key so
    /// the enrichment pass hits only the resolver cache. Running this twice
    /// is a no-op thanks to that same cache.
    async fn prime_identities(
        &self,
        source: &SourceConnector,
        raw_engine: &RawSyncEngine<'a, S>,
        resolver: &mut IdentityResolver,
        checkpoint: Option<DateTime<Utc>>,
        opts: &EnrichOptions,
    ) -> Result<()> {
        let mut cursor = raw_engine.cursor(
            &source.raw_index,
            Some(&source.origin),
            None,
            checkpoint,
            opts.page_size,
        );

        let mut seen: HashSet<IdentityKey> = HashSet::new();
        while let Some(raw) = cursor.next().await? {
            for key in source.enricher.identities(&raw) {
                if seen.insert(key.clone()) {
                    resolver.resolve(&key, &source.name).await;
                }
            }
        }
        debug!(
            source = %source.name,
            identities = seen.len(),
            "identity priming pass complete"
        );
        Ok(())
    }

    async fn flush(&self, index: &str, pack: &mut Vec<Value>) -> Result<usize> {
        let written = self.store.bulk_upsert(index, pack, "id").await?;
        pack.clear();
        Ok(written)
    }
}

/// Attach the engine-owned fields every enriched document carries,
/// regardless of source: connector name, origin, the raw record's
/// timestamps, and the project.
fn decorate(
    doc: &mut Value,
    raw: &RawRecord,
    connector: &str,
    projects: &ProjectMap,
    enriched_on: DateTime<Utc>,
) {
    let Some(obj) = doc.as_object_mut() else {
        return;
    };
    obj.insert(CONNECTOR_FIELD.to_string(), Value::String(connector.to_string()));
    obj.insert("origin".to_string(), Value::String(raw.origin.clone()));
    obj.insert(
        UPDATED_ON_FIELD.to_string(),
        serde_json::to_value(raw.metadata_updated_on).unwrap_or(Value::Null),
    );
    obj.insert(
        ENRICHED_ON_FIELD.to_string(),
        serde_json::to_value(enriched_on).unwrap_or(Value::Null),
    );
    obj.insert(
        "grimoire_creation_date".to_string(),
        serde_json::to_value(raw.metadata_updated_on).unwrap_or(Value::Null),
    );

    let project = raw
        .project
        .clone()
        .or_else(|| projects.project_for(&raw.origin).map(str::to_string));
    if let Some(project) = project {
        obj.insert("project".to_string(), Value::String(project));
    }
}

fn set_id(doc: &mut Value, id: String) {
    if let Some(obj) = doc.as_object_mut() {
        obj.insert("id".to_string(), Value::String(id));
    }
}
