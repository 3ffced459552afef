//! Raw synchronization engine.
//!
//! Drives one data source end to end: resolves the resume checkpoint from
//! the raw index, invokes the source's fetcher with it, tags each record
//! with collection metadata, applies the source's drop predicate, and
//! flushes to the index in bulk packs. Nothing is persisted between runs
//! beyond what lives in the target index — the checkpoint is re-derived on
//! every run from a max aggregation over `metadata__updated_on`.
//!
//! Also exposes the pull-based [`RawCursor`] over the raw index that the
//! enrichment engine consumes.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{HarvestError, Result};
use crate::fetcher::FetchArgs;
use crate::index::{Filter, IndexStore, ScanQuery};
use crate::models::{from_epoch_secs, RawRecord, SyncReport};
use crate::registry::SourceConnector;

pub const UPDATED_ON_FIELD: &str = "metadata__updated_on";

/// Per-invocation sync parameters.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Explicit resume timestamp; overrides the derived checkpoint.
    pub from_date: Option<DateTime<Utc>>,
    /// Explicit resume offset; mutually exclusive with `from_date`.
    pub from_offset: Option<u64>,
    pub category: Option<String>,
    /// When false, ignore any checkpoint and fetch in full.
    pub incremental: bool,
    /// Project attached to every collected record.
    pub project: Option<String>,
}

impl SyncOptions {
    pub fn incremental() -> Self {
        Self {
            incremental: true,
            ..Self::default()
        }
    }
}

pub struct RawSyncEngine<'a, S: IndexStore + ?Sized> {
    store: &'a S,
    bulk_size: usize,
    sync_wait: Duration,
}

impl<'a, S: IndexStore + ?Sized> RawSyncEngine<'a, S> {
    pub fn new(store: &'a S, bulk_size: usize, sync_wait: Duration) -> Self {
        Self {
            store,
            bulk_size: bulk_size.max(1),
            sync_wait,
        }
    }

    /// Decide where the run resumes from.
    ///
    /// Explicit `from_date`/`from_offset` win; both at once is a config
    /// error caught pre-flight. Otherwise, with incremental enabled and a
    /// date-resume-capable source, the checkpoint is the max
    /// `metadata__updated_on` already in the raw index for this origin.
    pub async fn resolve_checkpoint(
        &self,
        source: &SourceConnector,
        opts: &SyncOptions,
    ) -> Result<Option<DateTime<Utc>>> {
        if opts.from_date.is_some() && opts.from_offset.is_some() {
            return Err(HarvestError::Config(
                "from_date and from_offset are mutually exclusive".to_string(),
            ));
        }
        if opts.from_date.is_some() {
            return Ok(opts.from_date);
        }
        if opts.from_offset.is_some() || !opts.incremental {
            return Ok(None);
        }
        if !source.capabilities().date_resume {
            // The source cannot resume; always a full fetch.
            return Ok(None);
        }
        self.store
            .max_field(
                &source.raw_index,
                UPDATED_ON_FIELD,
                &[Filter::term("origin", &source.origin)],
            )
            .await
    }

    /// Run one full sync of `source` into its raw index.
    ///
    /// A fetch error aborts the run; packs already flushed remain committed
    /// and are skipped on the next run via the checkpoint.
    pub async fn sync(&self, source: &SourceConnector, opts: &SyncOptions) -> Result<SyncReport> {
        let checkpoint = self.resolve_checkpoint(source, opts).await?;
        let caps = source.capabilities();

        let args = FetchArgs {
            from_date: checkpoint.filter(|_| caps.date_resume),
            from_offset: opts.from_offset.filter(|_| caps.offset_resume),
            category: opts
                .category
                .clone()
                .or_else(|| source.category.clone())
                .filter(|_| caps.categories),
        };

        info!(
            source = %source.name,
            origin = %source.origin,
            from = ?checkpoint,
            "starting raw sync"
        );

        let mut report = SyncReport {
            resumed_from: checkpoint,
            ..SyncReport::default()
        };
        let mut pack: Vec<Value> = Vec::with_capacity(self.bulk_size);

        let mut stream = source.fetcher.fetch(&args).await?;
        while let Some(fetched) = stream.next().await {
            let mut record = fetched?;
            report.fetched += 1;

            source.fetcher.fix(&mut record);
            if !source.fetcher.keep(&record) {
                report.dropped += 1;
                debug!(unique_id = %record.unique_id, "record dropped by source predicate");
                continue;
            }

            let collected_at = Utc::now();
            let raw = RawRecord {
                backend_name: source.name.clone(),
                origin: source.origin.clone(),
                unique_id: record.unique_id,
                category: record.category,
                updated_on: record.updated_on,
                timestamp: record.timestamp,
                data: record.data,
                metadata_updated_on: from_epoch_secs(record.updated_on),
                metadata_timestamp: collected_at,
                project: opts.project.clone(),
            };

            pack.push(serde_json::to_value(&raw)?);
            if pack.len() >= self.bulk_size {
                report.added += self.flush(&source.raw_index, &mut pack).await? as u64;
            }
        }

        if !pack.is_empty() {
            report.added += self.flush(&source.raw_index, &mut pack).await? as u64;
        }

        info!(
            source = %source.name,
            fetched = report.fetched,
            added = report.added,
            dropped = report.dropped,
            "raw sync finished"
        );
        Ok(report)
    }

    async fn flush(&self, index: &str, pack: &mut Vec<Value>) -> Result<usize> {
        let written = self
            .store
            .bulk_upsert_sync(index, pack, "unique_id", self.sync_wait)
            .await?;
        pack.clear();
        Ok(written)
    }

    /// Read-side cursor over the raw index, ascending by
    /// `metadata__updated_on`, optionally scoped to an origin, an extra
    /// term/prefix filter, and an exclusive lower bound.
    pub fn cursor(
        &self,
        raw_index: &str,
        origin: Option<&str>,
        extra_filter: Option<Filter>,
        from: Option<DateTime<Utc>>,
        page_size: usize,
    ) -> RawCursor<'a, S> {
        let mut filters = Vec::new();
        if let Some(origin) = origin {
            filters.push(Filter::term("origin", origin));
        }
        if let Some(filter) = extra_filter {
            filters.push(filter);
        }
        RawCursor {
            store: self.store,
            index: raw_index.to_string(),
            query: ScanQuery {
                filters,
                from,
                sort_field: UPDATED_ON_FIELD.to_string(),
                page_size,
            },
            cursor: None,
            buffer: std::collections::VecDeque::new(),
            done: false,
        }
    }
}

/// Pull-based iterator over raw records, page by page.
pub struct RawCursor<'a, S: IndexStore + ?Sized> {
    store: &'a S,
    index: String,
    query: ScanQuery,
    cursor: Option<String>,
    buffer: std::collections::VecDeque<Value>,
    done: bool,
}

impl<'a, S: IndexStore + ?Sized> RawCursor<'a, S> {
    /// Next raw record, or `None` when the scan is exhausted. Documents
    /// that fail to deserialize as raw records are skipped with a debug
    /// log — they cannot belong to this pipeline.
    pub async fn next(&mut self) -> Result<Option<RawRecord>> {
        loop {
            if let Some(doc) = self.buffer.pop_front() {
                match serde_json::from_value::<RawRecord>(doc) {
                    Ok(record) => return Ok(Some(record)),
                    Err(err) => {
                        debug!(%err, "skipping non-raw document in raw index");
                        continue;
                    }
                }
            }

            if self.done {
                return Ok(None);
            }

            let page = self
                .store
                .scan_page(&self.index, &self.query, self.cursor.as_deref())
                .await?;
            if page.docs.is_empty() {
                self.done = true;
                return Ok(None);
            }
            self.cursor = page.cursor;
            if self.cursor.is_none() {
                self.done = true;
            }
            self.buffer.extend(page.docs);
        }
    }
}
