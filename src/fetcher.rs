//! The fetch-producer seam between a data source and the raw sync engine.
//!
//! A [`Fetcher`] wraps a source's client and yields a lazy, finite stream
//! of [`SourceRecord`]s. What resumption arguments a source understands is
//! declared up front in [`SourceCapabilities`] — decided at registration
//! time, never discovered by runtime introspection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::error::Result;
use crate::models::SourceRecord;

/// What resumption and scoping arguments a source's fetch accepts.
///
/// The sync engine only passes an argument the source declares; a source
/// with neither resume capability is always fetched in full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceCapabilities {
    pub date_resume: bool,
    pub offset_resume: bool,
    pub categories: bool,
}

/// Arguments for one fetch invocation. Only fields matching the source's
/// declared capabilities are populated by the engine.
#[derive(Debug, Clone, Default)]
pub struct FetchArgs {
    pub from_date: Option<DateTime<Utc>>,
    pub from_offset: Option<u64>,
    pub category: Option<String>,
}

/// A lazy sequence of source records. Yielding an `Err` aborts the run;
/// records already flushed stay in the raw index and are skipped on the
/// next run via the checkpoint.
pub type RecordStream<'a> = BoxStream<'a, Result<SourceRecord>>;

/// Producer of raw records for one data source.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Resumption arguments this source understands.
    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::default()
    }

    /// Start a fetch with the given (capability-filtered) arguments.
    async fn fetch(&self, args: &FetchArgs) -> Result<RecordStream<'_>>;

    /// Per-source fixups applied to each record before metadata tagging,
    /// typically timestamp unit conversion.
    fn fix(&self, _record: &mut SourceRecord) {}

    /// Per-source drop predicate. Records returning `false` are excluded
    /// from the batch and counted separately. Default: keep everything.
    fn keep(&self, _record: &SourceRecord) -> bool {
        true
    }
}
