//! The mapping seam between a raw record and its enriched projection.
//!
//! Each data source provides one [`Enricher`]: a pure projection from a
//! [`RawRecord`] to zero or more enriched documents, whose only permitted
//! side effects are identity resolution and project-map lookups through the
//! [`EnrichContext`]. The enrichment engine is generic over this trait and
//! never over concrete source types.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::identity::{IdentityKey, IdentityResolver};
use crate::models::RawRecord;
use crate::projects::ProjectMap;

/// Result of mapping one raw record.
#[derive(Debug)]
pub enum Mapped {
    /// One enriched document; its id is the raw record's `unique_id`.
    One(Value),
    /// Event fan-out: each document gets the id `"<unique_id>_<seq>"`,
    /// sequence starting at 0. No document keeps the plain `unique_id`.
    Many(Vec<Value>),
    /// Intentional exclusion (malformed or irrelevant upstream data).
    /// Counted, never an error.
    Skip,
}

/// Collaborators a mapping may call during [`Enricher::map`].
pub struct EnrichContext<'a> {
    /// Present when identity resolution is enabled for the run.
    pub resolver: Option<&'a mut IdentityResolver>,
    pub projects: &'a ProjectMap,
}

/// Per-source mapping from raw to enriched records.
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Map one raw record. Errors are handled per record by the engine
    /// (logged and skipped), so a malformed record cannot abort a run;
    /// use [`Mapped::Skip`] for expected exclusions.
    async fn map(&self, raw: &RawRecord, ctx: &mut EnrichContext<'_>) -> Result<Mapped>;

    /// Identity keys appearing in a raw record, used by the engine's
    /// one-time bulk priming pass before enrichment begins. Default: none.
    fn identities(&self, _raw: &RawRecord) -> Vec<IdentityKey> {
        Vec::new()
    }
}
