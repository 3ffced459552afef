//! Core data models for the sync and enrichment pipeline.
//!
//! These types represent the records that flow from a source fetcher through
//! the raw index and into the enriched index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One record as delivered by a source fetcher, before collection metadata
/// is attached. `updated_on` and `timestamp` are epoch seconds in the
/// source's own clock; unit fixes happen in the fetcher's `fix` hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    pub unique_id: String,
    pub category: String,
    pub updated_on: f64,
    pub timestamp: f64,
    pub data: Value,
}

/// A record as stored in the raw index, one document per logical entity.
///
/// The document id in the raw index is `unique_id`, so re-indexing the same
/// record overwrites rather than duplicates. `metadata__updated_on` mirrors
/// the source's `updated_on` and drives incremental checkpoints;
/// `metadata__timestamp` is the collection time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub backend_name: String,
    pub origin: String,
    pub unique_id: String,
    pub category: String,
    pub updated_on: f64,
    pub timestamp: f64,
    pub data: Value,
    #[serde(rename = "metadata__updated_on")]
    pub metadata_updated_on: DateTime<Utc>,
    #[serde(rename = "metadata__timestamp")]
    pub metadata_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

/// Outcome of one raw sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Records produced by the fetcher, including dropped ones.
    pub fetched: u64,
    /// Records written to the raw index.
    pub added: u64,
    /// Records excluded by the fetcher's `keep` predicate.
    pub dropped: u64,
    /// The checkpoint the run resumed from, if any.
    pub resumed_from: Option<DateTime<Utc>>,
}

/// Outcome of one enrichment run.
#[derive(Debug, Clone, Default)]
pub struct EnrichReport {
    /// Enriched documents written, counting fan-out records individually.
    pub enriched: u64,
    /// Raw records the mapping intentionally excluded.
    pub skipped: u64,
    /// Raw records whose mapping failed and was skipped with a warning.
    pub failed: u64,
    /// The checkpoint the run resumed from, if any.
    pub resumed_from: Option<DateTime<Utc>>,
}

/// Convert epoch seconds (possibly fractional) to a UTC timestamp.
///
/// Out-of-range values clamp to the epoch rather than panicking; sources
/// occasionally deliver garbage timestamps and a bad date must not abort
/// a run.
pub fn from_epoch_secs(secs: f64) -> DateTime<Utc> {
    if !secs.is_finite() {
        return DateTime::<Utc>::default();
    }
    let whole = secs.trunc() as i64;
    let nanos = (secs.fract().abs() * 1e9) as u32;
    DateTime::<Utc>::from_timestamp(whole, nanos).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_epoch_secs_whole() {
        let dt = from_epoch_secs(1_700_000_000.0);
        assert_eq!(dt.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_from_epoch_secs_fractional() {
        let dt = from_epoch_secs(100.5);
        assert_eq!(dt.timestamp(), 100);
        assert_eq!(dt.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_from_epoch_secs_garbage_clamps() {
        assert_eq!(from_epoch_secs(f64::NAN).timestamp(), 0);
        assert_eq!(from_epoch_secs(f64::MAX).timestamp(), 0);
    }

    #[test]
    fn test_raw_record_serializes_metadata_field_names() {
        let rec = RawRecord {
            backend_name: "jsonl".into(),
            origin: "file:///tmp/a.jsonl".into(),
            unique_id: "abc".into(),
            category: "commit".into(),
            updated_on: 100.0,
            timestamp: 100.0,
            data: serde_json::json!({"message": "hi"}),
            metadata_updated_on: from_epoch_secs(100.0),
            metadata_timestamp: from_epoch_secs(200.0),
            project: None,
        };
        let v = serde_json::to_value(&rec).unwrap();
        assert!(v.get("metadata__updated_on").is_some());
        assert!(v.get("metadata__timestamp").is_some());
        assert!(v.get("project").is_none());
    }
}
