//! Storage abstraction over the search index.
//!
//! The [`IndexStore`] trait defines every index operation the sync and
//! enrichment engines need, enabling pluggable backends (Elasticsearch-style
//! HTTP in production, in-memory for tests and offline development).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;

/// A filter over documents in an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Exact match on a keyword field.
    Term { field: String, value: String },
    /// Match any of a set of values on a keyword field.
    Terms { field: String, values: Vec<String> },
    /// Prefix match on a keyword field.
    Prefix { field: String, value: String },
}

impl Filter {
    pub fn term(field: &str, value: &str) -> Self {
        Filter::Term {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    pub fn terms(field: &str, values: Vec<String>) -> Self {
        Filter::Terms {
            field: field.to_string(),
            values,
        }
    }

    pub fn prefix(field: &str, value: &str) -> Self {
        Filter::Prefix {
            field: field.to_string(),
            value: value.to_string(),
        }
    }
}

/// Parameters for a paged scan over an index.
#[derive(Debug, Clone)]
pub struct ScanQuery {
    pub filters: Vec<Filter>,
    /// Exclusive lower bound on `sort_field`.
    pub from: Option<DateTime<Utc>>,
    /// Field to sort ascending by; also the field `from` bounds.
    pub sort_field: String,
    pub page_size: usize,
}

/// One page of scan results plus the cursor for the next page.
///
/// A `None` cursor means the scan is exhausted; callers must stop issuing
/// follow-up requests at that point.
#[derive(Debug, Clone)]
pub struct ScanPage {
    pub docs: Vec<Value>,
    pub cursor: Option<String>,
}

/// Abstract search-index backend.
///
/// All write paths are upserts keyed by a caller-chosen id field, which is
/// what makes re-running a sync idempotent: the same logical record maps to
/// the same document id and overwrites in place.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`ensure_index`](IndexStore::ensure_index) | Create (or clean-recreate) an index with its mapping |
/// | [`bulk_upsert`](IndexStore::bulk_upsert) | Size-bounded bulk upsert, one request per pack |
/// | [`count`](IndexStore::count) | Document count matching filters |
/// | [`max_field`](IndexStore::max_field) | Max aggregation over a timestamp field |
/// | [`scan_page`](IndexStore::scan_page) | Cursor-based iteration in ascending sort order |
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Create `index` if absent. With `clean`, an existing index is deleted
    /// and recreated. Installs the backend's default dynamic mapping plus
    /// `mapping` when given.
    async fn ensure_index(&self, index: &str, mapping: Option<&Value>, clean: bool) -> Result<()>;

    /// Upsert `records` into `index`, keyed by `records[i][id_field]`.
    ///
    /// The input is split into packs of the backend's configured bulk size;
    /// each pack is one bulk request. A failed pack aborts the remaining
    /// packs, but packs already sent stay committed — at-least-once, not
    /// atomic. Returns the number of records written.
    async fn bulk_upsert(&self, index: &str, records: &[Value], id_field: &str) -> Result<usize>;

    /// Count documents in `index` matching all `filters`.
    async fn count(&self, index: &str, filters: &[Filter]) -> Result<u64>;

    /// Maximum value of a timestamp field across documents matching all
    /// `filters`, or `None` when the index is empty, missing, or the field
    /// is unmapped. Never an error for an empty result.
    async fn max_field(
        &self,
        index: &str,
        field: &str,
        filters: &[Filter],
    ) -> Result<Option<DateTime<Utc>>>;

    /// Fetch one page of a scan. Pass `None` as `cursor` for the first
    /// page and the returned cursor for follow-ups. Yields every matching
    /// document exactly once, ascending by `query.sort_field`.
    async fn scan_page(
        &self,
        index: &str,
        query: &ScanQuery,
        cursor: Option<&str>,
    ) -> Result<ScanPage>;

    /// [`bulk_upsert`](IndexStore::bulk_upsert), then poll the count of
    /// this batch's ids until the upload is visible to reads or `wait`
    /// elapses. A timeout logs and returns normally, an accepted staleness
    /// window, not a failure.
    async fn bulk_upsert_sync(
        &self,
        index: &str,
        records: &[Value],
        id_field: &str,
        wait: Duration,
    ) -> Result<usize> {
        let written = self.bulk_upsert(index, records, id_field).await?;

        // Counting the batch's own ids sidesteps overwrites and documents
        // from earlier runs: the upload is visible exactly when every id in
        // this batch matches a document.
        let mut ids: Vec<String> = records
            .iter()
            .filter_map(|r| r.get(id_field).and_then(|v| v.as_str()))
            .map(str::to_string)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        // The backend may refuse individual items; never wait for more
        // documents than were actually written.
        let expected = (ids.len() as u64).min(written as u64);
        if expected == 0 {
            return Ok(written);
        }
        let batch = [Filter::terms(id_field, ids)];

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let visible = self.count(index, &batch).await.unwrap_or(0);
            if visible >= expected {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(index, "bulk upload not yet visible after sync wait");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Ok(written)
    }
}

/// Dynamic template installed on every raw and enriched index: unknown
/// string fields are stored as keywords rather than analyzed text, so term
/// filters on origins, ids, and usernames behave exactly.
pub fn default_mapping() -> Value {
    serde_json::json!({
        "dynamic_templates": [
            {
                "notanalyzed": {
                    "match": "*",
                    "match_mapping_type": "string",
                    "mapping": { "type": "keyword" }
                }
            }
        ],
        "properties": {
            "metadata__updated_on": { "type": "date" },
            "metadata__timestamp": { "type": "date" },
            "metadata__enriched_on": { "type": "date" }
        }
    })
}

/// Extract the document id for `id_field` from a record, tolerating both
/// string and numeric ids.
pub fn record_id(record: &Value, id_field: &str) -> Option<String> {
    match record.get(id_field) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryIndexStore;
    use async_trait::async_trait;
    use serde_json::json;

    /// Store with refresh lag: writes land in `pending` while every read
    /// answers from `visible`, so uploads never become readable.
    struct LaggingStore {
        visible: MemoryIndexStore,
        pending: MemoryIndexStore,
    }

    impl LaggingStore {
        fn new() -> Self {
            Self {
                visible: MemoryIndexStore::new(100),
                pending: MemoryIndexStore::new(100),
            }
        }
    }

    #[async_trait]
    impl IndexStore for LaggingStore {
        async fn ensure_index(
            &self,
            index: &str,
            mapping: Option<&Value>,
            clean: bool,
        ) -> Result<()> {
            self.visible.ensure_index(index, mapping, clean).await?;
            self.pending.ensure_index(index, mapping, clean).await
        }

        async fn bulk_upsert(
            &self,
            index: &str,
            records: &[Value],
            id_field: &str,
        ) -> Result<usize> {
            self.pending.bulk_upsert(index, records, id_field).await
        }

        async fn count(&self, index: &str, filters: &[Filter]) -> Result<u64> {
            self.visible.count(index, filters).await
        }

        async fn max_field(
            &self,
            index: &str,
            field: &str,
            filters: &[Filter],
        ) -> Result<Option<DateTime<Utc>>> {
            self.visible.max_field(index, field, filters).await
        }

        async fn scan_page(
            &self,
            index: &str,
            query: &ScanQuery,
            cursor: Option<&str>,
        ) -> Result<ScanPage> {
            self.visible.scan_page(index, query, cursor).await
        }
    }

    fn docs(ids: &[&str]) -> Vec<Value> {
        ids.iter().map(|id| json!({"unique_id": id})).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_upsert_sync_waits_for_batch_visibility() {
        let store = LaggingStore::new();
        // Documents from earlier runs are already visible; the index total
        // exceeds the batch size, which must not satisfy the wait.
        store
            .visible
            .bulk_upsert("raw", &docs(&["e1", "e2", "e3", "e4", "e5"]), "unique_id")
            .await
            .unwrap();

        let wait = Duration::from_secs(5);
        let start = tokio::time::Instant::now();
        let written = store
            .bulk_upsert_sync("raw", &docs(&["n1", "n2", "n3"]), "unique_id", wait)
            .await
            .unwrap();

        assert_eq!(written, 3);
        // The new ids never become readable: the poll holds until the
        // deadline, then logs and returns.
        assert!(start.elapsed() >= wait);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_upsert_sync_returns_once_batch_visible() {
        let store = MemoryIndexStore::new(100);
        store
            .bulk_upsert("raw", &docs(&["e1", "e2", "e3", "e4", "e5"]), "unique_id")
            .await
            .unwrap();

        let wait = Duration::from_secs(5);
        let start = tokio::time::Instant::now();
        store
            .bulk_upsert_sync("raw", &docs(&["n1", "n2"]), "unique_id", wait)
            .await
            .unwrap();
        assert!(start.elapsed() < wait);
    }

    #[test]
    fn test_record_id_string() {
        let rec = serde_json::json!({"unique_id": "abc"});
        assert_eq!(record_id(&rec, "unique_id"), Some("abc".to_string()));
    }

    #[test]
    fn test_record_id_numeric() {
        let rec = serde_json::json!({"unique_id": 42});
        assert_eq!(record_id(&rec, "unique_id"), Some("42".to_string()));
    }

    #[test]
    fn test_record_id_missing_or_empty() {
        assert_eq!(record_id(&serde_json::json!({}), "unique_id"), None);
        assert_eq!(
            record_id(&serde_json::json!({"unique_id": ""}), "unique_id"),
            None
        );
    }

    #[test]
    fn test_default_mapping_keeps_strings_unanalyzed() {
        let m = default_mapping();
        let tpl = &m["dynamic_templates"][0]["notanalyzed"];
        assert_eq!(tpl["mapping"]["type"], "keyword");
    }
}
