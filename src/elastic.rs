//! Elasticsearch-style HTTP implementation of [`IndexStore`].
//!
//! Talks to the index backend over its REST API: `PUT {index}` for
//! creation, `PUT {index}/_bulk` with newline-delimited action/document
//! pairs for upserts, `_search` with a max aggregation for checkpoints, and
//! the scroll API for cursor-based iteration.
//!
//! A bulk pack rejected by the backend is retried once after stripping
//! control characters from the payload; a second rejection escalates to a
//! write error. Packs already sent stay committed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{HarvestError, Result};
use crate::index::{default_mapping, record_id, Filter, IndexStore, ScanPage, ScanQuery};

const SCROLL_TTL: &str = "10m";

pub struct ElasticStore {
    client: reqwest::Client,
    base_url: String,
    bulk_size: usize,
    scroll_size: usize,
}

impl ElasticStore {
    pub fn new(base_url: &str, bulk_size: usize, scroll_size: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            bulk_size,
            scroll_size,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        let resp = self
            .client
            .head(self.url(index))
            .send()
            .await
            .map_err(connect_err)?;
        Ok(resp.status().is_success())
    }

    /// Send one bulk pack. The backend reports item-level failures inside a
    /// 200 response body, so HTTP success alone does not mean the pack
    /// landed; a pack with rejected items or a client-error status is
    /// retried once with a sanitized payload. Returns the number of items
    /// the backend finally refused.
    async fn send_pack(&self, index: &str, body: String) -> Result<usize> {
        let url = self.url(&format!("{}/_bulk", index));

        let resp = self
            .client
            .put(&url)
            .header("Content-Type", "application/x-ndjson")
            .body(body.clone())
            .send()
            .await
            .map_err(connect_err)?;

        let status = resp.status();
        if status.is_success() {
            let parsed: Value = resp.json().await.map_err(connect_err)?;
            let failed = rejected_items(&parsed);
            if failed.is_empty() {
                return Ok(0);
            }
            warn!(
                index,
                rejected = failed.len(),
                "bulk pack had rejected items, retrying with sanitized payload"
            );
        } else if status.is_client_error() {
            warn!(index, %status, "bulk pack rejected, retrying with sanitized payload");
        } else {
            return Err(HarvestError::Write(format!(
                "bulk request to {} failed: {}",
                index, status
            )));
        }

        let retry = self
            .client
            .put(&url)
            .header("Content-Type", "application/x-ndjson")
            .body(sanitize_payload(&body))
            .send()
            .await
            .map_err(connect_err)?;
        if !retry.status().is_success() {
            return Err(HarvestError::Write(format!(
                "bulk request to {} failed after re-encode: {}",
                index,
                retry.status()
            )));
        }

        let parsed: Value = retry.json().await.map_err(connect_err)?;
        let failed = rejected_items(&parsed);
        for (id, item_status) in &failed {
            warn!(index, id = %id, status = item_status, "document refused by the backend, not indexed");
        }
        Ok(failed.len())
    }
}

/// Item-level failures in a bulk response body: `(_id, status)` for every
/// action the backend refused. A bulk request can answer HTTP 200 with
/// `"errors": true` and per-item statuses; those documents were not indexed.
fn rejected_items(body: &Value) -> Vec<(String, u64)> {
    if !body["errors"].as_bool().unwrap_or(false) {
        return Vec::new();
    }
    body["items"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("index"))
                .filter(|action| action["status"].as_u64().unwrap_or(200) >= 300)
                .map(|action| {
                    (
                        action["_id"].as_str().unwrap_or("").to_string(),
                        action["status"].as_u64().unwrap_or(0),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

fn connect_err(err: reqwest::Error) -> HarvestError {
    HarvestError::Connect(err.to_string())
}

/// Build the newline-delimited bulk body for one pack of records.
///
/// Records without a usable id are skipped with a warning rather than
/// aborting the pack. Returns the body and the number of records included.
pub fn bulk_body(records: &[Value], id_field: &str) -> Result<(String, usize)> {
    let mut body = String::new();
    let mut included = 0;
    for record in records {
        let Some(id) = record_id(record, id_field) else {
            warn!(id_field, "record without id field, skipping");
            continue;
        };
        let action = serde_json::to_string(&json!({ "index": { "_id": id } }))?;
        let doc = serde_json::to_string(record)?;
        body.push_str(&action);
        body.push('\n');
        body.push_str(&doc);
        body.push('\n');
        included += 1;
    }
    Ok((body, included))
}

/// Replace control characters (other than the record-separating newlines)
/// that some sources smuggle into text fields and the backend's JSON parser
/// rejects.
pub fn sanitize_payload(body: &str) -> String {
    body.chars()
        .map(|c| {
            if c == '\n' || !c.is_control() {
                c
            } else {
                ' '
            }
        })
        .collect()
}

/// Build the `query` clause for a set of filters plus an optional exclusive
/// lower bound on a timestamp field.
fn build_query(filters: &[Filter], from: Option<(&str, DateTime<Utc>)>) -> Value {
    let mut clauses: Vec<Value> = Vec::new();
    for filter in filters {
        match filter {
            Filter::Term { field, value } => clauses.push(json!({ "term": { field: value } })),
            Filter::Terms { field, values } => {
                clauses.push(json!({ "terms": { field: values } }))
            }
            Filter::Prefix { field, value } => {
                clauses.push(json!({ "prefix": { field: value } }))
            }
        }
    }
    if let Some((field, ts)) = from {
        clauses.push(json!({ "range": { field: { "gt": ts.to_rfc3339() } } }));
    }
    if clauses.is_empty() {
        json!({ "match_all": {} })
    } else {
        json!({ "bool": { "filter": clauses } })
    }
}

#[async_trait]
impl IndexStore for ElasticStore {
    async fn ensure_index(&self, index: &str, mapping: Option<&Value>, clean: bool) -> Result<()> {
        let exists = self.index_exists(index).await?;

        if exists && !clean {
            return Ok(());
        }

        if exists && clean {
            let resp = self
                .client
                .delete(self.url(index))
                .send()
                .await
                .map_err(connect_err)?;
            if !resp.status().is_success() {
                return Err(HarvestError::Write(format!(
                    "failed to delete index {}: {}",
                    index,
                    resp.status()
                )));
            }
            debug!(index, "deleted existing index");
        }

        let mut mappings = default_mapping();
        if let Some(extra) = mapping {
            if let (Some(base), Some(props)) = (
                mappings.get_mut("properties").and_then(Value::as_object_mut),
                extra.get("properties").and_then(Value::as_object),
            ) {
                for (k, v) in props {
                    base.insert(k.clone(), v.clone());
                }
            }
        }

        let resp = self
            .client
            .put(self.url(index))
            .json(&json!({ "mappings": mappings }))
            .send()
            .await
            .map_err(connect_err)?;

        if !resp.status().is_success() {
            return Err(HarvestError::Write(format!(
                "failed to create index {}: {}",
                index,
                resp.status()
            )));
        }

        debug!(index, "index ready");
        Ok(())
    }

    async fn bulk_upsert(&self, index: &str, records: &[Value], id_field: &str) -> Result<usize> {
        let mut written = 0;
        for pack in records.chunks(self.bulk_size) {
            let (body, included) = bulk_body(pack, id_field)?;
            if included == 0 {
                continue;
            }
            let rejected = self.send_pack(index, body).await?;
            written += included.saturating_sub(rejected);
            debug!(index, pack = included, rejected, "bulk pack sent");
        }
        Ok(written)
    }

    async fn count(&self, index: &str, filters: &[Filter]) -> Result<u64> {
        let resp = self
            .client
            .post(self.url(&format!("{}/_count", index)))
            .json(&json!({ "query": build_query(filters, None) }))
            .send()
            .await
            .map_err(connect_err)?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(0);
        }
        if !resp.status().is_success() {
            return Err(HarvestError::Write(format!(
                "count on {} failed: {}",
                index,
                resp.status()
            )));
        }

        let body: Value = resp.json().await.map_err(connect_err)?;
        Ok(body["count"].as_u64().unwrap_or(0))
    }

    async fn max_field(
        &self,
        index: &str,
        field: &str,
        filters: &[Filter],
    ) -> Result<Option<DateTime<Utc>>> {
        let body = json!({
            "size": 0,
            "query": build_query(filters, None),
            "aggs": { "1": { "max": { "field": field } } }
        });

        let resp = self
            .client
            .post(self.url(&format!("{}/_search", index)))
            .json(&body)
            .send()
            .await
            .map_err(connect_err)?;

        // A missing index means no checkpoint, not an error.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(HarvestError::Write(format!(
                "max aggregation on {} failed: {}",
                index,
                resp.status()
            )));
        }

        let parsed: Value = resp.json().await.map_err(connect_err)?;
        let agg = &parsed["aggregations"]["1"];

        // Date aggs report epoch millis in `value`; prefer the string form
        // when present.
        if let Some(s) = agg["value_as_string"].as_str() {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(Some(dt.with_timezone(&Utc)));
            }
        }
        if let Some(millis) = agg["value"].as_f64() {
            return Ok(DateTime::<Utc>::from_timestamp_millis(millis as i64));
        }
        Ok(None)
    }

    async fn scan_page(
        &self,
        index: &str,
        query: &ScanQuery,
        cursor: Option<&str>,
    ) -> Result<ScanPage> {
        let page_size = if query.page_size > 0 {
            query.page_size
        } else {
            self.scroll_size
        };

        let resp = match cursor {
            None => {
                let body = json!({
                    "size": page_size,
                    "query": build_query(
                        &query.filters,
                        query.from.map(|ts| (query.sort_field.as_str(), ts)),
                    ),
                    "sort": [{ &query.sort_field: { "order": "asc" } }]
                });
                self.client
                    .post(self.url(&format!("{}/_search?scroll={}", index, SCROLL_TTL)))
                    .json(&body)
                    .send()
                    .await
                    .map_err(connect_err)?
            }
            Some(token) => self
                .client
                .post(self.url("_search/scroll"))
                .json(&json!({ "scroll": SCROLL_TTL, "scroll_id": token }))
                .send()
                .await
                .map_err(connect_err)?,
        };

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(ScanPage {
                docs: Vec::new(),
                cursor: None,
            });
        }
        if !resp.status().is_success() {
            return Err(HarvestError::Write(format!(
                "scan on {} failed: {}",
                index,
                resp.status()
            )));
        }

        let parsed: Value = resp.json().await.map_err(connect_err)?;
        let docs: Vec<Value> = parsed["hits"]["hits"]
            .as_array()
            .map(|hits| {
                hits.iter()
                    .filter_map(|h| h.get("_source").cloned())
                    .collect()
            })
            .unwrap_or_default();

        // An empty page ends the scan; the server-side cursor is left to
        // expire with its TTL.
        let cursor = if docs.is_empty() {
            None
        } else {
            parsed["_scroll_id"].as_str().map(str::to_string)
        };

        Ok(ScanPage { docs, cursor })
    }
}
