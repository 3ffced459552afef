//! Built-in source over a newline-delimited JSON record file.
//!
//! Each line is one record exposing at minimum an `id` and an `updated_on`
//! (epoch seconds); `timestamp` and `category` are optional. This is the
//! reference [`Fetcher`]/[`Enricher`] pair: it exercises the whole pipeline
//! without a live upstream service, and doubles as an import path for
//! records exported from one.
//!
//! ```json
//! {"id": "c3f1...", "category": "commit", "updated_on": 1700000000,
//!  "summary": "Fix login redirect",
//!  "author": {"name": "Ada L", "email": "ada@example.com"}}
//! ```
//!
//! Resume semantics: `from_date` is an inclusive lower bound, so the record
//! exactly at the checkpoint is re-delivered and overwritten in place.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::enricher::{EnrichContext, Enricher, Mapped};
use crate::error::{HarvestError, Result};
use crate::fetcher::{FetchArgs, Fetcher, RecordStream, SourceCapabilities};
use crate::identity::{email_domain, IdentityKey};
use crate::models::{from_epoch_secs, RawRecord, SourceRecord};

pub struct JsonlFetcher {
    path: PathBuf,
}

impl JsonlFetcher {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

fn parse_line(line: &str, lineno: usize) -> Result<SourceRecord> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| HarvestError::Fetch(format!("line {}: invalid JSON: {}", lineno, e)))?;

    let unique_id = value
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HarvestError::Fetch(format!("line {}: missing id", lineno)))?
        .to_string();
    let updated_on = value
        .get("updated_on")
        .and_then(Value::as_f64)
        .ok_or_else(|| HarvestError::Fetch(format!("line {}: missing updated_on", lineno)))?;
    let timestamp = value
        .get("timestamp")
        .and_then(Value::as_f64)
        .unwrap_or(updated_on);
    let category = value
        .get("category")
        .and_then(Value::as_str)
        .unwrap_or("item")
        .to_string();

    Ok(SourceRecord {
        unique_id,
        category,
        updated_on,
        timestamp,
        data: value,
    })
}

#[async_trait]
impl Fetcher for JsonlFetcher {
    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            date_resume: true,
            offset_resume: false,
            categories: true,
        }
    }

    async fn fetch(&self, args: &FetchArgs) -> Result<RecordStream<'_>> {
        let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
            HarvestError::Fetch(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let lines = BufReader::new(file).lines();

        let path = self.path.display().to_string();
        let from = args.from_date;
        let category = args.category.clone();

        // Lazy line-by-line delivery; the file is never held in memory.
        // A malformed line poisons the file: surface it and end the stream
        // rather than silently losing records.
        let stream = futures::stream::unfold(
            (lines, 0usize, false),
            move |(mut lines, mut lineno, done)| {
                let path = path.clone();
                let category = category.clone();
                async move {
                    if done {
                        return None;
                    }
                    loop {
                        lineno += 1;
                        let line = match lines.next_line().await {
                            Ok(Some(line)) => line,
                            Ok(None) => return None,
                            Err(e) => {
                                let err =
                                    HarvestError::Fetch(format!("cannot read {}: {}", path, e));
                                return Some((Err(err), (lines, lineno, true)));
                            }
                        };
                        if line.trim().is_empty() {
                            continue;
                        }
                        match parse_line(&line, lineno) {
                            Ok(record) => {
                                if let Some(from) = from {
                                    if from_epoch_secs(record.updated_on) < from {
                                        continue;
                                    }
                                }
                                if let Some(cat) = &category {
                                    if &record.category != cat {
                                        continue;
                                    }
                                }
                                return Some((Ok(record), (lines, lineno, false)));
                            }
                            Err(err) => return Some((Err(err), (lines, lineno, true))),
                        }
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

/// Generic enricher for jsonl records: copies the common fields and
/// resolves the `author` object to identity fields when a resolver is
/// available.
pub struct JsonlEnricher {
    connector: String,
}

impl JsonlEnricher {
    pub fn new(connector: &str) -> Self {
        Self {
            connector: connector.to_string(),
        }
    }

    fn author_key(raw: &RawRecord) -> Option<IdentityKey> {
        let author = raw.data.get("author")?;
        let key = IdentityKey::new(
            author.get("name").and_then(Value::as_str),
            author.get("email").and_then(Value::as_str),
            author.get("username").and_then(Value::as_str),
        );
        (!key.is_empty()).then_some(key)
    }
}

#[async_trait]
impl Enricher for JsonlEnricher {
    async fn map(&self, raw: &RawRecord, ctx: &mut EnrichContext<'_>) -> Result<Mapped> {
        if !raw.data.is_object() {
            return Ok(Mapped::Skip);
        }

        let mut obj = serde_json::Map::new();
        obj.insert("uuid".to_string(), json!(raw.unique_id));
        obj.insert("category".to_string(), json!(raw.category));

        for field in ["summary", "url", "state"] {
            if let Some(v) = raw.data.get(field) {
                obj.insert(field.to_string(), v.clone());
            }
        }

        if let Some(key) = Self::author_key(raw) {
            if let Some(email) = &key.email {
                if let Some(domain) = email_domain(email) {
                    obj.insert("author_domain".to_string(), json!(domain));
                }
            }
            obj.insert("author_name".to_string(), json!(key.name));
            obj.insert("author_user_name".to_string(), json!(key.username));

            if let Some(resolver) = ctx.resolver.as_deref_mut() {
                if let Some(identity) = resolver.resolve(&key, &self.connector).await {
                    let org = resolver
                        .enrollment_at(&identity.uuid, raw.metadata_updated_on)
                        .await;
                    obj.insert("author_id".to_string(), json!(identity.id));
                    obj.insert("author_uuid".to_string(), json!(identity.uuid));
                    obj.insert("author_org_name".to_string(), json!(org));
                    obj.insert(
                        "author_bot".to_string(),
                        json!(resolver.is_bot(&identity.uuid)),
                    );
                }
            }
        }

        Ok(Mapped::One(Value::Object(obj)))
    }

    fn identities(&self, raw: &RawRecord) -> Vec<IdentityKey> {
        Self::author_key(raw).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;

    fn fixture(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
        f
    }

    async fn collect(fetcher: &JsonlFetcher, args: &FetchArgs) -> Vec<Result<SourceRecord>> {
        fetcher.fetch(args).await.unwrap().collect().await
    }

    #[tokio::test]
    async fn test_fetch_parses_lines_in_file_order() {
        let f = fixture(&[
            r#"{"id": "b", "updated_on": 200, "category": "commit"}"#,
            r#"{"id": "a", "updated_on": 100, "category": "commit"}"#,
        ]);
        let fetcher = JsonlFetcher::new(f.path().to_path_buf());
        let records = collect(&fetcher, &FetchArgs::default()).await;
        let ids: Vec<String> = records
            .into_iter()
            .map(|r| r.unwrap().unique_id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_fetch_ends_stream_after_malformed_line() {
        let f = fixture(&[
            r#"{"id": "a", "updated_on": 100}"#,
            "not json at all",
            r#"{"id": "b", "updated_on": 200}"#,
        ]);
        let fetcher = JsonlFetcher::new(f.path().to_path_buf());
        let records = collect(&fetcher, &FetchArgs::default()).await;
        assert_eq!(records.len(), 2);
        assert!(records[0].is_ok());
        assert!(records[1].is_err());
    }

    #[tokio::test]
    async fn test_fetch_from_date_is_inclusive() {
        let f = fixture(&[
            r#"{"id": "a", "updated_on": 100}"#,
            r#"{"id": "b", "updated_on": 200}"#,
        ]);
        let fetcher = JsonlFetcher::new(f.path().to_path_buf());
        let args = FetchArgs {
            from_date: Some(from_epoch_secs(200.0)),
            ..FetchArgs::default()
        };
        let records = collect(&fetcher, &args).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].as_ref().unwrap().unique_id, "b");
    }

    #[tokio::test]
    async fn test_fetch_filters_by_category() {
        let f = fixture(&[
            r#"{"id": "a", "updated_on": 100, "category": "commit"}"#,
            r#"{"id": "b", "updated_on": 200, "category": "issue"}"#,
        ]);
        let fetcher = JsonlFetcher::new(f.path().to_path_buf());
        let args = FetchArgs {
            category: Some("issue".to_string()),
            ..FetchArgs::default()
        };
        let records = collect(&fetcher, &args).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].as_ref().unwrap().unique_id, "b");
    }

    #[tokio::test]
    async fn test_fetch_malformed_line_yields_error() {
        let f = fixture(&[r#"{"id": "a", "updated_on": 100}"#, "not json at all"]);
        let fetcher = JsonlFetcher::new(f.path().to_path_buf());
        let records = collect(&fetcher, &FetchArgs::default()).await;
        assert!(records.iter().any(|r| r.is_err()));
    }

    #[tokio::test]
    async fn test_fetch_missing_required_field_is_error() {
        let f = fixture(&[r#"{"updated_on": 100}"#]);
        let fetcher = JsonlFetcher::new(f.path().to_path_buf());
        let records = collect(&fetcher, &FetchArgs::default()).await;
        assert!(matches!(records[0], Err(HarvestError::Fetch(_))));
    }

    #[tokio::test]
    async fn test_enricher_maps_author_without_resolver() {
        use crate::projects::ProjectMap;

        let raw = RawRecord {
            backend_name: "git".into(),
            origin: "o".into(),
            unique_id: "a".into(),
            category: "commit".into(),
            updated_on: 100.0,
            timestamp: 100.0,
            data: json!({
                "summary": "Fix bug",
                "author": {"name": "Ada", "email": "ada@example.com"}
            }),
            metadata_updated_on: from_epoch_secs(100.0),
            metadata_timestamp: from_epoch_secs(100.0),
            project: None,
        };
        let projects = ProjectMap::empty();
        let mut ctx = EnrichContext {
            resolver: None,
            projects: &projects,
        };
        let mapped = JsonlEnricher::new("git").map(&raw, &mut ctx).await.unwrap();
        let Mapped::One(doc) = mapped else {
            panic!("expected single document");
        };
        assert_eq!(doc["summary"], "Fix bug");
        assert_eq!(doc["author_name"], "Ada");
        assert_eq!(doc["author_domain"], "example.com");
        assert!(doc.get("author_uuid").is_none());
    }

    #[test]
    fn test_identities_extracts_author() {
        let raw = RawRecord {
            backend_name: "git".into(),
            origin: "o".into(),
            unique_id: "a".into(),
            category: "commit".into(),
            updated_on: 100.0,
            timestamp: 100.0,
            data: json!({"author": {"email": "ada@example.com"}}),
            metadata_updated_on: from_epoch_secs(100.0),
            metadata_timestamp: from_epoch_secs(100.0),
            project: None,
        };
        let keys = JsonlEnricher::new("git").identities(&raw);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].email.as_deref(), Some("ada@example.com"));
    }
}
