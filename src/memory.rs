//! In-memory backends for tests and offline development.
//!
//! [`MemoryIndexStore`] implements [`IndexStore`] over `HashMap`s behind
//! `std::sync::RwLock`; [`MemoryIdentityStore`] implements
//! [`IdentityStore`](crate::identity::IdentityStore) with deterministic
//! uuids derived from the identity key. Both count backend calls so tests
//! can assert packing and memoization behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{HarvestError, Result};
use crate::identity::{Enrollment, Identity, IdentityKey, IdentityStore};
use crate::index::{record_id, Filter, IndexStore, ScanPage, ScanQuery};

fn matches(doc: &Value, filter: &Filter) -> bool {
    match filter {
        Filter::Term { field, value } => doc
            .get(field)
            .and_then(Value::as_str)
            .map(|s| s == value)
            .unwrap_or(false),
        Filter::Terms { field, values } => doc
            .get(field)
            .and_then(Value::as_str)
            .map(|s| values.iter().any(|v| v == s))
            .unwrap_or(false),
        Filter::Prefix { field, value } => doc
            .get(field)
            .and_then(Value::as_str)
            .map(|s| s.starts_with(value.as_str()))
            .unwrap_or(false),
    }
}

fn field_ts(doc: &Value, field: &str) -> Option<DateTime<Utc>> {
    doc.get(field)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// In-memory search index.
pub struct MemoryIndexStore {
    bulk_size: usize,
    indices: RwLock<HashMap<String, HashMap<String, Value>>>,
    bulk_calls: Arc<AtomicUsize>,
}

impl MemoryIndexStore {
    pub fn new(bulk_size: usize) -> Self {
        Self {
            bulk_size,
            indices: RwLock::new(HashMap::new()),
            bulk_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of bulk requests issued, shared so callers can keep it after
    /// handing the store to an engine.
    pub fn bulk_calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.bulk_calls)
    }

    /// Number of documents currently held by `index`.
    pub fn len(&self, index: &str) -> usize {
        self.indices
            .read()
            .unwrap()
            .get(index)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, index: &str) -> bool {
        self.len(index) == 0
    }

    /// Fetch one document by id, for assertions.
    pub fn get(&self, index: &str, id: &str) -> Option<Value> {
        self.indices
            .read()
            .unwrap()
            .get(index)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// All document ids in `index`, sorted.
    pub fn ids(&self, index: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .indices
            .read()
            .unwrap()
            .get(index)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn ensure_index(&self, index: &str, _mapping: Option<&Value>, clean: bool) -> Result<()> {
        let mut indices = self.indices.write().unwrap();
        if clean {
            indices.insert(index.to_string(), HashMap::new());
        } else {
            indices.entry(index.to_string()).or_default();
        }
        Ok(())
    }

    async fn bulk_upsert(&self, index: &str, records: &[Value], id_field: &str) -> Result<usize> {
        let mut written = 0;
        for pack in records.chunks(self.bulk_size.max(1)) {
            self.bulk_calls.fetch_add(1, Ordering::SeqCst);
            let mut indices = self.indices.write().unwrap();
            let docs = indices.entry(index.to_string()).or_default();
            for record in pack {
                let id = record_id(record, id_field).ok_or_else(|| {
                    HarvestError::Write(format!("record without id field '{}'", id_field))
                })?;
                docs.insert(id, record.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn count(&self, index: &str, filters: &[Filter]) -> Result<u64> {
        let indices = self.indices.read().unwrap();
        let Some(docs) = indices.get(index) else {
            return Ok(0);
        };
        Ok(docs
            .values()
            .filter(|doc| filters.iter().all(|f| matches(doc, f)))
            .count() as u64)
    }

    async fn max_field(
        &self,
        index: &str,
        field: &str,
        filters: &[Filter],
    ) -> Result<Option<DateTime<Utc>>> {
        let indices = self.indices.read().unwrap();
        let Some(docs) = indices.get(index) else {
            return Ok(None);
        };
        Ok(docs
            .values()
            .filter(|doc| filters.iter().all(|f| matches(doc, f)))
            .filter_map(|doc| field_ts(doc, field))
            .max())
    }

    async fn scan_page(
        &self,
        index: &str,
        query: &ScanQuery,
        cursor: Option<&str>,
    ) -> Result<ScanPage> {
        let indices = self.indices.read().unwrap();
        let Some(docs) = indices.get(index) else {
            return Ok(ScanPage {
                docs: Vec::new(),
                cursor: None,
            });
        };

        let mut selected: Vec<&Value> = docs
            .values()
            .filter(|doc| query.filters.iter().all(|f| matches(doc, f)))
            .filter(|doc| match query.from {
                Some(from) => field_ts(doc, &query.sort_field)
                    .map(|ts| ts > from)
                    .unwrap_or(false),
                None => true,
            })
            .collect();
        selected.sort_by_key(|doc| field_ts(doc, &query.sort_field));

        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let page: Vec<Value> = selected
            .iter()
            .skip(offset)
            .take(query.page_size.max(1))
            .map(|doc| (*doc).clone())
            .collect();

        let cursor = if page.is_empty() {
            None
        } else {
            Some((offset + page.len()).to_string())
        };

        Ok(ScanPage { docs: page, cursor })
    }
}

/// In-memory identity backend with deterministic uuids.
pub struct MemoryIdentityStore {
    identities: Arc<RwLock<HashMap<IdentityKey, Identity>>>,
    by_uuid: Arc<RwLock<HashMap<String, Identity>>>,
    hits: Arc<AtomicUsize>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self {
            identities: Arc::new(RwLock::new(HashMap::new())),
            by_uuid: Arc::new(RwLock::new(HashMap::new())),
            hits: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of backend lookups, shared so tests can keep it after the
    /// store moves into a resolver.
    pub fn hits(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.hits)
    }

    fn identity_for(key: &IdentityKey) -> Identity {
        let seed = format!(
            "{}|{}|{}",
            key.name.as_deref().unwrap_or(""),
            key.email.as_deref().unwrap_or(""),
            key.username.as_deref().unwrap_or("")
        );
        let uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string();
        Identity {
            id: uuid.clone(),
            uuid,
            name: key.name.clone(),
            is_bot: false,
            enrollments: Vec::new(),
        }
    }

    /// Pre-create an identity with one enrollment window; returns its uuid.
    pub fn seed_with_enrollment(
        &self,
        key: &IdentityKey,
        organization: &str,
        start: &str,
        end: &str,
    ) -> String {
        let mut identity = Self::identity_for(key);
        identity.enrollments.push(Enrollment {
            organization: organization.to_string(),
            start: start.parse().unwrap(),
            end: end.parse().unwrap(),
        });
        let uuid = identity.uuid.clone();
        self.by_uuid
            .write()
            .unwrap()
            .insert(uuid.clone(), identity.clone());
        self.identities.write().unwrap().insert(key.clone(), identity);
        uuid
    }

    /// Pre-create an identity flagged as a bot; returns its uuid.
    pub fn seed_bot(&self, key: &IdentityKey) -> String {
        let mut identity = Self::identity_for(key);
        identity.is_bot = true;
        let uuid = identity.uuid.clone();
        self.by_uuid
            .write()
            .unwrap()
            .insert(uuid.clone(), identity.clone());
        self.identities.write().unwrap().insert(key.clone(), identity);
        uuid
    }
}

impl Default for MemoryIdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn add(&self, key: &IdentityKey, _source: &str) -> Result<Option<Identity>> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        if key.is_empty() {
            return Ok(None);
        }

        if let Some(existing) = self.identities.read().unwrap().get(key) {
            return Ok(Some(existing.clone()));
        }

        let identity = Self::identity_for(key);
        self.by_uuid
            .write()
            .unwrap()
            .insert(identity.uuid.clone(), identity.clone());
        self.identities
            .write()
            .unwrap()
            .insert(key.clone(), identity.clone());
        Ok(Some(identity))
    }

    async fn get(&self, uuid: &str) -> Result<Option<Identity>> {
        Ok(self.by_uuid.read().unwrap().get(uuid).cloned())
    }
}
