//! Contributor identity resolution.
//!
//! Maps free-text `(name, email, username)` triples to stable identities
//! held by an external identity-management backend, with a per-run
//! memoization cache. The resolver is constructed once per run and passed
//! by handle into the enrichment engine — deliberately not a process-wide
//! singleton, so merged identities are re-derived from the backend on every
//! run.
//!
//! Identity-store failures degrade to "no identity known" with a warning;
//! they never abort a pipeline run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::{HarvestError, Result};

/// A free-text author triple as it appears in source data. At least one
/// component must be populated for the key to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IdentityKey {
    pub name: Option<String>,
    pub email: Option<String>,
    pub username: Option<String>,
}

impl IdentityKey {
    pub fn new(name: Option<&str>, email: Option<&str>, username: Option<&str>) -> Self {
        let clean = |v: Option<&str>| {
            v.map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            name: clean(name),
            email: clean(email),
            username: clean(username),
        }
    }

    /// A key with no populated component cannot resolve to anything.
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.username.is_none()
    }
}

/// A time-bounded assignment of an identity to an organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub organization: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A stable contributor identity as held by the identity backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    /// Stable identity uuid. Several keys may map to the same uuid after
    /// an identity merge in the backend.
    pub uuid: String,
    pub name: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub enrollments: Vec<Enrollment>,
}

/// Backend holding identities and enrollments.
///
/// `add` looks up or creates the identity record for a key under a source
/// name; `get` fetches an identity by uuid. Both return `Ok(None)` when the
/// backend reports the key/uuid as unknown or invalid — soft failures, not
/// errors.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn add(&self, key: &IdentityKey, source: &str) -> Result<Option<Identity>>;
    async fn get(&self, uuid: &str) -> Result<Option<Identity>>;
}

/// HTTP client for the identity-management service.
pub struct IdentityServiceClient {
    client: reqwest::Client,
    base_url: String,
}

impl IdentityServiceClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl IdentityStore for IdentityServiceClient {
    async fn add(&self, key: &IdentityKey, source: &str) -> Result<Option<Identity>> {
        let resp = self
            .client
            .post(format!("{}/identities", self.base_url))
            .json(&json!({
                "source": source,
                "name": key.name,
                "email": key.email,
                "username": key.username,
            }))
            .send()
            .await
            .map_err(|e| HarvestError::Connect(e.to_string()))?;

        // The backend answers 400 for keys it considers invalid; treat as
        // "no identity known".
        if resp.status() == reqwest::StatusCode::BAD_REQUEST {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(HarvestError::Identity(format!(
                "identity add failed: {}",
                resp.status()
            )));
        }

        let identity: Identity = resp
            .json()
            .await
            .map_err(|e| HarvestError::Identity(e.to_string()))?;
        Ok(Some(identity))
    }

    async fn get(&self, uuid: &str) -> Result<Option<Identity>> {
        let resp = self
            .client
            .get(format!("{}/identities/{}", self.base_url, uuid))
            .send()
            .await
            .map_err(|e| HarvestError::Connect(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(HarvestError::Identity(format!(
                "identity get failed: {}",
                resp.status()
            )));
        }

        let identity: Identity = resp
            .json()
            .await
            .map_err(|e| HarvestError::Identity(e.to_string()))?;
        Ok(Some(identity))
    }
}

/// Per-run identity resolver with memoization.
///
/// The cache is keyed by the full `(IdentityKey, source)` tuple: the same
/// name/email pair may legitimately map to different identities per source.
/// Nothing is persisted across runs, so uuid merges done in the backend
/// take effect on the next run.
pub struct IdentityResolver {
    store: Box<dyn IdentityStore>,
    unaffiliated: String,
    cache: HashMap<(IdentityKey, String), Option<Identity>>,
    by_uuid: HashMap<String, Identity>,
}

impl IdentityResolver {
    pub fn new(store: Box<dyn IdentityStore>, unaffiliated: &str) -> Self {
        Self {
            store,
            unaffiliated: unaffiliated.to_string(),
            cache: HashMap::new(),
            by_uuid: HashMap::new(),
        }
    }

    /// Resolve a key under a source name, hitting the backend at most once
    /// per `(key, source)` for the resolver's lifetime.
    ///
    /// Returns `None` for empty keys, keys the backend rejects, and backend
    /// errors — the latter logged at warn. Resolution failures never abort
    /// the caller's run.
    pub async fn resolve(&mut self, key: &IdentityKey, source: &str) -> Option<Identity> {
        if key.is_empty() {
            return None;
        }

        let cache_key = (key.clone(), source.to_string());
        if let Some(cached) = self.cache.get(&cache_key) {
            return cached.clone();
        }

        let resolved = match self.store.add(key, source).await {
            Ok(identity) => identity,
            Err(err) => {
                warn!(source, ?key, %err, "identity resolution failed, treating as unknown");
                None
            }
        };

        if let Some(identity) = &resolved {
            debug!(source, uuid = %identity.uuid, "identity resolved");
            self.by_uuid.insert(identity.uuid.clone(), identity.clone());
        }
        self.cache.insert(cache_key, resolved.clone());
        resolved
    }

    /// Organization the identity was enrolled in at `at`, or the configured
    /// unaffiliated label when no enrollment window matches.
    pub async fn enrollment_at(&mut self, uuid: &str, at: DateTime<Utc>) -> String {
        let identity = match self.by_uuid.get(uuid) {
            Some(identity) => Some(identity.clone()),
            None => match self.store.get(uuid).await {
                Ok(Some(identity)) => {
                    self.by_uuid.insert(uuid.to_string(), identity.clone());
                    Some(identity)
                }
                Ok(None) => None,
                Err(err) => {
                    warn!(uuid, %err, "enrollment lookup failed");
                    None
                }
            },
        };

        identity
            .and_then(|i| {
                i.enrollments
                    .iter()
                    .find(|e| e.start <= at && at < e.end)
                    .map(|e| e.organization.clone())
            })
            .unwrap_or_else(|| self.unaffiliated.clone())
    }

    /// Bot flag from the identity's profile; `false` when no profile is
    /// known for the uuid.
    pub fn is_bot(&self, uuid: &str) -> bool {
        self.by_uuid.get(uuid).map(|i| i.is_bot).unwrap_or(false)
    }

    pub fn unaffiliated(&self) -> &str {
        &self.unaffiliated
    }
}

/// The part of an email address after `@`, or `None` for anything
/// malformed. Never panics on arbitrary input.
pub fn email_domain(email: &str) -> Option<&str> {
    let (local, domain) = email.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') || domain.contains(' ') {
        return None;
    }
    Some(domain)
}
