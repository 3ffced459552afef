//! End-to-end pipeline runs over the in-memory backends: jsonl source into
//! the raw index, then enrichment with identity resolution, across two
//! incremental passes.

use std::io::Write;
use std::sync::atomic::Ordering;
use std::time::Duration;

use devharvest::enrich::{EnrichOptions, EnrichmentEngine};
use devharvest::identity::{IdentityKey, IdentityResolver};
use devharvest::memory::{MemoryIdentityStore, MemoryIndexStore};
use devharvest::models::from_epoch_secs;
use devharvest::projects::ProjectMap;
use devharvest::raw_sync::{RawSyncEngine, SyncOptions};
use devharvest::registry::SourceConnector;
use devharvest::source_jsonl::{JsonlEnricher, JsonlFetcher};

const ORIGIN: &str = "https://github.com/acme/platform.git";

fn source(path: &std::path::Path) -> SourceConnector {
    SourceConnector {
        name: "git".to_string(),
        origin: ORIGIN.to_string(),
        raw_index: "git-raw".to_string(),
        enriched_index: "git-enriched".to_string(),
        category: None,
        raw_mapping: None,
        enriched_mapping: None,
        fetcher: Box::new(JsonlFetcher::new(path.to_path_buf())),
        enricher: Box::new(JsonlEnricher::new("git")),
    }
}

fn engines(store: &MemoryIndexStore) -> (RawSyncEngine<'_, MemoryIndexStore>, EnrichmentEngine<'_, MemoryIndexStore>) {
    (
        RawSyncEngine::new(store, 100, Duration::from_millis(10)),
        EnrichmentEngine::new(store, 100),
    )
}

#[tokio::test]
async fn test_two_incremental_sync_runs_converge_without_duplicates() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{"id": "a", "updated_on": 100, "category": "commit", "summary": "first"}}"#
    )
    .unwrap();
    writeln!(
        file,
        r#"{{"id": "b", "updated_on": 200, "category": "commit", "summary": "second"}}"#
    )
    .unwrap();
    file.flush().unwrap();

    let store = MemoryIndexStore::new(100);
    let src = source(file.path());
    let (raw_engine, _) = engines(&store);

    let report = raw_engine
        .sync(&src, &SyncOptions::incremental())
        .await
        .unwrap();
    assert_eq!(report.fetched, 2);
    assert_eq!(report.added, 2);
    assert!(report.resumed_from.is_none());
    assert_eq!(store.ids("git-raw"), vec!["a", "b"]);

    // New upstream activity lands after the first run.
    writeln!(
        file,
        r#"{{"id": "c", "updated_on": 300, "category": "commit", "summary": "third"}}"#
    )
    .unwrap();
    file.flush().unwrap();

    let report = raw_engine
        .sync(&src, &SyncOptions::incremental())
        .await
        .unwrap();
    // The checkpoint is b's timestamp; the inclusive resume re-delivers b,
    // which overwrites in place.
    assert_eq!(report.resumed_from, Some(from_epoch_secs(200.0)));
    assert_eq!(report.fetched, 2);
    assert_eq!(store.ids("git-raw"), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_enrichment_resolves_identities_once_per_author() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for (id, ts, email) in [
        ("a", 100, "ada@acme.com"),
        ("b", 200, "ada@acme.com"),
        ("c", 300, "grace@example.org"),
    ] {
        writeln!(
            file,
            r#"{{"id": "{}", "updated_on": {}, "summary": "work", "author": {{"name": "x", "email": "{}"}}}}"#,
            id, ts, email
        )
        .unwrap();
    }
    file.flush().unwrap();

    let store = MemoryIndexStore::new(100);
    let src = source(file.path());
    let (raw_engine, enrich_engine) = engines(&store);
    raw_engine
        .sync(&src, &SyncOptions::incremental())
        .await
        .unwrap();

    let identity_store = MemoryIdentityStore::new();
    let hits = identity_store.hits();
    identity_store.seed_with_enrollment(
        &IdentityKey::new(Some("x"), Some("ada@acme.com"), None),
        "Acme",
        "1970-01-01T00:00:00Z",
        "2030-01-01T00:00:00Z",
    );
    let mut resolver = IdentityResolver::new(Box::new(identity_store), "Unknown");

    let report = enrich_engine
        .enrich(
            &src,
            &raw_engine,
            Some(&mut resolver),
            &ProjectMap::empty(),
            &EnrichOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.enriched, 3);
    // Two distinct authors across three records: the priming pass resolves
    // each exactly once and the mapping pass hits only the cache.
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let doc = store.get("git-enriched", "a").unwrap();
    assert_eq!(doc["author_domain"], "acme.com");
    assert_eq!(doc["author_org_name"], "Acme");
    assert!(doc["author_uuid"].is_string());
    assert_eq!(doc["connector_name"], "git");
    assert_eq!(doc["origin"], ORIGIN);

    let other = store.get("git-enriched", "c").unwrap();
    assert_eq!(other["author_org_name"], "Unknown");
}

#[tokio::test]
async fn test_incremental_enrichment_only_processes_new_raw_records() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"id": "a", "updated_on": 100, "summary": "one"}}"#).unwrap();
    file.flush().unwrap();

    let store = MemoryIndexStore::new(100);
    let src = source(file.path());
    let (raw_engine, enrich_engine) = engines(&store);
    let projects = ProjectMap::empty();

    raw_engine
        .sync(&src, &SyncOptions::incremental())
        .await
        .unwrap();
    let first = enrich_engine
        .enrich(&src, &raw_engine, None, &projects, &EnrichOptions::default())
        .await
        .unwrap();
    assert_eq!(first.enriched, 1);
    assert!(first.resumed_from.is_none());

    writeln!(file, r#"{{"id": "b", "updated_on": 200, "summary": "two"}}"#).unwrap();
    file.flush().unwrap();
    raw_engine
        .sync(&src, &SyncOptions::incremental())
        .await
        .unwrap();

    let second = enrich_engine
        .enrich(&src, &raw_engine, None, &projects, &EnrichOptions::default())
        .await
        .unwrap();
    assert_eq!(second.resumed_from, Some(from_epoch_secs(100.0)));
    assert_eq!(second.enriched, 1);
    assert_eq!(store.ids("git-enriched"), vec!["a", "b"]);

    // A third pass with nothing new issues no writes at all.
    let calls_before = store.bulk_calls().load(Ordering::SeqCst);
    let third = enrich_engine
        .enrich(&src, &raw_engine, None, &projects, &EnrichOptions::default())
        .await
        .unwrap();
    assert_eq!(third.enriched, 0);
    assert_eq!(store.bulk_calls().load(Ordering::SeqCst), calls_before);
}

#[tokio::test]
async fn test_full_reenrichment_rewrites_all_documents() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"id": "a", "updated_on": 100, "summary": "one"}}"#).unwrap();
    writeln!(file, r#"{{"id": "b", "updated_on": 200, "summary": "two"}}"#).unwrap();
    file.flush().unwrap();

    let store = MemoryIndexStore::new(100);
    let src = source(file.path());
    let (raw_engine, enrich_engine) = engines(&store);
    let projects = ProjectMap::empty();

    raw_engine
        .sync(&src, &SyncOptions::incremental())
        .await
        .unwrap();
    enrich_engine
        .enrich(&src, &raw_engine, None, &projects, &EnrichOptions::default())
        .await
        .unwrap();

    let full = EnrichOptions {
        incremental: false,
        ..EnrichOptions::default()
    };
    let report = enrich_engine
        .enrich(&src, &raw_engine, None, &projects, &full)
        .await
        .unwrap();
    assert!(report.resumed_from.is_none());
    assert_eq!(report.enriched, 2);
    assert_eq!(store.ids("git-enriched"), vec!["a", "b"]);
}
