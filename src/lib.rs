//! # DevHarvest
//!
//! An incremental harvester that republishes software-development activity
//! (version control, issue trackers, forums, chat, CI) into a
//! search/analytics index, adding derived fields: resolved contributor
//! identity, organizational affiliation, and project mapping.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────┐
//! │  Fetchers   │──▶│ RawSyncEngine │──▶│  raw index   │
//! │ (per source)│   │  checkpoint,  │   │ (1 doc per   │
//! └─────────────┘   │  tag, pack    │   │  unique_id)  │
//!                   └──────────────┘   └──────┬──────┘
//!                                             │ cursor
//!                   ┌──────────────┐   ┌──────▼──────┐
//!                   │  Identity    │◀──│ Enrichment   │
//!                   │  Resolver    │   │ Engine       │
//!                   └──────────────┘   └──────┬──────┘
//!                                             ▼
//!                                      ┌─────────────┐
//!                                      │  enriched    │
//!                                      │  index       │
//!                                      └─────────────┘
//! ```
//!
//! Both engines are independently resumable: each derives its checkpoint
//! per run from a max aggregation over the timestamps already in its target
//! index, so correctness depends only on the index contents — no cursor
//! files, no shared log. Re-running a sync is idempotent because documents
//! are upserted by source-defined ids.
//!
//! ## Quick Start
//!
//! ```bash
//! dvh init                  # create raw + enriched indices
//! dvh sources               # list configured sources
//! dvh sync git              # collect raw records
//! dvh enrich git            # build enriched records
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Pipeline error taxonomy |
//! | [`models`] | Raw/enriched record types and run reports |
//! | [`index`] | Search-index abstraction ([`index::IndexStore`]) |
//! | [`elastic`] | Elasticsearch-style HTTP backend |
//! | [`memory`] | In-memory backends for tests and offline runs |
//! | [`identity`] | Contributor identity resolution |
//! | [`projects`] | Origin → project mapping |
//! | [`fetcher`] | Fetch-producer seam and source capabilities |
//! | [`enricher`] | Raw → enriched mapping seam |
//! | [`raw_sync`] | Raw synchronization engine and cursor |
//! | [`enrich`] | Enrichment engine |
//! | [`registry`] | Configured source registry |
//! | [`source_jsonl`] | Built-in NDJSON-file source |

pub mod config;
pub mod elastic;
pub mod enrich;
pub mod enricher;
pub mod error;
pub mod fetcher;
pub mod identity;
pub mod index;
pub mod memory;
pub mod models;
pub mod projects;
pub mod raw_sync;
pub mod registry;
pub mod source_jsonl;
