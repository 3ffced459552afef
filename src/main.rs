//! # DevHarvest CLI (`dvh`)
//!
//! The `dvh` binary drives the sync and enrichment pipeline from the
//! command line.
//!
//! ## Usage
//!
//! ```bash
//! dvh --config ./config/dvh.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dvh init` | Create raw and enriched indices for all sources |
//! | `dvh sources` | List configured sources and their capabilities |
//! | `dvh sync <source>` | Collect raw records from a source |
//! | `dvh enrich <source>` | Build enriched records from the raw index |
//!
//! A failed run exits 1 after reporting partial counts; a successful run
//! with dropped or skipped records still exits 0.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use devharvest::config::{self, Config};
use devharvest::elastic::ElasticStore;
use devharvest::enrich::{EnrichOptions, EnrichmentEngine};
use devharvest::identity::{IdentityResolver, IdentityServiceClient};
use devharvest::index::IndexStore;
use devharvest::projects::ProjectMap;
use devharvest::raw_sync::{RawSyncEngine, SyncOptions};
use devharvest::registry::{SourceConnector, SourceRegistry};

/// DevHarvest — incrementally republish software-development activity into
/// a search index with identity and project enrichment.
#[derive(Parser)]
#[command(
    name = "dvh",
    about = "DevHarvest — incremental sync and enrichment of development activity data",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dvh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the raw and enriched indices for every configured source.
    ///
    /// Idempotent: existing indices are left untouched unless `--clean`
    /// is given, which deletes and recreates them.
    Init {
        /// Delete and recreate existing indices.
        #[arg(long)]
        clean: bool,
    },

    /// List configured sources, their origins, capabilities, and indices.
    Sources,

    /// Collect raw records from a source into its raw index.
    ///
    /// Resumes from the checkpoint derived from the raw index unless
    /// `--no-incremental` or an explicit `--from-date`/`--from-offset`
    /// is given.
    Sync {
        /// Source name (a `[sources.<name>]` entry).
        source: String,

        /// Resume from this timestamp (RFC 3339). Mutually exclusive with
        /// --from-offset.
        #[arg(long)]
        from_date: Option<DateTime<Utc>>,

        /// Resume from this source-defined offset. Mutually exclusive with
        /// --from-date.
        #[arg(long)]
        from_offset: Option<u64>,

        /// Fetch only this category of records.
        #[arg(long)]
        category: Option<String>,

        /// Ignore the checkpoint and fetch everything.
        #[arg(long)]
        no_incremental: bool,

        /// Override the configured bulk pack size.
        #[arg(long)]
        bulk_size: Option<usize>,
    },

    /// Build enriched records from a source's raw index.
    ///
    /// Tracks its own checkpoint in the enriched index, independent of the
    /// raw sync checkpoint.
    Enrich {
        /// Source name (a `[sources.<name>]` entry).
        source: String,

        /// Re-enrich the whole raw index.
        #[arg(long)]
        no_incremental: bool,

        /// Override the configured bulk pack size.
        #[arg(long)]
        bulk_size: Option<usize>,
    },
}

fn find_source<'a>(registry: &'a SourceRegistry, name: &str) -> Result<&'a SourceConnector> {
    registry.find(name).ok_or_else(|| {
        let known: Vec<&str> = registry.sources().iter().map(|s| s.name.as_str()).collect();
        anyhow::anyhow!(
            "Unknown source: '{}'. Configured sources: {}",
            name,
            if known.is_empty() {
                "(none)".to_string()
            } else {
                known.join(", ")
            }
        )
    })
}

fn load_projects(cfg: &Config) -> Result<ProjectMap> {
    match &cfg.projects.path {
        Some(path) => ProjectMap::load(path),
        None => Ok(ProjectMap::empty()),
    }
}

fn build_resolver(cfg: &Config) -> Option<IdentityResolver> {
    cfg.identity.url.as_deref().map(|url| {
        IdentityResolver::new(
            Box::new(IdentityServiceClient::new(url)),
            &cfg.identity.unaffiliated,
        )
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let registry = SourceRegistry::from_config(&cfg)?;

    match cli.command {
        Commands::Init { clean } => {
            let store = ElasticStore::new(&cfg.index.url, cfg.index.bulk_size, cfg.index.scroll_size);
            for source in registry.sources() {
                store
                    .ensure_index(&source.raw_index, source.raw_mapping.as_ref(), clean)
                    .await
                    .with_context(|| format!("creating raw index for '{}'", source.name))?;
                store
                    .ensure_index(
                        &source.enriched_index,
                        source.enriched_mapping.as_ref(),
                        clean,
                    )
                    .await
                    .with_context(|| format!("creating enriched index for '{}'", source.name))?;
                println!(
                    "{}: {} / {} ready",
                    source.name, source.raw_index, source.enriched_index
                );
            }
            println!("ok");
        }

        Commands::Sources => {
            if registry.is_empty() {
                println!("No sources configured.");
                return Ok(());
            }
            for source in registry.sources() {
                let caps = source.capabilities();
                println!("{}", source.name);
                println!("  origin: {}", source.origin);
                println!(
                    "  indices: {} -> {}",
                    source.raw_index, source.enriched_index
                );
                println!(
                    "  resume: date={} offset={} categories={}",
                    caps.date_resume, caps.offset_resume, caps.categories
                );
            }
        }

        Commands::Sync {
            source,
            from_date,
            from_offset,
            category,
            no_incremental,
            bulk_size,
        } => {
            if from_date.is_some() && from_offset.is_some() {
                bail!("--from-date and --from-offset are mutually exclusive");
            }
            let src = find_source(&registry, &source)?;
            let projects = load_projects(&cfg)?;

            let bulk = bulk_size.unwrap_or(cfg.index.bulk_size);
            let store = ElasticStore::new(&cfg.index.url, bulk, cfg.index.scroll_size);
            store
                .ensure_index(&src.raw_index, src.raw_mapping.as_ref(), false)
                .await?;

            let engine = RawSyncEngine::new(
                &store,
                bulk,
                Duration::from_secs(cfg.index.sync_wait_secs),
            );
            let opts = SyncOptions {
                from_date,
                from_offset,
                category: category.or_else(|| src.category.clone()),
                incremental: !no_incremental,
                project: projects.project_for(&src.origin).map(str::to_string),
            };
            let report = engine
                .sync(src, &opts)
                .await
                .with_context(|| format!("sync failed for '{}' ({})", src.name, src.origin))?;

            println!("sync {}", src.name);
            if let Some(from) = report.resumed_from {
                println!("  resumed from: {}", from.to_rfc3339());
            }
            println!("  fetched: {}", report.fetched);
            println!("  added: {}", report.added);
            println!("  dropped: {}", report.dropped);
            println!("ok");
        }

        Commands::Enrich {
            source,
            no_incremental,
            bulk_size,
        } => {
            let src = find_source(&registry, &source)?;
            let projects = load_projects(&cfg)?;
            let mut resolver = build_resolver(&cfg);

            let bulk = bulk_size.unwrap_or(cfg.index.bulk_size);
            let store = ElasticStore::new(&cfg.index.url, bulk, cfg.index.scroll_size);
            store
                .ensure_index(&src.enriched_index, src.enriched_mapping.as_ref(), false)
                .await?;

            let raw_engine = RawSyncEngine::new(
                &store,
                bulk,
                Duration::from_secs(cfg.index.sync_wait_secs),
            );
            let engine = EnrichmentEngine::new(&store, bulk);
            let opts = EnrichOptions {
                incremental: !no_incremental,
                page_size: cfg.index.scroll_size,
            };
            let report = engine
                .enrich(src, &raw_engine, resolver.as_mut(), &projects, &opts)
                .await
                .with_context(|| format!("enrichment failed for '{}'", src.name))?;

            println!("enrich {}", src.name);
            if let Some(from) = report.resumed_from {
                println!("  resumed from: {}", from.to_rfc3339());
            }
            println!("  enriched: {}", report.enriched);
            println!("  skipped: {}", report.skipped);
            println!("  failed: {}", report.failed);
            println!("ok");
        }
    }

    Ok(())
}
