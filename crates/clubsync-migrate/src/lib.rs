//! Legacy migration pipeline: name resolution, reference mapping,
//! reconciliation, per-entity import and the run orchestrator.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clubsync_legacy::{FixtureLegacySource, LegacySource, PartitionCleanup, PgLegacySource};
use clubsync_storage::{ArtifactStore, CanonicalStore, InMemoryStore, PgCanonicalStore};
use tracing::{info, warn};

pub mod config;
pub mod importer;
pub mod mapper;
pub mod orchestrator;
pub mod reconcile;
pub mod report;
pub mod resolver;

pub use config::{MigrationConfig, MigrationRules, SeedFile};
pub use importer::{EntityImporter, RowFailure, RunLedger};
pub use mapper::{Lookup, LookupStep, ReferenceMapper};
pub use orchestrator::{
    MigrationOrchestrator, MigrationStage, RunOptions, RunSummary, StageMachine, YearOutcome,
    YearSelection,
};
pub use reconcile::{reconcile, Reconcilable, Reconciliation};
pub use resolver::{CandidatePool, MatchStrategy, NameScope, Resolution};

pub const CRATE_NAME: &str = "clubsync-migrate";

/// Opens the configured legacy source: fixture tables when a directory is
/// given, Postgres otherwise.
pub async fn open_legacy_source(
    config: &MigrationConfig,
    fixtures_override: Option<PathBuf>,
) -> Result<Box<dyn LegacySource>> {
    if let Some(dir) = fixtures_override.or_else(|| config.fixtures_dir.clone()) {
        info!(dir = %dir.display(), "reading legacy fixtures");
        let source = FixtureLegacySource::load_dir(&dir)?;
        return Ok(Box::new(source));
    }
    let url = config
        .legacy_database_url
        .as_deref()
        .context("LEGACY_DATABASE_URL is not set and no fixture directory was given")?;
    let source = PgLegacySource::connect(url)
        .await
        .context("connecting to the legacy database")?;
    Ok(Box::new(source))
}

async fn execute<S: CanonicalStore>(
    source: Box<dyn LegacySource>,
    target: S,
    seeds: SeedFile,
    config: &MigrationConfig,
    options: &RunOptions,
) -> Result<RunSummary> {
    let mut orchestrator = MigrationOrchestrator::new(source, target, seeds)
        .with_artifacts(ArtifactStore::new(config.reports_dir.clone()));
    Ok(orchestrator.run(options).await?)
}

pub async fn run_from_env(
    years: YearSelection,
    dry_run: bool,
    fixtures_override: Option<PathBuf>,
) -> Result<RunSummary> {
    let config = MigrationConfig::from_env();
    let seeds = SeedFile::load(&config.seeds_path)?;
    let options = RunOptions {
        years,
        dry_run,
        first_year: config.first_year,
        last_year: config.last_year,
    };
    let source = open_legacy_source(&config, fixtures_override).await?;

    match config.database_url.as_deref() {
        Some(url) => {
            let target = match PgCanonicalStore::connect(url).await {
                Ok(target) => target,
                Err(err) => {
                    source.close().await;
                    return Err(err).context("connecting to the canonical database");
                }
            };
            execute(source, target, seeds, &config, &options).await
        }
        None => {
            warn!("DATABASE_URL is not set; importing into a throwaway in-memory store");
            execute(source, InMemoryStore::new(), seeds, &config, &options).await
        }
    }
}

/// Applies the canonical schema migrations.
pub async fn apply_schema_from_env() -> Result<()> {
    let config = MigrationConfig::from_env();
    let url = config.database_url.context("DATABASE_URL is not set")?;
    let store = PgCanonicalStore::connect(&url).await?;
    let applied = store.apply_schema().await;
    store.close().await;
    applied
}

/// Drops the migrated tournament table of one year from the legacy
/// database. Returns whether it existed.
pub async fn cleanup_year<S: PartitionCleanup>(source: &mut S, year: i32) -> Result<bool> {
    let dropped = source
        .drop_partition(year)
        .await
        .with_context(|| format!("dropping legacy partition {year}"))?;
    if !dropped {
        info!(year, "no legacy partition to drop");
    }
    Ok(dropped)
}

pub async fn cleanup_year_from_env(year: i32) -> Result<bool> {
    let config = MigrationConfig::from_env();
    let url = config
        .legacy_database_url
        .context("LEGACY_DATABASE_URL is not set")?;
    let mut source = PgLegacySource::connect(&url)
        .await
        .context("connecting to the legacy database")?;
    let dropped = cleanup_year(&mut source, year).await;
    source.close().await;
    dropped
}
