use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clubsync_core::{
    AmbiguityReviewItem, ConflictReport, EntityKind, MigrationError, MigrationStats, Outcome,
    StatsScope,
};
use clubsync_legacy::{read_clubs, read_persons, read_year, verify_source, LegacyError, LegacySource};
use clubsync_storage::{ArtifactStore, CanonicalStore, DryRunStore};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{MigrationRules, SeedFile};
use crate::importer::{EntityImporter, RowFailure, RunLedger};
use crate::mapper::ReferenceMapper;
use crate::report;
use crate::resolver::CandidatePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationStage {
    Disconnected,
    SourceVerified,
    ZonesSeeded,
    CategoriesSeeded,
    PersonsImported,
    OrganizationsImported,
    EventsImported(i32),
    Reported,
}

impl fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationStage::EventsImported(year) => write!(f, "EventsImported({year})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Enforces the stage order of a run.
#[derive(Debug, Clone)]
pub struct StageMachine {
    current: MigrationStage,
    history: Vec<MigrationStage>,
}

impl Default for StageMachine {
    fn default() -> Self {
        Self {
            current: MigrationStage::Disconnected,
            history: vec![MigrationStage::Disconnected],
        }
    }
}

impl StageMachine {
    pub fn current(&self) -> MigrationStage {
        self.current
    }

    pub fn history(&self) -> &[MigrationStage] {
        &self.history
    }

    pub fn advance(&mut self, next: MigrationStage) -> Result<(), MigrationError> {
        use MigrationStage::*;
        let allowed = match (self.current, next) {
            (Disconnected, SourceVerified)
            | (SourceVerified, ZonesSeeded)
            | (ZonesSeeded, CategoriesSeeded)
            | (CategoriesSeeded, PersonsImported)
            | (PersonsImported, OrganizationsImported)
            | (OrganizationsImported, EventsImported(_))
            | (OrganizationsImported, Reported)
            | (EventsImported(_), Reported)
            | (Reported, Disconnected) => true,
            (EventsImported(previous), EventsImported(year)) => year > previous,
            _ => false,
        };
        if !allowed {
            return Err(MigrationError::InvalidTransition {
                from: self.current.to_string(),
                to: next.to_string(),
            });
        }
        self.current = next;
        self.history.push(next);
        Ok(())
    }

    /// Failure path: handles are released from whatever stage the run reached.
    pub fn disconnect(&mut self) {
        if self.current != MigrationStage::Disconnected {
            self.current = MigrationStage::Disconnected;
            self.history.push(MigrationStage::Disconnected);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YearSelection {
    All,
    Single(i32),
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub years: YearSelection,
    pub dry_run: bool,
    pub first_year: i32,
    pub last_year: i32,
}

impl RunOptions {
    pub fn years(&self) -> Vec<i32> {
        match self.years {
            YearSelection::All => (self.first_year..=self.last_year).collect(),
            YearSelection::Single(year) => vec![year],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum YearOutcome {
    Imported { year: i32, rows: usize, invalid: usize },
    Absent { year: i32 },
    Failed { year: i32, reason: String },
}

impl YearOutcome {
    pub fn year(&self) -> i32 {
        match self {
            YearOutcome::Imported { year, .. }
            | YearOutcome::Absent { year }
            | YearOutcome::Failed { year, .. } => *year,
        }
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub years: Vec<YearOutcome>,
    pub stats: MigrationStats,
    pub conflicts: Vec<ConflictReport>,
    pub ambiguities: Vec<AmbiguityReviewItem>,
    pub failures: Vec<RowFailure>,
    pub stages: Vec<MigrationStage>,
    pub reports_dir: Option<PathBuf>,
}

impl RunSummary {
    pub fn failed_years(&self) -> Vec<i32> {
        self.years
            .iter()
            .filter(|outcome| matches!(outcome, YearOutcome::Failed { .. }))
            .map(YearOutcome::year)
            .collect()
    }

    pub fn succeeded(&self) -> bool {
        self.failed_years().is_empty()
    }
}

/// Drives one run over a legacy source and a canonical target. Both handles
/// are closed when the run ends, whatever the outcome.
pub struct MigrationOrchestrator<L, S> {
    source: L,
    target: S,
    seeds: SeedFile,
    rules: MigrationRules,
    artifacts: Option<ArtifactStore>,
    stages: StageMachine,
}

impl<L: LegacySource, S: CanonicalStore> MigrationOrchestrator<L, S> {
    pub fn new(source: L, target: S, seeds: SeedFile) -> Self {
        let rules = seeds.rules();
        Self {
            source,
            target,
            seeds,
            rules,
            artifacts: None,
            stages: StageMachine::default(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn stage(&self) -> MigrationStage {
        self.stages.current()
    }

    pub fn target(&self) -> &S {
        &self.target
    }

    pub fn into_target(self) -> S {
        self.target
    }

    pub async fn run(&mut self, options: &RunOptions) -> Result<RunSummary, MigrationError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("migration_run", %run_id, dry_run = options.dry_run);
        let mut stages = StageMachine::default();

        let outcome = async {
            let target: &dyn CanonicalStore = &self.target;
            let shadowed;
            let store: &dyn CanonicalStore = if options.dry_run {
                shadowed = DryRunStore::new(target);
                &shadowed
            } else {
                target
            };
            let run = Run {
                source: &self.source,
                store,
                seeds: &self.seeds,
                rules: &self.rules,
                artifacts: self.artifacts.as_ref(),
            };
            run.execute(run_id, options, &mut stages).await
        }
        .instrument(span)
        .await;

        self.source.close().await;
        self.target.close().await;
        match outcome {
            Ok(mut summary) => {
                stages.advance(MigrationStage::Disconnected)?;
                summary.stages = stages.history().to_vec();
                self.stages = stages;
                Ok(summary)
            }
            Err(err) => {
                warn!(%run_id, stage = %stages.current(), error = %err, "run aborted");
                stages.disconnect();
                self.stages = stages;
                Err(err)
            }
        }
    }
}

struct Run<'a> {
    source: &'a dyn LegacySource,
    store: &'a dyn CanonicalStore,
    seeds: &'a SeedFile,
    rules: &'a MigrationRules,
    artifacts: Option<&'a ArtifactStore>,
}

impl Run<'_> {
    async fn execute(
        &self,
        run_id: Uuid,
        options: &RunOptions,
        stages: &mut StageMachine,
    ) -> Result<RunSummary, MigrationError> {
        let started_at = Utc::now();
        let mut ledger = RunLedger::default();
        ledger.stats.reset();

        verify_source(self.source).await?;
        stages.advance(MigrationStage::SourceVerified)?;

        self.seed_zones(&mut ledger).await;
        stages.advance(MigrationStage::ZonesSeeded)?;
        self.seed_categories(&mut ledger).await;
        stages.advance(MigrationStage::CategoriesSeeded)?;

        let years = match ReferenceMapper::load(self.store, self.rules).await {
            Ok(mut mapper) => {
                self.import_entities(&mut mapper, options, stages, &mut ledger)
                    .await?
            }
            Err(err) => {
                let err = MigrationError::from(err);
                warn!(error = %err, "reference data unavailable, nothing imported");
                ledger.fail(StatsScope::Global, EntityKind::Person, None, &err);
                ledger.fail(StatsScope::Global, EntityKind::Organization, None, &err);
                stages.advance(MigrationStage::PersonsImported)?;
                stages.advance(MigrationStage::OrganizationsImported)?;
                let mut years = Vec::new();
                for year in options.years() {
                    years.push(year_failed(&mut ledger, year, &err));
                    stages.advance(MigrationStage::EventsImported(year))?;
                }
                years
            }
        };

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: options.dry_run,
            years,
            stats: ledger.stats,
            conflicts: ledger.conflicts,
            ambiguities: ledger.ambiguities,
            failures: ledger.failures,
            stages: Vec::new(),
            reports_dir: None,
        };
        if let Some(artifacts) = self.artifacts {
            match report::write_artifacts(artifacts, &summary).await {
                Ok(stored) => {
                    summary.reports_dir = Some(artifacts.run_dir(run_id));
                    info!(files = stored.len(), "run report written");
                }
                Err(err) => warn!(error = %format!("{err:#}"), "run report could not be written"),
            }
        }
        stages.advance(MigrationStage::Reported)?;
        Ok(summary)
    }

    async fn import_entities(
        &self,
        mapper: &mut ReferenceMapper,
        options: &RunOptions,
        stages: &mut StageMachine,
        ledger: &mut RunLedger,
    ) -> Result<Vec<YearOutcome>, MigrationError> {
        let importer = EntityImporter::new(self.store, self.rules);

        let persons = read_persons(self.source).await?;
        record_invalid(ledger, StatsScope::Global, EntityKind::Person, persons.invalid);
        for row in &persons.rows {
            if let Err(err) = importer.import_person(row, mapper, ledger).await {
                ledger.fail(StatsScope::Global, EntityKind::Person, Some(row.legacy_id), &err);
            }
        }
        info!(rows = persons.rows.len(), "persons imported");
        stages.advance(MigrationStage::PersonsImported)?;

        let clubs = read_clubs(self.source).await?;
        record_invalid(ledger, StatsScope::Global, EntityKind::Organization, clubs.invalid);
        for row in &clubs.rows {
            if let Err(err) = importer.import_organization(row, mapper, ledger).await {
                ledger.fail(StatsScope::Global, EntityKind::Organization, Some(row.legacy_id), &err);
            }
        }
        info!(rows = clubs.rows.len(), "clubs imported");
        stages.advance(MigrationStage::OrganizationsImported)?;

        let mut years = Vec::new();
        for year in options.years() {
            let outcome = self
                .import_year(year, &importer, mapper, ledger)
                .instrument(info_span!("partition", year))
                .await?;
            years.push(outcome);
            stages.advance(MigrationStage::EventsImported(year))?;
        }
        Ok(years)
    }

    /// Seeds reference rows that are not there yet; existing codes are left untouched.
    async fn seed_zones(&self, ledger: &mut RunLedger) {
        let existing = match self.store.zones().await {
            Ok(existing) => existing,
            Err(err) => {
                ledger.fail(StatsScope::Global, EntityKind::Zone, None, &err.into());
                return;
            }
        };
        for seed in &self.seeds.zones {
            if existing.iter().any(|z| z.code.eq_ignore_ascii_case(&seed.code)) {
                ledger.record(StatsScope::Global, EntityKind::Zone, Outcome::Matched);
                continue;
            }
            match self.store.insert_zone(&seed.code, &seed.name).await {
                Ok(_) => ledger.record(StatsScope::Global, EntityKind::Zone, Outcome::Created),
                Err(err) => ledger.fail(StatsScope::Global, EntityKind::Zone, None, &err.into()),
            }
        }
    }

    async fn seed_categories(&self, ledger: &mut RunLedger) {
        let existing = match self.store.categories().await {
            Ok(existing) => existing,
            Err(err) => {
                ledger.fail(StatsScope::Global, EntityKind::Category, None, &err.into());
                return;
            }
        };
        for seed in &self.seeds.categories {
            if existing.iter().any(|c| c.code.eq_ignore_ascii_case(&seed.code)) {
                ledger.record(StatsScope::Global, EntityKind::Category, Outcome::Matched);
                continue;
            }
            match self.store.insert_category(&seed.code, &seed.name).await {
                Ok(_) => ledger.record(StatsScope::Global, EntityKind::Category, Outcome::Created),
                Err(err) => ledger.fail(StatsScope::Global, EntityKind::Category, None, &err.into()),
            }
        }
    }

    /// Errors confined to this year come back as `YearOutcome::Failed`; only
    /// fatal ones propagate.
    async fn import_year(
        &self,
        year: i32,
        importer: &EntityImporter<'_>,
        mapper: &mut ReferenceMapper,
        ledger: &mut RunLedger,
    ) -> Result<YearOutcome, MigrationError> {
        let scope = StatsScope::Year(year);
        let partition = match read_year(self.source, year, self.rules.full_name_cutoff).await {
            Ok(Some(partition)) => partition,
            Ok(None) => {
                info!("no legacy partition");
                return Ok(YearOutcome::Absent { year });
            }
            Err(err @ LegacyError::MissingColumns { .. }) => {
                return Ok(year_failed(ledger, year, &err.into()));
            }
            Err(err) => return Err(err.into()),
        };

        let invalid = partition.invalid.len();
        record_invalid(ledger, scope, EntityKind::Event, partition.invalid);
        let pool = match self.store.persons().await {
            Ok(persons) => CandidatePool::from_persons(&persons),
            Err(err) => return Ok(year_failed(ledger, year, &err.into())),
        };
        for row in &partition.rows {
            if let Err(err) = importer.import_event(row, mapper, &pool, ledger).await {
                if err.is_fatal() {
                    return Err(err);
                }
                ledger.fail(scope, EntityKind::Event, Some(row.legacy_id), &err);
            }
        }
        info!(rows = partition.rows.len(), invalid, schema = ?partition.schema, "partition imported");
        Ok(YearOutcome::Imported {
            year,
            rows: partition.rows.len(),
            invalid,
        })
    }
}

fn year_failed(ledger: &mut RunLedger, year: i32, err: &MigrationError) -> YearOutcome {
    warn!(year, error = %err, "partition skipped");
    ledger.record(StatsScope::Year(year), EntityKind::Event, Outcome::Error);
    YearOutcome::Failed {
        year,
        reason: err.to_string(),
    }
}

fn record_invalid(
    ledger: &mut RunLedger,
    scope: StatsScope,
    entity: EntityKind,
    invalid: Vec<LegacyError>,
) {
    for err in invalid {
        warn!(%scope, %entity, error = %err, "invalid legacy row");
        ledger.record(scope, entity, Outcome::Skipped);
        ledger.failures.push(RowFailure {
            scope,
            entity,
            legacy_id: None,
            message: err.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MigrationStage::*;

    #[test]
    fn stages_only_move_forward() {
        let mut stages = StageMachine::default();
        for next in [
            SourceVerified,
            ZonesSeeded,
            CategoriesSeeded,
            PersonsImported,
            OrganizationsImported,
            EventsImported(2019),
            EventsImported(2021),
            Reported,
            Disconnected,
        ] {
            stages.advance(next).expect("in order");
        }
        assert_eq!(stages.history().len(), 10);
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let mut stages = StageMachine::default();
        let err = stages.advance(PersonsImported).expect_err("skips stages");
        assert!(matches!(err, MigrationError::InvalidTransition { .. }));
        assert!(err.is_fatal());

        for next in [SourceVerified, ZonesSeeded, CategoriesSeeded, PersonsImported, OrganizationsImported, EventsImported(2020)] {
            stages.advance(next).expect("in order");
        }
        assert!(stages.advance(EventsImported(2020)).is_err());
        assert!(stages.advance(EventsImported(2018)).is_err());
        assert_eq!(stages.current(), EventsImported(2020));
    }

    #[test]
    fn disconnect_is_always_reachable_on_failure() {
        let mut stages = StageMachine::default();
        stages.advance(SourceVerified).expect("verified");
        stages.disconnect();
        assert_eq!(stages.current(), Disconnected);
        stages.disconnect();
        assert_eq!(stages.history(), &[Disconnected, SourceVerified, Disconnected]);
    }

    #[test]
    fn year_selection_expands_the_configured_range() {
        let options = RunOptions {
            years: YearSelection::All,
            dry_run: false,
            first_year: 2018,
            last_year: 2021,
        };
        assert_eq!(options.years(), vec![2018, 2019, 2020, 2021]);
        let single = RunOptions {
            years: YearSelection::Single(2019),
            ..options
        };
        assert_eq!(single.years(), vec![2019]);
    }
}
