use std::path::{Path, PathBuf};

use clubsync_core::{EntityKind, EventStatus, LegacyKey, MigrationError, Person, Role, StatsScope};
use clubsync_legacy::{FixtureLegacySource, FixtureTable};
use clubsync_migrate::{
    cleanup_year, MigrationOrchestrator, MigrationStage, RunOptions, RunSummary, SeedFile,
    YearOutcome, YearSelection,
};
use clubsync_storage::{ArtifactStore, CanonicalStore, InMemoryStore};

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn seeds() -> SeedFile {
    SeedFile::load(&repo_root().join("seeds.yaml")).expect("seed file")
}

fn fixtures() -> FixtureLegacySource {
    FixtureLegacySource::load_dir(repo_root().join("fixtures/legacy")).expect("fixture dir")
}

fn all_years() -> RunOptions {
    RunOptions {
        years: YearSelection::All,
        dry_run: false,
        first_year: 2019,
        last_year: 2022,
    }
}

async fn run_into(
    source: FixtureLegacySource,
    store: InMemoryStore,
    options: &RunOptions,
) -> (RunSummary, InMemoryStore) {
    let mut orchestrator = MigrationOrchestrator::new(source, store, seeds());
    let summary = orchestrator.run(options).await.expect("run");
    assert_eq!(orchestrator.stage(), MigrationStage::Disconnected);
    (summary, orchestrator.into_target())
}

async fn person_id(store: &InMemoryStore, name: &str) -> i64 {
    let found = store.find_persons_by_name(name).await.expect("lookup");
    assert_eq!(found.len(), 1, "{name}");
    found[0].id
}

async fn event_id(store: &InMemoryStore, year: i32, row_id: i64) -> i64 {
    store
        .find_event_by_legacy(LegacyKey { year, row_id })
        .await
        .expect("lookup")
        .expect("event imported")
        .id
}

#[tokio::test]
async fn surname_era_partition_links_directors_and_referees() {
    let (summary, store) = run_into(fixtures(), InMemoryStore::new(), &all_years()).await;
    assert!(summary.succeeded());

    let rossi = person_id(&store, "Mario Rossi").await;
    let bianchi = person_id(&store, "Luca Bianchi").await;
    let neri = person_id(&store, "Giulia Neri").await;
    let primavera = event_id(&store, 2019, 4).await;
    let lago = event_id(&store, 2019, 7).await;

    let assignments = store.assignments().await;
    let on = |event: i64| {
        let mut links = assignments
            .iter()
            .filter(|a| a.event_id == event)
            .map(|a| (a.person_id, a.role))
            .collect::<Vec<_>>();
        links.sort();
        links
    };
    let mut expected = vec![(rossi, Role::Director), (bianchi, Role::Referee)];
    expected.sort();
    assert_eq!(on(primavera), expected);
    // Lone "Rossi" outside the designated zone is not guessed.
    assert_eq!(on(lago), vec![(neri, Role::Referee)]);

    // "Verdi Anna" and the lone "Rossi" have no counterpart.
    let links = summary.stats.get(StatsScope::Year(2019), EntityKind::Assignment);
    assert_eq!(links.created, 4);
    assert_eq!(links.skipped, 2);

    let events = summary.stats.get(StatsScope::Year(2019), EntityKind::Event);
    assert_eq!((events.created, events.skipped), (3, 1));
    assert!(store
        .find_event_by_legacy(LegacyKey { year: 2019, row_id: 9 })
        .await
        .expect("lookup")
        .is_none());
}

#[tokio::test]
async fn designated_zone_resolves_a_lone_surname() {
    let (_, store) = run_into(fixtures(), InMemoryStore::new(), &all_years()).await;
    let bianchi = person_id(&store, "Luca Bianchi").await;
    let autunno = event_id(&store, 2019, 11).await;

    let directors = store
        .assignments()
        .await
        .into_iter()
        .filter(|a| a.event_id == autunno && a.role == Role::Director)
        .map(|a| a.person_id)
        .collect::<Vec<_>>();
    assert_eq!(directors, vec![bianchi]);
}

#[tokio::test]
async fn unknown_club_lands_on_the_zone_placeholder() {
    let (_, store) = run_into(fixtures(), InMemoryStore::new(), &all_years()).await;
    let placeholder = store
        .find_organization_by_code("TBA-SZR6")
        .await
        .expect("lookup")
        .expect("placeholder");
    assert!(placeholder.is_placeholder);

    let autunno = store
        .find_event_by_legacy(LegacyKey { year: 2019, row_id: 11 })
        .await
        .expect("lookup")
        .expect("event");
    assert_eq!(autunno.organization_id, Some(placeholder.id));
    assert_eq!(autunno.status, EventStatus::Completed);

    let primavera = store
        .find_event_by_legacy(LegacyKey { year: 2019, row_id: 4 })
        .await
        .expect("lookup")
        .expect("event");
    let gcr = store
        .find_organization_by_code("GCR")
        .await
        .expect("lookup")
        .expect("club");
    assert_eq!(primavera.organization_id, Some(gcr.id));
}

#[tokio::test]
async fn full_name_partition_imports_observers_and_availability() {
    let (summary, store) = run_into(fixtures(), InMemoryStore::new(), &all_years()).await;
    let open = event_id(&store, 2022, 1).await;
    let ferrari = person_id(&store, "Paolo Ferrari").await;
    let de_luca = person_id(&store, "Marco De Luca").await;

    let assignments = store.assignments().await;
    assert!(assignments
        .iter()
        .any(|a| a.event_id == open && a.person_id == ferrari && a.role == Role::Observer));
    assert!(assignments
        .iter()
        .any(|a| a.event_id == open && a.person_id == de_luca && a.role == Role::Referee));

    // The duplicated "Rossi Mario" in Disponibili collapses to one row.
    let available = store
        .availabilities()
        .await
        .into_iter()
        .filter(|a| a.event_id == open)
        .count();
    assert_eq!(available, 2);

    assert_eq!(
        summary.years,
        vec![
            YearOutcome::Imported { year: 2019, rows: 4, invalid: 0 },
            YearOutcome::Absent { year: 2020 },
            YearOutcome::Absent { year: 2021 },
            YearOutcome::Imported { year: 2022, rows: 1, invalid: 0 },
        ]
    );
}

#[tokio::test]
async fn rerun_creates_nothing_new() {
    let (_, store) = run_into(fixtures(), InMemoryStore::new(), &all_years()).await;
    let assignments = store.assignments().await.len();
    let availabilities = store.availabilities().await.len();
    let organizations = store.organizations().await.expect("orgs").len();

    let (rerun, store) = run_into(fixtures(), store, &all_years()).await;
    assert_eq!(rerun.stats.totals().created, 0);
    assert!(rerun.conflicts.is_empty());
    assert_eq!(store.assignments().await.len(), assignments);
    assert_eq!(store.availabilities().await.len(), availabilities);
    assert_eq!(store.organizations().await.expect("orgs").len(), organizations);
    assert_eq!(store.persons().await.expect("persons").len(), 5);
}

#[tokio::test]
async fn existing_values_are_filled_but_never_overwritten() {
    let store = InMemoryStore::new();
    let id = store
        .insert_person(&Person {
            id: 0,
            name: "Mario Rossi".into(),
            email: Some("mario.rossi@example.org".into()),
            phone: Some("+39 06 0000000".into()),
            city: None,
            level: None,
            zone_id: None,
            code: None,
        })
        .await
        .expect("existing person");

    let (summary, store) = run_into(fixtures(), store, &all_years()).await;
    let person = store.person(id).await.expect("still there");
    assert_eq!(person.phone.as_deref(), Some("+39 06 0000000"));
    assert_eq!(person.city.as_deref(), Some("Roma"));

    let report = summary
        .conflicts
        .iter()
        .find(|c| c.entity == EntityKind::Person && c.canonical_id == id)
        .expect("phone conflict reported");
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].field, "phone");
    assert_eq!(report.conflicts[0].incoming, "+39 333 1112233");
}

#[tokio::test]
async fn dry_run_leaves_the_target_untouched() {
    let options = RunOptions {
        dry_run: true,
        ..all_years()
    };
    let (summary, store) = run_into(fixtures(), InMemoryStore::new(), &options).await;
    assert!(summary.dry_run);
    assert!(summary.stats.entity_total(EntityKind::Person).created > 0);
    assert!(summary.stats.entity_total(EntityKind::Assignment).created > 0);

    assert!(store.zones().await.expect("zones").is_empty());
    assert!(store.persons().await.expect("persons").is_empty());
    assert!(store.events().await.is_empty());
    assert!(store.assignments().await.is_empty());
}

#[tokio::test]
async fn dry_run_counts_match_a_live_run() {
    let (live, _) = run_into(fixtures(), InMemoryStore::new(), &all_years()).await;
    let options = RunOptions {
        dry_run: true,
        ..all_years()
    };
    let (dry, _) = run_into(fixtures(), InMemoryStore::new(), &options).await;

    assert_eq!(dry.stats.totals(), live.stats.totals());
    for entity in [
        EntityKind::Zone,
        EntityKind::Category,
        EntityKind::Person,
        EntityKind::PersonDetail,
        EntityKind::Organization,
        EntityKind::Event,
        EntityKind::Assignment,
        EntityKind::Availability,
    ] {
        assert_eq!(
            dry.stats.entity_total(entity),
            live.stats.entity_total(entity),
            "{entity}"
        );
    }
    assert_eq!(dry.years, live.years);
    assert_eq!(dry.conflicts.len(), live.conflicts.len());
    assert_eq!(dry.ambiguities.len(), live.ambiguities.len());
}

#[tokio::test]
async fn lowercase_legacy_columns_still_import() {
    let path = repo_root().join("fixtures/legacy/arbitri.json");
    let persons: FixtureTable =
        serde_json::from_str(&std::fs::read_to_string(path).expect("read")).expect("parse");
    let lowercased = FixtureTable {
        columns: persons.columns.iter().map(|c| c.to_lowercase()).collect(),
        rows: persons
            .rows
            .into_iter()
            .map(|row| row.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect())
            .collect(),
    };
    let mut source = fixtures();
    source.insert_table("arbitri", lowercased);

    let (summary, store) = run_into(source, InMemoryStore::new(), &all_years()).await;
    let rossi = store
        .person(person_id(&store, "Mario Rossi").await)
        .await
        .expect("stored");
    assert_eq!(rossi.email.as_deref(), Some("mario.rossi@example.org"));
    assert_eq!(rossi.city.as_deref(), Some("Roma"));
    assert_eq!(store.persons().await.expect("persons").len(), 5);

    let persons = summary.stats.get(StatsScope::Global, EntityKind::Person);
    assert_eq!((persons.created, persons.skipped), (5, 2));
}

#[tokio::test]
async fn cleanup_drops_the_legacy_partition_only() {
    let (_, store) = run_into(fixtures(), InMemoryStore::new(), &all_years()).await;
    let mut source = fixtures();
    assert!(cleanup_year(&mut source, 2019).await.expect("cleanup"));
    assert!(!cleanup_year(&mut source, 2019).await.expect("already gone"));

    let (rerun, store) = run_into(source, store, &all_years()).await;
    assert_eq!(rerun.years[0], YearOutcome::Absent { year: 2019 });
    event_id(&store, 2019, 4).await;
}

#[tokio::test]
async fn broken_partition_fails_alone() {
    let mut source = fixtures();
    source.insert_table(
        "gare_2020",
        FixtureTable {
            columns: vec!["id".into(), "Torneo".into(), "DataInizio".into()],
            rows: Vec::new(),
        },
    );
    let (summary, store) = run_into(source, InMemoryStore::new(), &all_years()).await;

    assert_eq!(summary.failed_years(), vec![2020]);
    assert!(!summary.succeeded());
    assert!(matches!(summary.years[3], YearOutcome::Imported { year: 2022, .. }));
    assert_eq!(
        summary.stats.get(StatsScope::Year(2020), EntityKind::Event).errors,
        1
    );
    event_id(&store, 2022, 1).await;
}

#[tokio::test]
async fn missing_base_table_aborts_and_disconnects() {
    let mut source = FixtureLegacySource::default();
    source.insert_table(
        "arbitri",
        FixtureTable {
            columns: ["id", "Nome", "Cognome", "Email", "Livello", "Zona"]
                .into_iter()
                .map(String::from)
                .collect(),
            rows: Vec::new(),
        },
    );
    let mut orchestrator = MigrationOrchestrator::new(source, InMemoryStore::new(), seeds());
    let err = orchestrator.run(&all_years()).await.expect_err("no clubs table");

    assert!(matches!(err, MigrationError::SourceUnavailable(_)));
    assert_eq!(orchestrator.stage(), MigrationStage::Disconnected);
    assert!(orchestrator
        .target()
        .zones()
        .await
        .expect("zones")
        .is_empty());
}

#[tokio::test]
async fn single_year_run_writes_the_report_set() {
    let reports = tempfile::tempdir().expect("tempdir");
    let options = RunOptions {
        years: YearSelection::Single(2022),
        ..all_years()
    };
    let mut orchestrator = MigrationOrchestrator::new(fixtures(), InMemoryStore::new(), seeds())
        .with_artifacts(ArtifactStore::new(reports.path()));
    let summary = orchestrator.run(&options).await.expect("run");

    assert_eq!(summary.years.len(), 1);
    assert_eq!(
        summary.stages.last().copied(),
        Some(MigrationStage::Disconnected)
    );
    assert!(summary.stages.contains(&MigrationStage::EventsImported(2022)));

    let dir = summary.reports_dir.expect("reports written");
    for name in [
        "migration_report.md",
        "conflicts.json",
        "stats.parquet",
        "conflicts.parquet",
        "manifest.json",
    ] {
        assert!(dir.join(name).exists(), "{name}");
    }
    let markdown = std::fs::read_to_string(dir.join("migration_report.md")).expect("markdown");
    assert!(markdown.contains("2022"));
}
