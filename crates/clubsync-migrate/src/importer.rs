//! Create-or-reconcile for persons, clubs and tournaments, plus the role and
//! availability links parsed out of each tournament row.

use chrono::{NaiveDate, Utc};
use clubsync_core::{
    creation_order, AmbiguityReviewItem, Availability, ConflictReport, EntityId, EntityKind, Event,
    EventStatus, LegacyKey, Level, MigrationError, MigrationStats, Organization, Outcome, Person,
    PersonDetail, Role, RoleAssignment, StatsScope,
};
use clubsync_legacy::{LegacyClubRow, LegacyPersonRow, RawEventRow, SchemaVersion};
use clubsync_storage::CanonicalStore;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::MigrationRules;
use crate::mapper::ReferenceMapper;
use crate::reconcile::{apply_fillable, insert_organization_unique, reconcile, Reconcilable};
use crate::resolver::{CandidatePool, NameScope, Resolution};

#[derive(Debug, Clone, Serialize)]
pub struct RowFailure {
    pub scope: StatsScope,
    pub entity: EntityKind,
    pub legacy_id: Option<i64>,
    pub message: String,
}

/// Everything a run accumulates across partitions.
#[derive(Debug, Default)]
pub struct RunLedger {
    pub stats: MigrationStats,
    pub conflicts: Vec<ConflictReport>,
    pub ambiguities: Vec<AmbiguityReviewItem>,
    pub failures: Vec<RowFailure>,
}

impl RunLedger {
    pub fn record(&mut self, scope: StatsScope, entity: EntityKind, outcome: Outcome) {
        self.stats.record(scope, entity, outcome);
    }

    pub fn fail(
        &mut self,
        scope: StatsScope,
        entity: EntityKind,
        legacy_id: Option<i64>,
        err: &MigrationError,
    ) {
        warn!(%scope, %entity, legacy_id = ?legacy_id, error = %err, "row failed");
        self.record(scope, entity, Outcome::Error);
        self.failures.push(RowFailure {
            scope,
            entity,
            legacy_id,
            message: err.to_string(),
        });
    }

    fn conflict(&mut self, scope: StatsScope, report: Option<ConflictReport>) {
        if let Some(report) = report {
            debug!(entity = %report.entity, id = report.canonical_id, fields = report.conflicts.len(), "field conflicts");
            self.record(scope, report.entity, Outcome::Conflict);
            self.conflicts.push(report);
        }
    }
}

enum Existing<T> {
    Found(T),
    Missing,
    /// Several candidates share the natural key; the row is left alone.
    Ambiguous,
}

pub struct EntityImporter<'a> {
    store: &'a dyn CanonicalStore,
    rules: &'a MigrationRules,
    today: NaiveDate,
}

impl<'a> EntityImporter<'a> {
    pub fn new(store: &'a dyn CanonicalStore, rules: &'a MigrationRules) -> Self {
        Self {
            store,
            rules,
            today: Utc::now().date_naive(),
        }
    }

    /// Reconciles `existing` with `incoming`, writes the filled record through
    /// `save` and records the outcome.
    async fn merge<T, F, Fut>(
        &self,
        mut existing: T,
        incoming: &T,
        scope: StatsScope,
        ledger: &mut RunLedger,
        save: F,
    ) -> Result<T, MigrationError>
    where
        T: Reconcilable,
        F: FnOnce(T) -> Fut,
        Fut: std::future::Future<Output = Result<T, MigrationError>>,
    {
        let reconciliation = reconcile(&existing, incoming);
        let changed = apply_fillable(&mut existing, incoming, &reconciliation);
        let report = reconciliation.into_report(&existing, scope);
        let merged = if changed {
            let saved = save(existing).await?;
            ledger.record(scope, T::kind(), Outcome::Updated);
            saved
        } else {
            ledger.record(scope, T::kind(), Outcome::Matched);
            existing
        };
        ledger.conflict(scope, report);
        Ok(merged)
    }

    pub async fn import_person(
        &self,
        row: &LegacyPersonRow,
        mapper: &ReferenceMapper,
        ledger: &mut RunLedger,
    ) -> Result<Option<EntityId>, MigrationError> {
        let scope = StatsScope::Global;
        if self.rules.is_skip_sentinel(row.level.as_deref()) {
            debug!(legacy_id = row.legacy_id, level = ?row.level, "person skipped by level");
            ledger.record(scope, EntityKind::Person, Outcome::Skipped);
            return Ok(None);
        }
        let Some(name) = row.full_name() else {
            debug!(legacy_id = row.legacy_id, "person row without a name");
            ledger.record(scope, EntityKind::Person, Outcome::Skipped);
            return Ok(None);
        };

        let level = row.level.as_deref().and_then(Level::parse);
        if level.is_none() && row.level.is_some() {
            debug!(legacy_id = row.legacy_id, level = ?row.level, "unknown level ignored");
        }
        let incoming = Person {
            id: 0,
            name,
            email: row.email.clone(),
            phone: row.phone.clone(),
            city: row.city.clone(),
            level,
            zone_id: row
                .zone_code
                .as_deref()
                .and_then(|code| mapper.find_zone(code))
                .map(|lookup| lookup.id),
            code: row.code.clone(),
        };

        let person_id = match self.find_person(&incoming, row.legacy_id, ledger).await? {
            Existing::Found(existing) => {
                let store = self.store;
                let merged = self
                    .merge(existing, &incoming, scope, ledger, |person| async move {
                        store.update_person(&person).await?;
                        Ok::<_, MigrationError>(person)
                    })
                    .await?;
                merged.id
            }
            Existing::Missing => {
                let id = self.store.insert_person(&incoming).await?;
                debug!(legacy_id = row.legacy_id, id, "person created");
                ledger.record(scope, EntityKind::Person, Outcome::Created);
                id
            }
            Existing::Ambiguous => return Ok(None),
        };

        self.import_person_detail(person_id, row, ledger).await?;
        Ok(Some(person_id))
    }

    async fn find_person(
        &self,
        incoming: &Person,
        legacy_id: i64,
        ledger: &mut RunLedger,
    ) -> Result<Existing<Person>, MigrationError> {
        if let Some(email) = incoming.email.as_deref() {
            if let Some(person) = self.store.find_person_by_email(email).await? {
                return Ok(Existing::Found(person));
            }
        }
        let mut namesakes = self.store.find_persons_by_name(&incoming.name).await?;
        namesakes.sort_by_key(|p| creation_order(p.id));
        match namesakes.len() {
            0 => Ok(Existing::Missing),
            1 => Ok(Existing::Found(namesakes.remove(0))),
            n => {
                let ids = namesakes.iter().map(|p| p.id).collect::<Vec<_>>();
                warn!(legacy_id, name = %incoming.name, candidates = n, "several persons share this name");
                ledger.record(StatsScope::Global, EntityKind::Person, Outcome::Ambiguous);
                ledger.ambiguities.push(AmbiguityReviewItem {
                    scope: StatsScope::Global,
                    entity: EntityKind::Person,
                    context: format!("legacy person #{legacy_id} left unreconciled"),
                    raw_name: incoming.name.clone(),
                    chosen_id: ids[0],
                    candidate_ids: ids,
                    confidence: 1.0 / n as f64,
                });
                Ok(Existing::Ambiguous)
            }
        }
    }

    async fn import_person_detail(
        &self,
        person_id: EntityId,
        row: &LegacyPersonRow,
        ledger: &mut RunLedger,
    ) -> Result<(), MigrationError> {
        let incoming = PersonDetail {
            person_id,
            address: row.address.clone(),
            first_certified: row.first_certified,
            last_certified: row.last_certified,
            tax_code: row.tax_code.clone(),
        };
        if incoming.is_empty() {
            return Ok(());
        }

        let scope = StatsScope::Global;
        match self.store.person_detail(person_id).await? {
            Some(existing) => {
                let store = self.store;
                self.merge(existing, &incoming, scope, ledger, |detail| async move {
                    store.upsert_person_detail(&detail).await?;
                    Ok::<_, MigrationError>(detail)
                })
                .await?;
            }
            None => {
                self.store.upsert_person_detail(&incoming).await?;
                ledger.record(scope, EntityKind::PersonDetail, Outcome::Created);
            }
        }
        Ok(())
    }

    pub async fn import_organization(
        &self,
        row: &LegacyClubRow,
        mapper: &mut ReferenceMapper,
        ledger: &mut RunLedger,
    ) -> Result<Option<EntityId>, MigrationError> {
        let scope = StatsScope::Global;
        let Some(name) = row.name.clone() else {
            debug!(legacy_id = row.legacy_id, "club row without a name");
            ledger.record(scope, EntityKind::Organization, Outcome::Skipped);
            return Ok(None);
        };
        let incoming = Organization {
            id: 0,
            name,
            code: row
                .code
                .clone()
                .unwrap_or_else(|| format!("LEG-{}", row.legacy_id)),
            address: row.address.clone(),
            city: row.city.clone(),
            zone_id: row
                .zone_code
                .as_deref()
                .and_then(|code| mapper.find_zone(code))
                .map(|lookup| lookup.id),
            is_placeholder: false,
        };

        // A coded row is identified by its code alone; a namesake with another
        // code is a different club and gets a suffixed name on insert.
        let existing = match row.code.as_deref() {
            Some(code) => self
                .store
                .find_organization_by_code(code)
                .await?
                .filter(|o| !o.is_placeholder),
            None => mapper.organization_by_name(&incoming.name).cloned(),
        };

        let stored = match existing {
            Some(existing) => {
                let store = self.store;
                self.merge(existing, &incoming, scope, ledger, |club| async move {
                    store.update_organization(&club).await?;
                    Ok::<_, MigrationError>(club)
                })
                .await?
            }
            None => {
                let stored = insert_organization_unique(self.store, &incoming).await?;
                ledger.record(scope, EntityKind::Organization, Outcome::Created);
                stored
            }
        };
        let id = stored.id;
        mapper.register_organization(stored);
        Ok(Some(id))
    }

    pub async fn import_event(
        &self,
        row: &RawEventRow,
        mapper: &mut ReferenceMapper,
        pool: &CandidatePool,
        ledger: &mut RunLedger,
    ) -> Result<Option<EntityId>, MigrationError> {
        let scope = StatsScope::Year(row.year);
        if self.rules.is_skip_sentinel(row.category_code.as_deref()) {
            debug!(year = row.year, legacy_id = row.legacy_id, "tournament skipped by category");
            ledger.record(scope, EntityKind::Event, Outcome::Skipped);
            return Ok(None);
        }
        let Some(name) = row.name.clone() else {
            debug!(year = row.year, legacy_id = row.legacy_id, "tournament row without a name");
            ledger.record(scope, EntityKind::Event, Outcome::Skipped);
            return Ok(None);
        };

        let zone_id = mapper
            .resolve_zone(row.zone_code.as_deref())
            .map(|lookup| lookup.id);
        let category_id = mapper
            .resolve_category(row.category_code.as_deref())
            .map(|lookup| lookup.id);
        let organization = mapper
            .resolve_organization(self.store, row.club_ref.as_deref(), zone_id)
            .await?;
        let legacy = LegacyKey {
            year: row.year,
            row_id: row.legacy_id,
        };
        let status = match row.end_date.or(row.start_date) {
            Some(end) if end < self.today => EventStatus::Completed,
            _ => EventStatus::Scheduled,
        };
        let incoming = Event {
            id: 0,
            name,
            start_date: row.start_date,
            end_date: row.end_date,
            organization_id: Some(organization.id),
            zone_id,
            category_id,
            status,
            legacy: Some(legacy),
        };

        let existing = match self.store.find_event_by_legacy(legacy).await? {
            Some(event) => Some(event),
            None => self.find_unlinked_event(&incoming, scope, ledger).await?,
        };
        let event_id = match existing {
            Some(existing) => {
                let store = self.store;
                self.merge(existing, &incoming, scope, ledger, |event| async move {
                    store.update_event(&event).await?;
                    Ok::<_, MigrationError>(event)
                })
                .await?
                .id
            }
            None => {
                let id = self.store.insert_event(&incoming).await?;
                debug!(year = row.year, legacy_id = row.legacy_id, id, "tournament created");
                ledger.record(scope, EntityKind::Event, Outcome::Created);
                id
            }
        };

        self.link_people(event_id, row, mapper, pool, ledger).await?;
        Ok(Some(event_id))
    }

    /// Tournaments entered directly in the new system carry no legacy key;
    /// they are matched by name within the same year.
    async fn find_unlinked_event(
        &self,
        incoming: &Event,
        scope: StatsScope,
        ledger: &mut RunLedger,
    ) -> Result<Option<Event>, MigrationError> {
        let Some(year) = incoming.legacy.map(|key| key.year) else {
            return Ok(None);
        };
        let mut unlinked = self
            .store
            .find_events_by_name(&incoming.name, year)
            .await?
            .into_iter()
            .filter(|event| event.legacy.is_none())
            .collect::<Vec<_>>();
        unlinked.sort_by_key(|event| creation_order(event.id));
        if unlinked.len() > 1 {
            let ids = unlinked.iter().map(|event| event.id).collect::<Vec<_>>();
            ledger.record(scope, EntityKind::Event, Outcome::Ambiguous);
            ledger.ambiguities.push(AmbiguityReviewItem {
                scope,
                entity: EntityKind::Event,
                context: format!("tournament {}", incoming.label()),
                raw_name: incoming.name.clone(),
                chosen_id: ids[0],
                confidence: 1.0 / ids.len() as f64,
                candidate_ids: ids,
            });
        }
        Ok(unlinked.into_iter().next())
    }

    async fn link_people(
        &self,
        event_id: EntityId,
        row: &RawEventRow,
        mapper: &ReferenceMapper,
        pool: &CandidatePool,
        ledger: &mut RunLedger,
    ) -> Result<(), MigrationError> {
        let scope = StatsScope::Year(row.year);
        let names = match row.schema {
            SchemaVersion::SurnameEra => NameScope::SurnameEra {
                row_in_designated_zone: self.rules.is_designated_zone(row.zone_code.as_deref()),
                designated_zone: mapper
                    .zone_by_code(&self.rules.designated_zone_code)
                    .map(|zone| zone.id),
            },
            SchemaVersion::FullNameEra => NameScope::Open,
        };
        let context = format!("{} {}/{}", row.name.as_deref().unwrap_or("?"), row.year, row.legacy_id);

        for (role, raw_names) in [
            (Role::Director, &row.directors),
            (Role::Referee, &row.referees),
            (Role::Observer, &row.observers),
        ] {
            for raw in raw_names {
                let Some(person_id) =
                    resolve_person(raw, pool, names, scope, EntityKind::Assignment, &context, ledger)
                else {
                    continue;
                };
                let assignment = RoleAssignment {
                    event_id,
                    person_id,
                    role,
                };
                let outcome = if self.store.insert_assignment(&assignment).await? {
                    Outcome::Created
                } else {
                    Outcome::Matched
                };
                ledger.record(scope, EntityKind::Assignment, outcome);
            }
        }

        for raw in &row.available {
            let Some(person_id) =
                resolve_person(raw, pool, names, scope, EntityKind::Availability, &context, ledger)
            else {
                continue;
            };
            let availability = Availability {
                event_id,
                person_id,
                note: None,
            };
            let outcome = if self.store.insert_availability(&availability).await? {
                Outcome::Created
            } else {
                Outcome::Matched
            };
            ledger.record(scope, EntityKind::Availability, outcome);
        }
        Ok(())
    }
}

fn resolve_person(
    raw: &str,
    pool: &CandidatePool,
    names: NameScope,
    scope: StatsScope,
    entity: EntityKind,
    context: &str,
    ledger: &mut RunLedger,
) -> Option<EntityId> {
    match pool.resolve_in(raw, names) {
        Resolution::Match { id, strategy } => {
            debug!(raw, id, ?strategy, "name resolved");
            Some(id)
        }
        Resolution::Ambiguous {
            chosen,
            candidates,
            confidence,
            strategy,
        } => {
            warn!(raw, chosen, candidates = candidates.len(), ?strategy, "ambiguous name, low-confidence pick");
            ledger.record(scope, entity, Outcome::Ambiguous);
            ledger.ambiguities.push(AmbiguityReviewItem {
                scope,
                entity,
                context: context.to_string(),
                raw_name: raw.to_string(),
                chosen_id: chosen,
                candidate_ids: candidates,
                confidence,
            });
            Some(chosen)
        }
        Resolution::NoMatch => {
            debug!(raw, %scope, "name not found, skipped");
            ledger.record(scope, entity, Outcome::Skipped);
            None
        }
    }
}
