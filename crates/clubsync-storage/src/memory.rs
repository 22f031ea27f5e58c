use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::Datelike;
use clubsync_core::{
    normalize_name, Availability, Category, EntityId, EntityKind, Event, LegacyKey, Organization,
    Person, PersonDetail, RoleAssignment, Zone,
};
use tokio::sync::Mutex;

use crate::{CanonicalStore, StoreError, StoreResult};

#[derive(Debug)]
struct MemoryState {
    next_id: EntityId,
    step: EntityId,
    zones: BTreeMap<EntityId, Zone>,
    categories: BTreeMap<EntityId, Category>,
    persons: BTreeMap<EntityId, Person>,
    details: BTreeMap<EntityId, PersonDetail>,
    organizations: BTreeMap<EntityId, Organization>,
    events: BTreeMap<EntityId, Event>,
    assignments: BTreeSet<(EntityId, EntityId, clubsync_core::Role)>,
    availabilities: BTreeMap<(EntityId, EntityId), Option<String>>,
}

impl MemoryState {
    fn allocate(&mut self) -> EntityId {
        let id = self.next_id;
        self.next_id += self.step;
        id
    }
}

/// Store backed by ordered maps. Used for fixture runs, tests and as the
/// shadow of a dry run (where it hands out negative, simulated ids).
#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::with_ids(1, 1)
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids counting down from -1 so they can never collide with real ones.
    pub fn simulated() -> Self {
        Self::with_ids(-1, -1)
    }

    fn with_ids(first: EntityId, step: EntityId) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next_id: first,
                step,
                zones: BTreeMap::new(),
                categories: BTreeMap::new(),
                persons: BTreeMap::new(),
                details: BTreeMap::new(),
                organizations: BTreeMap::new(),
                events: BTreeMap::new(),
                assignments: BTreeSet::new(),
                availabilities: BTreeMap::new(),
            }),
        }
    }

    pub async fn assignments(&self) -> Vec<RoleAssignment> {
        self.state
            .lock()
            .await
            .assignments
            .iter()
            .map(|(event_id, person_id, role)| RoleAssignment {
                event_id: *event_id,
                person_id: *person_id,
                role: *role,
            })
            .collect()
    }

    pub async fn availabilities(&self) -> Vec<Availability> {
        self.state
            .lock()
            .await
            .availabilities
            .iter()
            .map(|((event_id, person_id), note)| Availability {
                event_id: *event_id,
                person_id: *person_id,
                note: note.clone(),
            })
            .collect()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.state.lock().await.events.values().cloned().collect()
    }

    pub async fn person(&self, id: EntityId) -> Option<Person> {
        self.state.lock().await.persons.get(&id).cloned()
    }
}

fn email_taken(state: &MemoryState, email: Option<&str>, except: Option<EntityId>) -> bool {
    let Some(email) = email else {
        return false;
    };
    state.persons.values().any(|p| {
        Some(p.id) != except
            && p.email
                .as_deref()
                .is_some_and(|existing| existing.eq_ignore_ascii_case(email))
    })
}

fn event_in_year(event: &Event, year: i32) -> bool {
    match (event.legacy, event.start_date) {
        (Some(key), _) => key.year == year,
        (None, Some(start)) => start.year() == year,
        (None, None) => false,
    }
}

#[async_trait]
impl CanonicalStore for InMemoryStore {
    async fn zones(&self) -> StoreResult<Vec<Zone>> {
        Ok(self.state.lock().await.zones.values().cloned().collect())
    }

    async fn insert_zone(&self, code: &str, name: &str) -> StoreResult<Zone> {
        let mut state = self.state.lock().await;
        if state.zones.values().any(|z| z.code.eq_ignore_ascii_case(code)) {
            return Err(StoreError::UniqueViolation {
                entity: EntityKind::Zone,
                column: "code",
                value: code.to_string(),
            });
        }
        let zone = Zone {
            id: state.allocate(),
            code: code.to_string(),
            name: name.to_string(),
        };
        state.zones.insert(zone.id, zone.clone());
        Ok(zone)
    }

    async fn categories(&self) -> StoreResult<Vec<Category>> {
        Ok(self.state.lock().await.categories.values().cloned().collect())
    }

    async fn insert_category(&self, code: &str, name: &str) -> StoreResult<Category> {
        let mut state = self.state.lock().await;
        if state
            .categories
            .values()
            .any(|c| c.code.eq_ignore_ascii_case(code))
        {
            return Err(StoreError::UniqueViolation {
                entity: EntityKind::Category,
                column: "code",
                value: code.to_string(),
            });
        }
        let category = Category {
            id: state.allocate(),
            code: code.to_string(),
            name: name.to_string(),
        };
        state.categories.insert(category.id, category.clone());
        Ok(category)
    }

    async fn persons(&self) -> StoreResult<Vec<Person>> {
        Ok(self.state.lock().await.persons.values().cloned().collect())
    }

    async fn find_person_by_email(&self, email: &str) -> StoreResult<Option<Person>> {
        let state = self.state.lock().await;
        Ok(state
            .persons
            .values()
            .find(|p| {
                p.email
                    .as_deref()
                    .is_some_and(|e| e.eq_ignore_ascii_case(email))
            })
            .cloned())
    }

    async fn find_persons_by_name(&self, name: &str) -> StoreResult<Vec<Person>> {
        let key = normalize_name(name);
        let state = self.state.lock().await;
        Ok(state
            .persons
            .values()
            .filter(|p| normalize_name(&p.name) == key)
            .cloned()
            .collect())
    }

    async fn insert_person(&self, person: &Person) -> StoreResult<EntityId> {
        let mut state = self.state.lock().await;
        if email_taken(&state, person.email.as_deref(), None) {
            return Err(StoreError::UniqueViolation {
                entity: EntityKind::Person,
                column: "email",
                value: person.email.clone().unwrap_or_default(),
            });
        }
        let id = state.allocate();
        state.persons.insert(
            id,
            Person {
                id,
                ..person.clone()
            },
        );
        Ok(id)
    }

    async fn update_person(&self, person: &Person) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.persons.contains_key(&person.id) {
            return Err(StoreError::NotFound {
                entity: EntityKind::Person,
                id: person.id,
            });
        }
        if email_taken(&state, person.email.as_deref(), Some(person.id)) {
            return Err(StoreError::UniqueViolation {
                entity: EntityKind::Person,
                column: "email",
                value: person.email.clone().unwrap_or_default(),
            });
        }
        state.persons.insert(person.id, person.clone());
        Ok(())
    }

    async fn person_detail(&self, person_id: EntityId) -> StoreResult<Option<PersonDetail>> {
        Ok(self.state.lock().await.details.get(&person_id).cloned())
    }

    async fn upsert_person_detail(&self, detail: &PersonDetail) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.details.insert(detail.person_id, detail.clone());
        Ok(())
    }

    async fn organizations(&self) -> StoreResult<Vec<Organization>> {
        Ok(self
            .state
            .lock()
            .await
            .organizations
            .values()
            .cloned()
            .collect())
    }

    async fn find_organization_by_code(&self, code: &str) -> StoreResult<Option<Organization>> {
        let state = self.state.lock().await;
        Ok(state
            .organizations
            .values()
            .find(|o| o.code.eq_ignore_ascii_case(code.trim()))
            .cloned())
    }

    async fn insert_organization(&self, organization: &Organization) -> StoreResult<EntityId> {
        let mut state = self.state.lock().await;
        let name_key = normalize_name(&organization.name);
        if state
            .organizations
            .values()
            .any(|o| normalize_name(&o.name) == name_key)
        {
            return Err(StoreError::UniqueViolation {
                entity: EntityKind::Organization,
                column: "name",
                value: organization.name.clone(),
            });
        }
        if state
            .organizations
            .values()
            .any(|o| o.code.eq_ignore_ascii_case(&organization.code))
        {
            return Err(StoreError::UniqueViolation {
                entity: EntityKind::Organization,
                column: "code",
                value: organization.code.clone(),
            });
        }
        let id = state.allocate();
        state.organizations.insert(
            id,
            Organization {
                id,
                ..organization.clone()
            },
        );
        Ok(id)
    }

    async fn update_organization(&self, organization: &Organization) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.organizations.contains_key(&organization.id) {
            return Err(StoreError::NotFound {
                entity: EntityKind::Organization,
                id: organization.id,
            });
        }
        state
            .organizations
            .insert(organization.id, organization.clone());
        Ok(())
    }

    async fn find_event_by_legacy(&self, key: LegacyKey) -> StoreResult<Option<Event>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .values()
            .find(|e| e.legacy == Some(key))
            .cloned())
    }

    async fn find_events_by_name(&self, name: &str, year: i32) -> StoreResult<Vec<Event>> {
        let key = normalize_name(name);
        let state = self.state.lock().await;
        Ok(state
            .events
            .values()
            .filter(|e| normalize_name(&e.name) == key && event_in_year(e, year))
            .cloned()
            .collect())
    }

    async fn insert_event(&self, event: &Event) -> StoreResult<EntityId> {
        let mut state = self.state.lock().await;
        if let Some(key) = event.legacy {
            if state.events.values().any(|e| e.legacy == Some(key)) {
                return Err(StoreError::UniqueViolation {
                    entity: EntityKind::Event,
                    column: "legacy_key",
                    value: format!("{}:{}", key.year, key.row_id),
                });
            }
        }
        let id = state.allocate();
        state.events.insert(
            id,
            Event {
                id,
                ..event.clone()
            },
        );
        Ok(id)
    }

    async fn update_event(&self, event: &Event) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.events.contains_key(&event.id) {
            return Err(StoreError::NotFound {
                entity: EntityKind::Event,
                id: event.id,
            });
        }
        if let Some(key) = event.legacy {
            if state
                .events
                .values()
                .any(|e| e.id != event.id && e.legacy == Some(key))
            {
                return Err(StoreError::UniqueViolation {
                    entity: EntityKind::Event,
                    column: "legacy_key",
                    value: format!("{}:{}", key.year, key.row_id),
                });
            }
        }
        state.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn assignment_exists(&self, assignment: &RoleAssignment) -> StoreResult<bool> {
        Ok(self.state.lock().await.assignments.contains(&(
            assignment.event_id,
            assignment.person_id,
            assignment.role,
        )))
    }

    async fn insert_assignment(&self, assignment: &RoleAssignment) -> StoreResult<bool> {
        Ok(self.state.lock().await.assignments.insert((
            assignment.event_id,
            assignment.person_id,
            assignment.role,
        )))
    }

    async fn availability_exists(
        &self,
        event_id: EntityId,
        person_id: EntityId,
    ) -> StoreResult<bool> {
        Ok(self
            .state
            .lock()
            .await
            .availabilities
            .contains_key(&(event_id, person_id)))
    }

    async fn insert_availability(&self, availability: &Availability) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let key = (availability.event_id, availability.person_id);
        if state.availabilities.contains_key(&key) {
            return Ok(false);
        }
        state.availabilities.insert(key, availability.note.clone());
        Ok(true)
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use clubsync_core::{EventStatus, Role};

    fn person(name: &str, email: Option<&str>) -> Person {
        Person {
            id: 0,
            name: name.to_string(),
            email: email.map(ToString::to_string),
            phone: None,
            city: None,
            level: None,
            zone_id: None,
            code: None,
        }
    }

    fn club(name: &str, code: &str) -> Organization {
        Organization {
            id: 0,
            name: name.to_string(),
            code: code.to_string(),
            address: None,
            city: None,
            zone_id: None,
            is_placeholder: false,
        }
    }

    #[tokio::test]
    async fn emails_are_unique_case_insensitively() {
        let store = InMemoryStore::new();
        store
            .insert_person(&person("Mario Rossi", Some("mario@example.org")))
            .await
            .expect("first insert");
        let err = store
            .insert_person(&person("M. Rossi", Some("MARIO@example.org")))
            .await
            .expect_err("duplicate email");
        assert!(matches!(
            err,
            StoreError::UniqueViolation { column: "email", .. }
        ));
        // Names are not unique.
        store
            .insert_person(&person("Mario Rossi", None))
            .await
            .expect("same name, no email");
        let found = store
            .find_persons_by_name("  mario   ROSSI")
            .await
            .expect("lookup");
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn organization_name_and_code_collide_separately() {
        let store = InMemoryStore::new();
        store
            .insert_organization(&club("Golf Club Roma", "GCR"))
            .await
            .expect("insert");
        let by_name = store
            .insert_organization(&club("golf club roma", "GCR2"))
            .await
            .expect_err("name collision");
        assert!(matches!(
            by_name,
            StoreError::UniqueViolation { column: "name", .. }
        ));
        let by_code = store
            .insert_organization(&club("Golf Club Roma Nord", "gcr"))
            .await
            .expect_err("code collision");
        assert!(matches!(
            by_code,
            StoreError::UniqueViolation { column: "code", .. }
        ));
    }

    #[tokio::test]
    async fn assignments_insert_once() {
        let store = InMemoryStore::new();
        let assignment = RoleAssignment {
            event_id: 1,
            person_id: 2,
            role: Role::Referee,
        };
        assert!(store.insert_assignment(&assignment).await.expect("insert"));
        assert!(!store.insert_assignment(&assignment).await.expect("again"));
        assert!(store.assignment_exists(&assignment).await.expect("exists"));
        let director = RoleAssignment {
            role: Role::Director,
            ..assignment
        };
        assert!(store.insert_assignment(&director).await.expect("other role"));
    }

    #[tokio::test]
    async fn simulated_store_hands_out_negative_ids() {
        let store = InMemoryStore::simulated();
        let first = store.insert_zone("SZR1", "Zona 1").await.expect("zone");
        let event_id = store
            .insert_event(&Event {
                id: 0,
                name: "Coppa".into(),
                start_date: None,
                end_date: None,
                organization_id: None,
                zone_id: Some(first.id),
                category_id: None,
                status: EventStatus::Completed,
                legacy: Some(LegacyKey {
                    year: 2019,
                    row_id: 4,
                }),
            })
            .await
            .expect("event");
        assert_eq!(first.id, -1);
        assert_eq!(event_id, -2);
        assert_eq!(store.find_events_by_name("coppa", 2019).await.expect("by name").len(), 1);
        assert!(store.find_events_by_name("coppa", 2020).await.expect("by name").is_empty());
    }

    #[tokio::test]
    async fn event_updates_carry_the_legacy_key() {
        let store = InMemoryStore::new();
        let unlinked = Event {
            id: 0,
            name: "Coppa".into(),
            start_date: None,
            end_date: None,
            organization_id: None,
            zone_id: None,
            category_id: None,
            status: EventStatus::Completed,
            legacy: None,
        };
        let id = store.insert_event(&unlinked).await.expect("event");
        let key = LegacyKey {
            year: 2019,
            row_id: 4,
        };
        store
            .update_event(&Event {
                id,
                legacy: Some(key),
                ..unlinked.clone()
            })
            .await
            .expect("link");
        let linked = store
            .find_event_by_legacy(key)
            .await
            .expect("lookup")
            .expect("linked");
        assert_eq!(linked.id, id);

        let other = store.insert_event(&unlinked).await.expect("second event");
        let err = store
            .update_event(&Event {
                id: other,
                legacy: Some(key),
                ..unlinked
            })
            .await
            .expect_err("key already taken");
        assert!(matches!(err, StoreError::UniqueViolation { entity: EntityKind::Event, .. }));
    }
}
