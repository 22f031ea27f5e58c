use async_trait::async_trait;
use clubsync_core::{
    normalize_name, Availability, Category, EntityId, EntityKind, Event, LegacyKey, Organization,
    Person, PersonDetail, RoleAssignment, Zone,
};
use tracing::debug;

use crate::{CanonicalStore, InMemoryStore, StoreError, StoreResult};

/// Wraps a real store for preview runs. Reads see the real store plus every
/// record the run would have created; creations land in a simulated shadow
/// store and updates of existing records are dropped. The real store never
/// receives a mutating call.
pub struct DryRunStore<'a> {
    inner: &'a dyn CanonicalStore,
    shadow: InMemoryStore,
}

impl<'a> DryRunStore<'a> {
    pub fn new(inner: &'a dyn CanonicalStore) -> Self {
        Self {
            inner,
            shadow: InMemoryStore::simulated(),
        }
    }

    /// Records the run would have created.
    pub fn shadow(&self) -> &InMemoryStore {
        &self.shadow
    }
}

fn simulated(id: EntityId) -> bool {
    id < 0
}

#[async_trait]
impl CanonicalStore for DryRunStore<'_> {
    async fn zones(&self) -> StoreResult<Vec<Zone>> {
        let mut zones = self.inner.zones().await?;
        zones.extend(self.shadow.zones().await?);
        Ok(zones)
    }

    async fn insert_zone(&self, code: &str, name: &str) -> StoreResult<Zone> {
        self.shadow.insert_zone(code, name).await
    }

    async fn categories(&self) -> StoreResult<Vec<Category>> {
        let mut categories = self.inner.categories().await?;
        categories.extend(self.shadow.categories().await?);
        Ok(categories)
    }

    async fn insert_category(&self, code: &str, name: &str) -> StoreResult<Category> {
        self.shadow.insert_category(code, name).await
    }

    async fn persons(&self) -> StoreResult<Vec<Person>> {
        let mut persons = self.inner.persons().await?;
        persons.extend(self.shadow.persons().await?);
        Ok(persons)
    }

    async fn find_person_by_email(&self, email: &str) -> StoreResult<Option<Person>> {
        match self.inner.find_person_by_email(email).await? {
            Some(person) => Ok(Some(person)),
            None => self.shadow.find_person_by_email(email).await,
        }
    }

    async fn find_persons_by_name(&self, name: &str) -> StoreResult<Vec<Person>> {
        let mut persons = self.inner.find_persons_by_name(name).await?;
        persons.extend(self.shadow.find_persons_by_name(name).await?);
        Ok(persons)
    }

    async fn insert_person(&self, person: &Person) -> StoreResult<EntityId> {
        if let Some(email) = person.email.as_deref() {
            if let Some(existing) = self.inner.find_person_by_email(email).await? {
                return Err(StoreError::UniqueViolation {
                    entity: EntityKind::Person,
                    column: "email",
                    value: existing.email.unwrap_or_default(),
                });
            }
        }
        self.shadow.insert_person(person).await
    }

    async fn update_person(&self, person: &Person) -> StoreResult<()> {
        if simulated(person.id) {
            return self.shadow.update_person(person).await;
        }
        debug!(person_id = person.id, "dry run: suppressed person update");
        Ok(())
    }

    async fn person_detail(&self, person_id: EntityId) -> StoreResult<Option<PersonDetail>> {
        if simulated(person_id) {
            self.shadow.person_detail(person_id).await
        } else {
            self.inner.person_detail(person_id).await
        }
    }

    async fn upsert_person_detail(&self, detail: &PersonDetail) -> StoreResult<()> {
        if simulated(detail.person_id) {
            return self.shadow.upsert_person_detail(detail).await;
        }
        debug!(
            person_id = detail.person_id,
            "dry run: suppressed person detail write"
        );
        Ok(())
    }

    async fn organizations(&self) -> StoreResult<Vec<Organization>> {
        let mut organizations = self.inner.organizations().await?;
        organizations.extend(self.shadow.organizations().await?);
        Ok(organizations)
    }

    async fn find_organization_by_code(&self, code: &str) -> StoreResult<Option<Organization>> {
        match self.inner.find_organization_by_code(code).await? {
            Some(organization) => Ok(Some(organization)),
            None => self.shadow.find_organization_by_code(code).await,
        }
    }

    async fn insert_organization(&self, organization: &Organization) -> StoreResult<EntityId> {
        // Uniqueness must hold against the real rows too, so the simulated
        // renaming matches what a live run would do.
        let existing = self.inner.organizations().await?;
        let name_key = normalize_name(&organization.name);
        if existing
            .iter()
            .any(|o| normalize_name(&o.name) == name_key)
        {
            return Err(StoreError::UniqueViolation {
                entity: EntityKind::Organization,
                column: "name",
                value: organization.name.clone(),
            });
        }
        if existing
            .iter()
            .any(|o| o.code.eq_ignore_ascii_case(&organization.code))
        {
            return Err(StoreError::UniqueViolation {
                entity: EntityKind::Organization,
                column: "code",
                value: organization.code.clone(),
            });
        }
        self.shadow.insert_organization(organization).await
    }

    async fn update_organization(&self, organization: &Organization) -> StoreResult<()> {
        if simulated(organization.id) {
            return self.shadow.update_organization(organization).await;
        }
        debug!(
            organization_id = organization.id,
            "dry run: suppressed organization update"
        );
        Ok(())
    }

    async fn find_event_by_legacy(&self, key: LegacyKey) -> StoreResult<Option<Event>> {
        match self.inner.find_event_by_legacy(key).await? {
            Some(event) => Ok(Some(event)),
            None => self.shadow.find_event_by_legacy(key).await,
        }
    }

    async fn find_events_by_name(&self, name: &str, year: i32) -> StoreResult<Vec<Event>> {
        let mut events = self.inner.find_events_by_name(name, year).await?;
        events.extend(self.shadow.find_events_by_name(name, year).await?);
        Ok(events)
    }

    async fn insert_event(&self, event: &Event) -> StoreResult<EntityId> {
        self.shadow.insert_event(event).await
    }

    async fn update_event(&self, event: &Event) -> StoreResult<()> {
        if simulated(event.id) {
            return self.shadow.update_event(event).await;
        }
        debug!(event_id = event.id, "dry run: suppressed event update");
        Ok(())
    }

    async fn assignment_exists(&self, assignment: &RoleAssignment) -> StoreResult<bool> {
        Ok(self.inner.assignment_exists(assignment).await?
            || self.shadow.assignment_exists(assignment).await?)
    }

    async fn insert_assignment(&self, assignment: &RoleAssignment) -> StoreResult<bool> {
        if self.inner.assignment_exists(assignment).await? {
            return Ok(false);
        }
        self.shadow.insert_assignment(assignment).await
    }

    async fn availability_exists(
        &self,
        event_id: EntityId,
        person_id: EntityId,
    ) -> StoreResult<bool> {
        Ok(self.inner.availability_exists(event_id, person_id).await?
            || self.shadow.availability_exists(event_id, person_id).await?)
    }

    async fn insert_availability(&self, availability: &Availability) -> StoreResult<bool> {
        if self
            .inner
            .availability_exists(availability.event_id, availability.person_id)
            .await?
        {
            return Ok(false);
        }
        self.shadow.insert_availability(availability).await
    }

    /// The wrapped store is borrowed; its owner closes it.
    async fn close(&self) {}
}
