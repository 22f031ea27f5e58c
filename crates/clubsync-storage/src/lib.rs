//! Canonical target store: the trait every importer writes through, plus the
//! in-memory, dry-run and Postgres implementations and report artifact storage.

use async_trait::async_trait;
use clubsync_core::{
    Availability, Category, EntityId, EntityKind, Event, LegacyKey, MigrationError, Organization,
    Person, PersonDetail, RoleAssignment, Zone,
};
use thiserror::Error;

mod artifacts;
mod dry_run;
mod memory;
mod postgres;

pub use artifacts::{ArtifactStore, StoredArtifact};
pub use dry_run::DryRunStore;
pub use memory::InMemoryStore;
pub use postgres::PgCanonicalStore;

pub const CRATE_NAME: &str = "clubsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated on {entity}.{column} ({value:?})")]
    UniqueViolation {
        entity: EntityKind,
        column: &'static str,
        value: String,
    },
    #[error("{entity} #{id} not found")]
    NotFound { entity: EntityKind, id: EntityId },
    #[error("corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl From<StoreError> for MigrationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UniqueViolation {
                entity,
                column,
                value,
            } => MigrationError::UniquenessCollision {
                entity,
                column,
                value,
            },
            other => MigrationError::WriteFailure(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read/write access to the canonical model. Inserts ignore the `id` of the
/// value passed in and return the id the store assigned.
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    async fn zones(&self) -> StoreResult<Vec<Zone>>;
    async fn insert_zone(&self, code: &str, name: &str) -> StoreResult<Zone>;
    async fn categories(&self) -> StoreResult<Vec<Category>>;
    async fn insert_category(&self, code: &str, name: &str) -> StoreResult<Category>;

    async fn persons(&self) -> StoreResult<Vec<Person>>;
    async fn find_person_by_email(&self, email: &str) -> StoreResult<Option<Person>>;
    /// Case-insensitive, whitespace-normalized full-name lookup, ascending id.
    async fn find_persons_by_name(&self, name: &str) -> StoreResult<Vec<Person>>;
    async fn insert_person(&self, person: &Person) -> StoreResult<EntityId>;
    async fn update_person(&self, person: &Person) -> StoreResult<()>;
    async fn person_detail(&self, person_id: EntityId) -> StoreResult<Option<PersonDetail>>;
    async fn upsert_person_detail(&self, detail: &PersonDetail) -> StoreResult<()>;

    async fn organizations(&self) -> StoreResult<Vec<Organization>>;
    async fn find_organization_by_code(&self, code: &str) -> StoreResult<Option<Organization>>;
    async fn insert_organization(&self, organization: &Organization) -> StoreResult<EntityId>;
    async fn update_organization(&self, organization: &Organization) -> StoreResult<()>;

    async fn find_event_by_legacy(&self, key: LegacyKey) -> StoreResult<Option<Event>>;
    /// Events with this normalized name whose legacy year (or start date year) is `year`.
    async fn find_events_by_name(&self, name: &str, year: i32) -> StoreResult<Vec<Event>>;
    async fn insert_event(&self, event: &Event) -> StoreResult<EntityId>;
    async fn update_event(&self, event: &Event) -> StoreResult<()>;

    async fn assignment_exists(&self, assignment: &RoleAssignment) -> StoreResult<bool>;
    /// Returns `false` when the (event, person, role) triple was already present.
    async fn insert_assignment(&self, assignment: &RoleAssignment) -> StoreResult<bool>;
    async fn availability_exists(&self, event_id: EntityId, person_id: EntityId) -> StoreResult<bool>;
    /// Returns `false` when the (event, person) pair was already present.
    async fn insert_availability(&self, availability: &Availability) -> StoreResult<bool>;

    async fn close(&self);
}
