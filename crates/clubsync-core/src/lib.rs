//! Canonical domain model, run statistics and error taxonomy for clubsync.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "clubsync-core";

pub type EntityId = i64;

/// Sort key that keeps rows in creation order across real ids and the
/// negative ids a dry run hands out after them.
pub fn creation_order(id: EntityId) -> (bool, EntityId) {
    (id < 0, id.abs())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: EntityId,
    pub code: String,
    pub name: String,
}

/// Tournament type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: EntityId,
    pub code: String,
    pub name: String,
}

/// Referee proficiency level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    Aspirant,
    FirstLevel,
    Regional,
    National,
    International,
    Archive,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Aspirant => "aspirant",
            Level::FirstLevel => "first_level",
            Level::Regional => "regional",
            Level::National => "national",
            Level::International => "international",
            Level::Archive => "archive",
        }
    }

    /// Accepts both the canonical slugs and the spellings found in the legacy tables.
    pub fn parse(raw: &str) -> Option<Self> {
        let lower = normalize_name(raw);
        let level = match lower.as_str() {
            "aspirant" | "aspirante" | "asp" => Level::Aspirant,
            "first_level" | "1° livello" | "1 livello" | "primo livello" | "1_livello" => {
                Level::FirstLevel
            }
            "regional" | "regionale" | "reg" => Level::Regional,
            "national" | "nazionale" | "naz" => Level::National,
            "international" | "internazionale" | "int" => Level::International,
            "archive" | "archivio" => Level::Archive,
            _ => return None,
        };
        Some(level)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: EntityId,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub level: Option<Level>,
    pub zone_id: Option<EntityId>,
    pub code: Option<String>,
}

/// Profile fields that only some persons carry; at most one per person.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersonDetail {
    pub person_id: EntityId,
    pub address: Option<String>,
    pub first_certified: Option<NaiveDate>,
    pub last_certified: Option<NaiveDate>,
    pub tax_code: Option<String>,
}

impl PersonDetail {
    pub fn is_empty(&self) -> bool {
        self.address.is_none()
            && self.first_certified.is_none()
            && self.last_certified.is_none()
            && self.tax_code.is_none()
    }
}

/// Club.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: EntityId,
    pub name: String,
    pub code: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub zone_id: Option<EntityId>,
    pub is_placeholder: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    Scheduled,
    Completed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Scheduled => "scheduled",
            EventStatus::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "scheduled" => Some(EventStatus::Scheduled),
            "completed" => Some(EventStatus::Completed),
            _ => None,
        }
    }
}

/// Year partition and row id an event was imported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LegacyKey {
    pub year: i32,
    pub row_id: i64,
}

/// Tournament.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EntityId,
    pub name: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub organization_id: Option<EntityId>,
    pub zone_id: Option<EntityId>,
    pub category_id: Option<EntityId>,
    pub status: EventStatus,
    pub legacy: Option<LegacyKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Director,
    Referee,
    Observer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Director => "Director",
            Role::Referee => "Referee",
            Role::Observer => "Observer",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Director" => Some(Role::Director),
            "Referee" => Some(Role::Referee),
            "Observer" => Some(Role::Observer),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique on (event_id, person_id, role).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub event_id: EntityId,
    pub person_id: EntityId,
    pub role: Role,
}

/// Unique on (event_id, person_id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub event_id: EntityId,
    pub person_id: EntityId,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Zone,
    Category,
    Person,
    PersonDetail,
    Organization,
    Event,
    Assignment,
    Availability,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Zone => "zone",
            EntityKind::Category => "category",
            EntityKind::Person => "person",
            EntityKind::PersonDetail => "person_detail",
            EntityKind::Organization => "organization",
            EntityKind::Event => "event",
            EntityKind::Assignment => "assignment",
            EntityKind::Availability => "availability",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    pub existing: String,
    pub incoming: String,
}

/// Per-entity list of fields whose existing and incoming values disagree.
/// Lives only for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub entity: EntityKind,
    pub canonical_id: EntityId,
    pub label: String,
    pub scope: StatsScope,
    pub conflicts: Vec<FieldConflict>,
}

/// A name that matched more than one candidate; the chosen id is a
/// low-confidence pick that needs a human look.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguityReviewItem {
    pub scope: StatsScope,
    /// What the name was being resolved for.
    pub entity: EntityKind,
    pub context: String,
    pub raw_name: String,
    pub chosen_id: EntityId,
    pub candidate_ids: Vec<EntityId>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StatsScope {
    Global,
    Year(i32),
}

impl fmt::Display for StatsScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatsScope::Global => f.write_str("global"),
            StatsScope::Year(year) => write!(f, "{year}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Matched,
    Updated,
    Conflict,
    Skipped,
    Ambiguous,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub created: u64,
    pub matched: u64,
    pub updated: u64,
    pub conflicts: u64,
    pub skipped: u64,
    pub ambiguous: u64,
    pub errors: u64,
}

impl Counters {
    pub fn bump(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Matched => self.matched += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Conflict => self.conflicts += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Ambiguous => self.ambiguous += 1,
            Outcome::Error => self.errors += 1,
        }
    }

    pub fn absorb(&mut self, other: &Counters) {
        self.created += other.created;
        self.matched += other.matched;
        self.updated += other.updated;
        self.conflicts += other.conflicts;
        self.skipped += other.skipped;
        self.ambiguous += other.ambiguous;
        self.errors += other.errors;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsRow {
    pub scope: StatsScope,
    pub entity: EntityKind,
    pub counters: Counters,
}

/// Run-wide counters keyed by scope and entity kind.
#[derive(Debug, Clone, Default)]
pub struct MigrationStats {
    entries: BTreeMap<(StatsScope, EntityKind), Counters>,
}

impl MigrationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn record(&mut self, scope: StatsScope, entity: EntityKind, outcome: Outcome) {
        self.entries.entry((scope, entity)).or_default().bump(outcome);
    }

    pub fn get(&self, scope: StatsScope, entity: EntityKind) -> Counters {
        self.entries.get(&(scope, entity)).copied().unwrap_or_default()
    }

    /// Sum over every scope for one entity kind.
    pub fn entity_total(&self, entity: EntityKind) -> Counters {
        let mut total = Counters::default();
        for ((_, kind), counters) in &self.entries {
            if *kind == entity {
                total.absorb(counters);
            }
        }
        total
    }

    pub fn totals(&self) -> Counters {
        let mut total = Counters::default();
        for counters in self.entries.values() {
            total.absorb(counters);
        }
        total
    }

    pub fn rows(&self) -> Vec<StatsRow> {
        self.entries
            .iter()
            .map(|((scope, entity), counters)| StatsRow {
                scope: *scope,
                entity: *entity,
                counters: *counters,
            })
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("legacy source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("schema mismatch on {table}: missing columns {missing:?}")]
    SchemaMismatch { table: String, missing: Vec<String> },
    #[error("no match found for {0:?}")]
    NoMatchFound(String),
    #[error("ambiguous match for {raw:?} among {candidates} candidates")]
    AmbiguousMatch { raw: String, candidates: usize },
    #[error("field conflict on {entity} #{id}: {field}")]
    FieldConflict {
        entity: EntityKind,
        id: EntityId,
        field: String,
    },
    #[error("uniqueness collision on {entity}.{column} = {value:?}")]
    UniquenessCollision {
        entity: EntityKind,
        column: &'static str,
        value: String,
    },
    #[error("write failure: {0}")]
    WriteFailure(String),
    #[error("invalid stage transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl MigrationError {
    /// Whether the error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrationError::SourceUnavailable(_) | MigrationError::InvalidTransition { .. }
        )
    }
}

/// Lowercases and collapses inner whitespace; the comparison key for names and codes.
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace()
        .map(|token| token.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn non_empty(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}
