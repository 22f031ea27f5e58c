//! Field-by-field comparison of an existing canonical record with the
//! incoming legacy version, and collision-safe creation of organizations.

use std::collections::BTreeMap;

use clubsync_core::{
    normalize_name, ConflictReport, EntityId, EntityKind, Event, FieldConflict, MigrationError,
    Organization, Person, PersonDetail, StatsScope,
};
use clubsync_storage::{CanonicalStore, StoreError};
use tracing::warn;
use uuid::Uuid;

pub const MAX_SUFFIX_ATTEMPTS: u32 = 10;

/// A record the reconciler can compare and fill.
pub trait Reconcilable {
    fn kind() -> EntityKind;
    fn id(&self) -> EntityId;
    fn label(&self) -> String;
    /// Comparable fields rendered as text; `None` when the field is empty.
    fn fields(&self) -> Vec<(&'static str, Option<String>)>;
    /// Copies `field` from `incoming`.
    fn fill(&mut self, field: &str, incoming: &Self);

    fn same_value(&self, _field: &str, existing: &str, incoming: &str) -> bool {
        existing.trim() == incoming.trim()
    }
}

fn render<T: ToString>(value: &Option<T>) -> Option<String> {
    value
        .as_ref()
        .map(ToString::to_string)
        .filter(|v| !v.trim().is_empty())
}

impl Reconcilable for Person {
    fn kind() -> EntityKind {
        EntityKind::Person
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn label(&self) -> String {
        self.name.clone()
    }

    fn fields(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("name", Some(self.name.clone())),
            ("email", render(&self.email)),
            ("phone", render(&self.phone)),
            ("city", render(&self.city)),
            ("level", self.level.map(|l| l.as_str().to_string())),
            ("zone_id", render(&self.zone_id)),
            ("code", render(&self.code)),
        ]
    }

    fn fill(&mut self, field: &str, incoming: &Self) {
        match field {
            "name" => self.name = incoming.name.clone(),
            "email" => self.email = incoming.email.clone(),
            "phone" => self.phone = incoming.phone.clone(),
            "city" => self.city = incoming.city.clone(),
            "level" => self.level = incoming.level,
            "zone_id" => self.zone_id = incoming.zone_id,
            "code" => self.code = incoming.code.clone(),
            _ => {}
        }
    }

    fn same_value(&self, field: &str, existing: &str, incoming: &str) -> bool {
        match field {
            "name" => normalize_name(existing) == normalize_name(incoming),
            "email" => existing.trim().eq_ignore_ascii_case(incoming.trim()),
            _ => existing.trim() == incoming.trim(),
        }
    }
}

impl Reconcilable for PersonDetail {
    fn kind() -> EntityKind {
        EntityKind::PersonDetail
    }

    fn id(&self) -> EntityId {
        self.person_id
    }

    fn label(&self) -> String {
        format!("details of person #{}", self.person_id)
    }

    fn fields(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("address", render(&self.address)),
            ("first_certified", render(&self.first_certified)),
            ("last_certified", render(&self.last_certified)),
            ("tax_code", render(&self.tax_code)),
        ]
    }

    fn fill(&mut self, field: &str, incoming: &Self) {
        match field {
            "address" => self.address = incoming.address.clone(),
            "first_certified" => self.first_certified = incoming.first_certified,
            "last_certified" => self.last_certified = incoming.last_certified,
            "tax_code" => self.tax_code = incoming.tax_code.clone(),
            _ => {}
        }
    }
}

impl Reconcilable for Organization {
    fn kind() -> EntityKind {
        EntityKind::Organization
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn label(&self) -> String {
        format!("{} [{}]", self.name, self.code)
    }

    fn fields(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("name", Some(self.name.clone())),
            ("code", Some(self.code.clone())),
            ("address", render(&self.address)),
            ("city", render(&self.city)),
            ("zone_id", render(&self.zone_id)),
        ]
    }

    fn fill(&mut self, field: &str, incoming: &Self) {
        match field {
            "address" => self.address = incoming.address.clone(),
            "city" => self.city = incoming.city.clone(),
            "zone_id" => self.zone_id = incoming.zone_id,
            _ => {}
        }
    }

    fn same_value(&self, field: &str, existing: &str, incoming: &str) -> bool {
        match field {
            "name" => {
                let (existing, incoming) = (normalize_name(existing), normalize_name(incoming));
                existing == incoming
                    || collision_suffix(&existing, &incoming, " (")
                        .and_then(|rest| rest.strip_suffix(')'))
                        .is_some_and(is_generated_suffix)
            }
            "code" => {
                let (existing, incoming) = (existing.trim(), incoming.trim());
                existing.eq_ignore_ascii_case(incoming)
                    || collision_suffix(existing, incoming, "-").is_some_and(is_generated_suffix)
            }
            _ => existing.trim() == incoming.trim(),
        }
    }
}

/// What follows `base` and `separator` in `value`, compared ASCII
/// case-insensitively.
fn collision_suffix<'a>(value: &'a str, base: &str, separator: &str) -> Option<&'a str> {
    let head = value.get(..base.len())?;
    if !head.eq_ignore_ascii_case(base) {
        return None;
    }
    value.get(base.len()..)?.strip_prefix(separator)
}

/// Counters and random suffixes appended by `insert_organization_unique`.
fn is_generated_suffix(rest: &str) -> bool {
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_hexdigit())
}

impl Reconcilable for Event {
    fn kind() -> EntityKind {
        EntityKind::Event
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn label(&self) -> String {
        match self.legacy {
            Some(key) => format!("{} (legacy {}/{})", self.name, key.year, key.row_id),
            None => self.name.clone(),
        }
    }

    fn fields(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("name", Some(self.name.clone())),
            ("start_date", render(&self.start_date)),
            ("end_date", render(&self.end_date)),
            ("organization_id", render(&self.organization_id)),
            ("zone_id", render(&self.zone_id)),
            ("category_id", render(&self.category_id)),
            (
                "legacy_key",
                self.legacy.map(|k| format!("{}/{}", k.year, k.row_id)),
            ),
        ]
    }

    fn fill(&mut self, field: &str, incoming: &Self) {
        match field {
            "start_date" => self.start_date = incoming.start_date,
            "end_date" => self.end_date = incoming.end_date,
            "organization_id" => self.organization_id = incoming.organization_id,
            "zone_id" => self.zone_id = incoming.zone_id,
            "category_id" => self.category_id = incoming.category_id,
            "legacy_key" => self.legacy = incoming.legacy,
            _ => {}
        }
    }

    fn same_value(&self, field: &str, existing: &str, incoming: &str) -> bool {
        match field {
            "name" => normalize_name(existing) == normalize_name(incoming),
            _ => existing.trim() == incoming.trim(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Fields that are empty on the existing record, with the value to fill.
    pub applied: BTreeMap<&'static str, String>,
    pub conflicts: Vec<FieldConflict>,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && self.conflicts.is_empty()
    }

    pub fn into_report<T: Reconcilable>(self, existing: &T, scope: StatsScope) -> Option<ConflictReport> {
        if self.conflicts.is_empty() {
            return None;
        }
        Some(ConflictReport {
            entity: T::kind(),
            canonical_id: existing.id(),
            label: existing.label(),
            scope,
            conflicts: self.conflicts,
        })
    }
}

/// Classifies every field as equal, fillable or conflicting. Nothing is written.
pub fn reconcile<T: Reconcilable>(existing: &T, incoming: &T) -> Reconciliation {
    let mut result = Reconciliation::default();
    let current = existing.fields();
    for (field, incoming_value) in incoming.fields() {
        let Some(incoming_value) = incoming_value else {
            continue;
        };
        let existing_value = current
            .iter()
            .find(|(name, _)| *name == field)
            .and_then(|(_, value)| value.clone());
        match existing_value {
            None => {
                result.applied.insert(field, incoming_value);
            }
            Some(existing_value) if !existing.same_value(field, &existing_value, &incoming_value) => {
                result.conflicts.push(FieldConflict {
                    field: field.to_string(),
                    existing: existing_value,
                    incoming: incoming_value,
                });
            }
            Some(_) => {}
        }
    }
    result
}

/// Fills the fillable fields of `existing` from `incoming`; returns whether anything changed.
pub fn apply_fillable<T: Reconcilable>(
    existing: &mut T,
    incoming: &T,
    reconciliation: &Reconciliation,
) -> bool {
    for field in reconciliation.applied.keys() {
        existing.fill(field, incoming);
    }
    !reconciliation.applied.is_empty()
}

pub fn suffixed_name(base: &str, attempt: u32) -> String {
    format!("{base} ({attempt})")
}

pub fn suffixed_code(base: &str, attempt: u32) -> String {
    format!("{base}-{attempt}")
}

fn random_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Inserts `organization`, renaming on name or code collisions: `" (n)"` for
/// names and `-n` for codes, n = 2.., then a random suffix. Returns the
/// stored record.
pub async fn insert_organization_unique(
    store: &dyn CanonicalStore,
    organization: &Organization,
) -> Result<Organization, MigrationError> {
    let mut candidate = organization.clone();
    let mut name_attempt = 1;
    let mut code_attempt = 1;
    let mut name_randomized = false;
    let mut code_randomized = false;

    loop {
        match store.insert_organization(&candidate).await {
            Ok(id) => {
                candidate.id = id;
                if candidate.name != organization.name || candidate.code != organization.code {
                    warn!(
                        original_name = %organization.name,
                        original_code = %organization.code,
                        name = %candidate.name,
                        code = %candidate.code,
                        "organization renamed to avoid a uniqueness collision"
                    );
                }
                return Ok(candidate);
            }
            Err(StoreError::UniqueViolation { column, value, .. }) => {
                let exhausted = match column {
                    "code" => code_attempt > MAX_SUFFIX_ATTEMPTS,
                    _ => name_attempt > MAX_SUFFIX_ATTEMPTS,
                };
                if exhausted {
                    let randomized = match column {
                        "code" => &mut code_randomized,
                        _ => &mut name_randomized,
                    };
                    if *randomized {
                        return Err(MigrationError::UniquenessCollision {
                            entity: EntityKind::Organization,
                            column,
                            value,
                        });
                    }
                    *randomized = true;
                    let suffix = random_suffix();
                    match column {
                        "code" => candidate.code = format!("{}-{suffix}", organization.code),
                        _ => candidate.name = format!("{} ({suffix})", organization.name),
                    }
                    continue;
                }
                match column {
                    "code" => {
                        code_attempt += 1;
                        candidate.code = suffixed_code(&organization.code, code_attempt);
                    }
                    _ => {
                        name_attempt += 1;
                        candidate.name = suffixed_name(&organization.name, name_attempt);
                    }
                }
            }
            Err(other) => return Err(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use clubsync_core::Level;
    use clubsync_storage::InMemoryStore;

    fn person(email: Option<&str>, city: Option<&str>) -> Person {
        Person {
            id: 1,
            name: "Mario Rossi".to_string(),
            email: email.map(str::to_string),
            phone: None,
            city: city.map(str::to_string),
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

    #[test]
    fn empty_fields_fill_and_populated_ones_conflict() {
        let existing = person(Some("mario@example.org"), None);
        let mut incoming = person(Some("m.rossi@example.org"), Some("Roma"));
        incoming.level = Some(Level::National);

        let result = reconcile(&existing, &incoming);
        assert_eq!(result.applied.get("city").map(String::as_str), Some("Roma"));
        assert_eq!(result.applied.get("level").map(String::as_str), Some("national"));
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].field, "email");
        assert_eq!(result.conflicts[0].existing, "mario@example.org");
    }

    #[test]
    fn populated_fields_are_never_overwritten() {
        let mut existing = person(Some("mario@example.org"), Some("Milano"));
        let incoming = person(Some("mario@example.org"), Some("Roma"));
        let result = reconcile(&existing, &incoming);
        assert!(!apply_fillable(&mut existing, &incoming, &result));
        assert_eq!(existing.city.as_deref(), Some("Milano"));
        let report = result
            .into_report(&existing, StatsScope::Global)
            .expect("conflict reported");
        assert_eq!(report.entity, EntityKind::Person);
        assert_eq!(report.conflicts[0].incoming, "Roma");
    }

    #[test]
    fn second_pass_is_a_noop() {
        let mut existing = person(None, None);
        let incoming = person(Some("mario@example.org"), Some("Roma"));
        let first = reconcile(&existing, &incoming);
        assert!(apply_fillable(&mut existing, &incoming, &first));
        assert!(reconcile(&existing, &incoming).is_noop());
    }

    #[test]
    fn trimming_and_name_case_are_not_conflicts() {
        let existing = person(Some("Mario@Example.org"), Some("Roma "));
        let mut incoming = person(Some("mario@example.org"), Some(" Roma"));
        incoming.name = "mario  rossi".to_string();
        assert!(reconcile(&existing, &incoming).is_noop());
    }

    #[test]
    fn details_fill_dates() {
        let existing = PersonDetail {
            person_id: 4,
            tax_code: Some("RSSMRA80A01H501U".into()),
            ..PersonDetail::default()
        };
        let incoming = PersonDetail {
            person_id: 4,
            first_certified: NaiveDate::from_ymd_opt(2010, 3, 1),
            tax_code: Some("RSSMRA80A01H501U".into()),
            ..PersonDetail::default()
        };
        let result = reconcile(&existing, &incoming);
        assert_eq!(result.applied.keys().copied().collect::<Vec<_>>(), vec!["first_certified"]);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn suffix_formats() {
        assert_eq!(suffixed_name("Golf Club Roma", 2), "Golf Club Roma (2)");
        assert_eq!(suffixed_code("GCR", 3), "GCR-3");
    }

    #[tokio::test]
    async fn colliding_organizations_get_deterministic_suffixes() {
        let store = InMemoryStore::new();
        let first = insert_organization_unique(&store, &club("Golf Club Roma", "GCR"))
            .await
            .expect("first");
        let second = insert_organization_unique(&store, &club("Golf Club Roma", "GCR"))
            .await
            .expect("second");
        let third = insert_organization_unique(&store, &club("golf club roma", "OTHER"))
            .await
            .expect("third");

        assert_eq!(first.name, "Golf Club Roma");
        assert_eq!(second.name, "Golf Club Roma (2)");
        assert_eq!(second.code, "GCR-2");
        assert_eq!(third.name, "golf club roma (3)");
        assert_eq!(third.code, "OTHER");
    }

    #[tokio::test]
    async fn exhausted_suffixes_fall_back_to_random_ones() {
        let store = InMemoryStore::new();
        insert_organization_unique(&store, &club("Circolo", "C"))
            .await
            .expect("base");
        for n in 2..=(MAX_SUFFIX_ATTEMPTS + 1) {
            insert_organization_unique(&store, &club(&suffixed_name("Circolo", n), &format!("X{n}")))
                .await
                .expect("suffixed");
        }
        let stored = insert_organization_unique(&store, &club("Circolo", "Y"))
            .await
            .expect("random");
        assert!(stored.name.starts_with("Circolo ("));
        let suffix = stored
            .name
            .trim_start_matches("Circolo (")
            .trim_end_matches(')');
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn name_and_code_each_get_their_own_random_fallback() {
        let store = InMemoryStore::new();
        store.insert_organization(&club("Club", "N1")).await.expect("base name");
        store.insert_organization(&club("K1", "C")).await.expect("base code");
        for n in 2..=(MAX_SUFFIX_ATTEMPTS + 1) {
            store
                .insert_organization(&club(&suffixed_name("Club", n), &format!("N{n}")))
                .await
                .expect("suffixed name");
            store
                .insert_organization(&club(&format!("K{n}"), &suffixed_code("C", n)))
                .await
                .expect("suffixed code");
        }

        let stored = insert_organization_unique(&store, &club("Club", "C"))
            .await
            .expect("both columns randomized");
        let name_suffix = stored
            .name
            .strip_prefix("Club (")
            .and_then(|rest| rest.strip_suffix(')'))
            .expect("random name suffix");
        let code_suffix = stored.code.strip_prefix("C-").expect("random code suffix");
        assert_eq!(name_suffix.len(), 8);
        assert_eq!(code_suffix.len(), 8);
    }

    #[test]
    fn collision_renames_are_not_conflicts() {
        let renamed = Organization {
            id: 7,
            ..club("Golf Club (2)", "GC-2")
        };
        assert!(reconcile(&renamed, &club("golf  club", "gc")).is_noop());

        let random = club("Golf Club (3fa9c01b)", "GC");
        assert!(reconcile(&random, &club("Golf Club", "GC")).is_noop());

        let other = club("Golf Club (Roma)", "GCR");
        let result = reconcile(&other, &club("Golf Club", "GC"));
        let fields = result.conflicts.iter().map(|c| c.field.as_str()).collect::<Vec<_>>();
        assert_eq!(fields, vec!["name", "code"]);
    }
}
