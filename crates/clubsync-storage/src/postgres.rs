use anyhow::Context;
use async_trait::async_trait;
use clubsync_core::{
    normalize_name, Availability, Category, EntityId, EntityKind, Event, EventStatus, LegacyKey,
    Level, Organization, Person, PersonDetail, RoleAssignment, Zone,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::{CanonicalStore, StoreError, StoreResult};

const NORMALIZED_NAME: &str = "lower(regexp_replace(trim(name), '\\s+', ' ', 'g'))";

const PERSON_COLUMNS: &str = "id, name, email, phone, city, level, zone_id, code";
const ORGANIZATION_COLUMNS: &str = "id, name, code, address, city, zone_id, is_placeholder";
const EVENT_COLUMNS: &str = "id, name, start_date, end_date, organization_id, zone_id, category_id, status, legacy_year, legacy_row_id";

/// Canonical store on the club-management Postgres database.
#[derive(Debug, Clone)]
pub struct PgCanonicalStore {
    pool: PgPool,
}

impl PgCanonicalStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .context("connecting to canonical database")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the canonical tables when missing.
    pub async fn apply_schema(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying canonical schema migrations")?;
        info!("canonical schema up to date");
        Ok(())
    }
}

fn unique_violation(
    err: sqlx::Error,
    entity: EntityKind,
    columns: &[(&'static str, &str)],
) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            let constraint = db.constraint().unwrap_or_default();
            for (column, value) in columns {
                if constraint.contains(column) {
                    return StoreError::UniqueViolation {
                        entity,
                        column: *column,
                        value: value.to_string(),
                    };
                }
            }
        }
    }
    StoreError::Database(err)
}

fn map_person(row: &PgRow) -> StoreResult<Person> {
    let level: Option<String> = row.try_get("level")?;
    Ok(Person {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        city: row.try_get("city")?,
        level: level.as_deref().and_then(Level::parse),
        zone_id: row.try_get("zone_id")?,
        code: row.try_get("code")?,
    })
}

fn map_organization(row: &PgRow) -> StoreResult<Organization> {
    Ok(Organization {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        code: row.try_get("code")?,
        address: row.try_get("address")?,
        city: row.try_get("city")?,
        zone_id: row.try_get("zone_id")?,
        is_placeholder: row.try_get("is_placeholder")?,
    })
}

fn map_event(row: &PgRow) -> StoreResult<Event> {
    let status: String = row.try_get("status")?;
    let status = EventStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
        table: "events",
        reason: format!("unknown status {status:?}"),
    })?;
    let legacy_year: Option<i32> = row.try_get("legacy_year")?;
    let legacy_row_id: Option<i64> = row.try_get("legacy_row_id")?;
    Ok(Event {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        organization_id: row.try_get("organization_id")?,
        zone_id: row.try_get("zone_id")?,
        category_id: row.try_get("category_id")?,
        status,
        legacy: legacy_year
            .zip(legacy_row_id)
            .map(|(year, row_id)| LegacyKey { year, row_id }),
    })
}

#[async_trait]
impl CanonicalStore for PgCanonicalStore {
    async fn zones(&self) -> StoreResult<Vec<Zone>> {
        let rows = sqlx::query("SELECT id, code, name FROM zones ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> StoreResult<Zone> {
                Ok(Zone {
                    id: row.try_get("id")?,
                    code: row.try_get("code")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }

    async fn insert_zone(&self, code: &str, name: &str) -> StoreResult<Zone> {
        let id: i64 = sqlx::query_scalar("INSERT INTO zones (code, name) VALUES ($1, $2) RETURNING id")
            .bind(code)
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| unique_violation(err, EntityKind::Zone, &[("code", code)]))?;
        Ok(Zone {
            id,
            code: code.to_string(),
            name: name.to_string(),
        })
    }

    async fn categories(&self) -> StoreResult<Vec<Category>> {
        let rows = sqlx::query("SELECT id, code, name FROM categories ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> StoreResult<Category> {
                Ok(Category {
                    id: row.try_get("id")?,
                    code: row.try_get("code")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }

    async fn insert_category(&self, code: &str, name: &str) -> StoreResult<Category> {
        let id: i64 =
            sqlx::query_scalar("INSERT INTO categories (code, name) VALUES ($1, $2) RETURNING id")
                .bind(code)
                .bind(name)
                .fetch_one(&self.pool)
                .await
                .map_err(|err| unique_violation(err, EntityKind::Category, &[("code", code)]))?;
        Ok(Category {
            id,
            code: code.to_string(),
            name: name.to_string(),
        })
    }

    async fn persons(&self) -> StoreResult<Vec<Person>> {
        let rows = sqlx::query(&format!("SELECT {PERSON_COLUMNS} FROM persons ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_person).collect()
    }

    async fn find_person_by_email(&self, email: &str) -> StoreResult<Option<Person>> {
        let row = sqlx::query(&format!(
            "SELECT {PERSON_COLUMNS} FROM persons WHERE lower(email) = lower($1)"
        ))
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_person).transpose()
    }

    async fn find_persons_by_name(&self, name: &str) -> StoreResult<Vec<Person>> {
        let rows = sqlx::query(&format!(
            "SELECT {PERSON_COLUMNS} FROM persons WHERE {NORMALIZED_NAME} = $1 ORDER BY id"
        ))
        .bind(normalize_name(name))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_person).collect()
    }

    async fn insert_person(&self, person: &Person) -> StoreResult<EntityId> {
        let email = person.email.clone().unwrap_or_default();
        sqlx::query_scalar(
            "INSERT INTO persons (name, email, phone, city, level, zone_id, code)
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
        )
        .bind(&person.name)
        .bind(&person.email)
        .bind(&person.phone)
        .bind(&person.city)
        .bind(person.level.map(|l| l.as_str()))
        .bind(person.zone_id)
        .bind(&person.code)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| unique_violation(err, EntityKind::Person, &[("email", email.as_str())]))
    }

    async fn update_person(&self, person: &Person) -> StoreResult<()> {
        let email = person.email.clone().unwrap_or_default();
        let result = sqlx::query(
            "UPDATE persons SET name = $2, email = $3, phone = $4, city = $5, level = $6,
                    zone_id = $7, code = $8
             WHERE id = $1",
        )
        .bind(person.id)
        .bind(&person.name)
        .bind(&person.email)
        .bind(&person.phone)
        .bind(&person.city)
        .bind(person.level.map(|l| l.as_str()))
        .bind(person.zone_id)
        .bind(&person.code)
        .execute(&self.pool)
        .await
        .map_err(|err| unique_violation(err, EntityKind::Person, &[("email", email.as_str())]))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: EntityKind::Person,
                id: person.id,
            });
        }
        Ok(())
    }

    async fn person_detail(&self, person_id: EntityId) -> StoreResult<Option<PersonDetail>> {
        let row = sqlx::query(
            "SELECT person_id, address, first_certified, last_certified, tax_code
             FROM person_details WHERE person_id = $1",
        )
        .bind(person_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(PersonDetail {
            person_id: row.try_get("person_id")?,
            address: row.try_get("address")?,
            first_certified: row.try_get("first_certified")?,
            last_certified: row.try_get("last_certified")?,
            tax_code: row.try_get("tax_code")?,
        }))
    }

    async fn upsert_person_detail(&self, detail: &PersonDetail) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO person_details (person_id, address, first_certified, last_certified, tax_code)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (person_id) DO UPDATE SET
                address = excluded.address,
                first_certified = excluded.first_certified,
                last_certified = excluded.last_certified,
                tax_code = excluded.tax_code",
        )
        .bind(detail.person_id)
        .bind(&detail.address)
        .bind(detail.first_certified)
        .bind(detail.last_certified)
        .bind(&detail.tax_code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn organizations(&self) -> StoreResult<Vec<Organization>> {
        let rows = sqlx::query(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_organization).collect()
    }

    async fn find_organization_by_code(&self, code: &str) -> StoreResult<Option<Organization>> {
        let row = sqlx::query(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE lower(code) = lower($1)"
        ))
        .bind(code.trim())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_organization).transpose()
    }

    async fn insert_organization(&self, organization: &Organization) -> StoreResult<EntityId> {
        sqlx::query_scalar(
            "INSERT INTO organizations (name, code, address, city, zone_id, is_placeholder)
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(&organization.name)
        .bind(&organization.code)
        .bind(&organization.address)
        .bind(&organization.city)
        .bind(organization.zone_id)
        .bind(organization.is_placeholder)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            unique_violation(
                err,
                EntityKind::Organization,
                &[
                    ("name", organization.name.as_str()),
                    ("code", organization.code.as_str()),
                ],
            )
        })
    }

    async fn update_organization(&self, organization: &Organization) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE organizations SET name = $2, code = $3, address = $4, city = $5, zone_id = $6,
                    is_placeholder = $7
             WHERE id = $1",
        )
        .bind(organization.id)
        .bind(&organization.name)
        .bind(&organization.code)
        .bind(&organization.address)
        .bind(&organization.city)
        .bind(organization.zone_id)
        .bind(organization.is_placeholder)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: EntityKind::Organization,
                id: organization.id,
            });
        }
        Ok(())
    }

    async fn find_event_by_legacy(&self, key: LegacyKey) -> StoreResult<Option<Event>> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE legacy_year = $1 AND legacy_row_id = $2"
        ))
        .bind(key.year)
        .bind(key.row_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_event).transpose()
    }

    async fn find_events_by_name(&self, name: &str, year: i32) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE {NORMALIZED_NAME} = $1
               AND COALESCE(legacy_year, EXTRACT(YEAR FROM start_date)::int) = $2
             ORDER BY id"
        ))
        .bind(normalize_name(name))
        .bind(year)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_event).collect()
    }

    async fn insert_event(&self, event: &Event) -> StoreResult<EntityId> {
        let legacy = event
            .legacy
            .map(|k| format!("{}:{}", k.year, k.row_id))
            .unwrap_or_default();
        sqlx::query_scalar(
            "INSERT INTO events (name, start_date, end_date, organization_id, zone_id, category_id,
                                 status, legacy_year, legacy_row_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING id",
        )
        .bind(&event.name)
        .bind(event.start_date)
        .bind(event.end_date)
        .bind(event.organization_id)
        .bind(event.zone_id)
        .bind(event.category_id)
        .bind(event.status.as_str())
        .bind(event.legacy.map(|k| k.year))
        .bind(event.legacy.map(|k| k.row_id))
        .fetch_one(&self.pool)
        .await
        .map_err(|err| unique_violation(err, EntityKind::Event, &[("legacy", legacy.as_str())]))
    }

    async fn update_event(&self, event: &Event) -> StoreResult<()> {
        let legacy = event
            .legacy
            .map(|k| format!("{}:{}", k.year, k.row_id))
            .unwrap_or_default();
        let result = sqlx::query(
            "UPDATE events SET name = $2, start_date = $3, end_date = $4, organization_id = $5,
                    zone_id = $6, category_id = $7, status = $8,
                    legacy_year = $9, legacy_row_id = $10
             WHERE id = $1",
        )
        .bind(event.id)
        .bind(&event.name)
        .bind(event.start_date)
        .bind(event.end_date)
        .bind(event.organization_id)
        .bind(event.zone_id)
        .bind(event.category_id)
        .bind(event.status.as_str())
        .bind(event.legacy.map(|k| k.year))
        .bind(event.legacy.map(|k| k.row_id))
        .execute(&self.pool)
        .await
        .map_err(|err| unique_violation(err, EntityKind::Event, &[("legacy", legacy.as_str())]))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: EntityKind::Event,
                id: event.id,
            });
        }
        Ok(())
    }

    async fn assignment_exists(&self, assignment: &RoleAssignment) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM role_assignments
                            WHERE event_id = $1 AND person_id = $2 AND role = $3)",
        )
        .bind(assignment.event_id)
        .bind(assignment.person_id)
        .bind(assignment.role.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_assignment(&self, assignment: &RoleAssignment) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO role_assignments (event_id, person_id, role) VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
        )
        .bind(assignment.event_id)
        .bind(assignment.person_id)
        .bind(assignment.role.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn availability_exists(
        &self,
        event_id: EntityId,
        person_id: EntityId,
    ) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM availabilities WHERE event_id = $1 AND person_id = $2)",
        )
        .bind(event_id)
        .bind(person_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_availability(&self, availability: &Availability) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO availabilities (event_id, person_id, note) VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
        )
        .bind(availability.event_id)
        .bind(availability.person_id)
        .bind(&availability.note)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
