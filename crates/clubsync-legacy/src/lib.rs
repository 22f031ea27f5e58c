//! Legacy source contracts, per-year schema adapters and the free-text
//! name-list parser.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use clubsync_core::{non_empty, MigrationError};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "clubsync-legacy";

pub const PERSONS_TABLE: &str = "arbitri";
pub const CLUBS_TABLE: &str = "circoli";

const PERSON_COLUMNS: &[&str] = &["id", "Nome", "Cognome", "Email", "Livello", "Zona"];
const CLUB_COLUMNS: &[&str] = &["id", "Codice", "Nome", "Zona"];
const SURNAME_ERA_COLUMNS: &[&str] = &[
    "id",
    "Torneo",
    "DataInizio",
    "DataFine",
    "Circolo",
    "Zona",
    "Tipo",
    "TD",
    "Arbitri",
    "Osservatori",
];
const FULL_NAME_ERA_COLUMNS: &[&str] = &[
    "id",
    "Torneo",
    "DataInizio",
    "DataFine",
    "Circolo",
    "Zona",
    "Tipo",
    "TD",
    "Arbitri",
    "Osservatori",
    "Disponibili",
];

#[derive(Debug, Error)]
pub enum LegacyError {
    #[error("legacy source unavailable: {0}")]
    Unavailable(String),
    #[error("table {table} is missing columns {missing:?}")]
    MissingColumns { table: String, missing: Vec<String> },
    #[error("invalid row in {table}: {reason}")]
    InvalidRow { table: String, reason: String },
    #[error("query on {table} failed: {source}")]
    Query {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("unsafe table name {0:?}")]
    UnsafeTableName(String),
}

impl From<LegacyError> for MigrationError {
    fn from(err: LegacyError) -> Self {
        match err {
            LegacyError::Unavailable(reason) => MigrationError::SourceUnavailable(reason),
            LegacyError::MissingColumns { table, missing } => {
                MigrationError::SchemaMismatch { table, missing }
            }
            other => MigrationError::SourceUnavailable(other.to_string()),
        }
    }
}

/// One row of a legacy table, column name to JSON scalar.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyRecord(pub JsonMap<String, JsonValue>);

impl LegacyRecord {
    /// Column lookup with the same case folding as the column checks; an
    /// exact match wins over a case-insensitive one.
    pub fn value(&self, column: &str) -> Option<&JsonValue> {
        self.0.get(column).or_else(|| {
            self.0
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(column))
                .map(|(_, value)| value)
        })
    }

    /// Trimmed textual value; numbers are rendered, null and blank become `None`.
    pub fn text(&self, column: &str) -> Option<String> {
        match self.value(column)? {
            JsonValue::String(s) => non_empty(Some(s.as_str())),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn int(&self, column: &str) -> Option<i64> {
        match self.value(column)? {
            JsonValue::Number(n) => n.as_i64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn date(&self, column: &str) -> Option<NaiveDate> {
        self.text(column).as_deref().and_then(parse_legacy_date)
    }
}

/// Read-only access to the legacy database.
#[async_trait]
pub trait LegacySource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Column names of `table`, or `None` when the table does not exist.
    async fn table_columns(&self, table: &str) -> Result<Option<Vec<String>>, LegacyError>;

    /// Every row of `table`, ascending by `id`.
    async fn fetch_rows(&self, table: &str) -> Result<Vec<LegacyRecord>, LegacyError>;

    async fn close(&self);
}

#[async_trait]
impl<T: LegacySource + ?Sized> LegacySource for Box<T> {
    fn source_id(&self) -> &str {
        (**self).source_id()
    }

    async fn table_columns(&self, table: &str) -> Result<Option<Vec<String>>, LegacyError> {
        (**self).table_columns(table).await
    }

    async fn fetch_rows(&self, table: &str) -> Result<Vec<LegacyRecord>, LegacyError> {
        (**self).fetch_rows(table).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

/// Legacy sources that can drop a yearly tournament table once it has been
/// migrated. Only the staging cleanup uses this; imports stay read-only.
#[async_trait]
pub trait PartitionCleanup: LegacySource {
    /// Returns whether the table existed.
    async fn drop_partition(&mut self, year: i32) -> Result<bool, LegacyError>;
}

/// Column layout of a yearly tournament table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaVersion {
    /// Before the cutoff year: referee columns often carry surnames only and
    /// there is no availability column.
    SurnameEra,
    FullNameEra,
}

impl SchemaVersion {
    pub fn for_year(year: i32, full_name_cutoff: i32) -> Self {
        if year < full_name_cutoff {
            SchemaVersion::SurnameEra
        } else {
            SchemaVersion::FullNameEra
        }
    }

    pub fn required_columns(&self) -> &'static [&'static str] {
        match self {
            SchemaVersion::SurnameEra => SURNAME_ERA_COLUMNS,
            SchemaVersion::FullNameEra => FULL_NAME_ERA_COLUMNS,
        }
    }
}

pub fn partition_table(year: i32) -> String {
    format!("gare_{year}")
}

/// Splits a comma-joined name column into candidate names: trimmed, blank
/// entries dropped, first occurrence kept, order preserved.
pub fn split_name_list(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    let mut seen = BTreeSet::new();
    raw.split([',', ';', '\n', '\r'])
        .map(|part| part.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|part| !part.is_empty())
        .filter(|part| seen.insert(part.to_lowercase()))
        .collect()
}

/// Accepts ISO dates, Italian `dd/mm/yyyy`, and timestamps with a date prefix.
pub fn parse_legacy_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    for format in ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }
    raw.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

/// Year-independent shape every importer consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawEventRow {
    pub year: i32,
    pub legacy_id: i64,
    pub schema: SchemaVersion,
    pub name: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub club_ref: Option<String>,
    pub zone_code: Option<String>,
    pub category_code: Option<String>,
    pub directors: Vec<String>,
    pub referees: Vec<String>,
    pub observers: Vec<String>,
    pub available: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurnameEraRow {
    pub id: i64,
    pub torneo: Option<String>,
    pub data_inizio: Option<NaiveDate>,
    pub data_fine: Option<NaiveDate>,
    pub circolo: Option<String>,
    pub zona: Option<String>,
    pub tipo: Option<String>,
    pub td: Option<String>,
    pub arbitri: Option<String>,
    pub osservatori: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullNameEraRow {
    pub base: SurnameEraRow,
    pub disponibili: Option<String>,
}

/// A yearly row in the layout of its own schema version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyEventRow {
    SurnameEra { year: i32, row: SurnameEraRow },
    FullNameEra { year: i32, row: FullNameEraRow },
}

fn required_id(record: &LegacyRecord, table: &str) -> Result<i64, LegacyError> {
    record.int("id").ok_or_else(|| LegacyError::InvalidRow {
        table: table.to_string(),
        reason: format!("missing or non-numeric id: {:?}", record.value("id")),
    })
}

impl SurnameEraRow {
    pub fn from_record(record: &LegacyRecord, table: &str) -> Result<Self, LegacyError> {
        Ok(Self {
            id: required_id(record, table)?,
            torneo: record.text("Torneo"),
            data_inizio: record.date("DataInizio"),
            data_fine: record.date("DataFine"),
            circolo: record.text("Circolo"),
            zona: record.text("Zona"),
            tipo: record.text("Tipo"),
            td: record.text("TD"),
            arbitri: record.text("Arbitri"),
            osservatori: record.text("Osservatori"),
        })
    }
}

impl FullNameEraRow {
    pub fn from_record(record: &LegacyRecord, table: &str) -> Result<Self, LegacyError> {
        Ok(Self {
            base: SurnameEraRow::from_record(record, table)?,
            disponibili: record.text("Disponibili"),
        })
    }
}

impl LegacyEventRow {
    pub fn from_record(
        year: i32,
        schema: SchemaVersion,
        record: &LegacyRecord,
    ) -> Result<Self, LegacyError> {
        let table = partition_table(year);
        Ok(match schema {
            SchemaVersion::SurnameEra => LegacyEventRow::SurnameEra {
                year,
                row: SurnameEraRow::from_record(record, &table)?,
            },
            SchemaVersion::FullNameEra => LegacyEventRow::FullNameEra {
                year,
                row: FullNameEraRow::from_record(record, &table)?,
            },
        })
    }

    pub fn normalize(self) -> RawEventRow {
        match self {
            LegacyEventRow::SurnameEra { year, row } => {
                base_event_row(year, SchemaVersion::SurnameEra, row, Vec::new())
            }
            LegacyEventRow::FullNameEra { year, row } => {
                let available = split_name_list(row.disponibili.as_deref());
                base_event_row(year, SchemaVersion::FullNameEra, row.base, available)
            }
        }
    }
}

fn base_event_row(
    year: i32,
    schema: SchemaVersion,
    row: SurnameEraRow,
    available: Vec<String>,
) -> RawEventRow {
    // A missing end date means a one-day tournament.
    let end_date = row.data_fine.or(row.data_inizio);
    RawEventRow {
        year,
        legacy_id: row.id,
        schema,
        name: row.torneo,
        start_date: row.data_inizio,
        end_date,
        club_ref: row.circolo,
        zone_code: row.zona,
        category_code: row.tipo,
        directors: split_name_list(row.td.as_deref()),
        referees: split_name_list(row.arbitri.as_deref()),
        observers: split_name_list(row.osservatori.as_deref()),
        available,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegacyPersonRow {
    pub legacy_id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub level: Option<String>,
    pub zone_code: Option<String>,
    pub code: Option<String>,
    pub address: Option<String>,
    pub tax_code: Option<String>,
    pub first_certified: Option<NaiveDate>,
    pub last_certified: Option<NaiveDate>,
}

impl LegacyPersonRow {
    pub fn from_record(record: &LegacyRecord) -> Result<Self, LegacyError> {
        Ok(Self {
            legacy_id: required_id(record, PERSONS_TABLE)?,
            first_name: record.text("Nome"),
            last_name: record.text("Cognome"),
            email: record.text("Email").map(|e| e.to_lowercase()),
            phone: record.text("Telefono"),
            city: record.text("Citta"),
            level: record.text("Livello"),
            zone_code: record.text("Zona"),
            code: record.text("Codice"),
            address: record.text("Indirizzo"),
            tax_code: record.text("CodiceFiscale").map(|c| c.to_uppercase()),
            first_certified: record.date("PrimaNomina"),
            last_certified: record.date("UltimoRinnovo"),
        })
    }

    /// "First Last", the canonical display order.
    pub fn full_name(&self) -> Option<String> {
        let joined = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        non_empty(Some(joined.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegacyClubRow {
    pub legacy_id: i64,
    pub code: Option<String>,
    pub name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub zone_code: Option<String>,
}

impl LegacyClubRow {
    pub fn from_record(record: &LegacyRecord) -> Result<Self, LegacyError> {
        Ok(Self {
            legacy_id: required_id(record, CLUBS_TABLE)?,
            code: record.text("Codice").map(|c| c.to_uppercase()),
            name: record.text("Nome"),
            address: record.text("Indirizzo"),
            city: record.text("Citta"),
            zone_code: record.text("Zona"),
        })
    }
}

/// Rows that adapted cleanly plus the ones that did not.
#[derive(Debug, Default)]
pub struct Adapted<T> {
    pub rows: Vec<T>,
    pub invalid: Vec<LegacyError>,
}

#[derive(Debug)]
pub struct YearPartition {
    pub year: i32,
    pub schema: SchemaVersion,
    pub rows: Vec<RawEventRow>,
    pub invalid: Vec<LegacyError>,
}

fn check_columns(table: &str, present: &[String], required: &[&str]) -> Result<(), LegacyError> {
    let missing = required
        .iter()
        .filter(|column| !present.iter().any(|p| p.eq_ignore_ascii_case(column)))
        .map(|column| column.to_string())
        .collect::<Vec<_>>();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(LegacyError::MissingColumns {
            table: table.to_string(),
            missing,
        })
    }
}

async fn require_table(
    source: &dyn LegacySource,
    table: &str,
    required: &[&str],
) -> Result<(), LegacyError> {
    match source.table_columns(table).await? {
        Some(columns) => check_columns(table, &columns, required),
        None => Err(LegacyError::Unavailable(format!(
            "required legacy table {table} is absent"
        ))),
    }
}

/// Checks the base tables every run needs before anything is imported.
pub async fn verify_source(source: &dyn LegacySource) -> Result<(), LegacyError> {
    require_table(source, PERSONS_TABLE, PERSON_COLUMNS).await?;
    require_table(source, CLUBS_TABLE, CLUB_COLUMNS).await?;
    info!(source = source.source_id(), "legacy source verified");
    Ok(())
}

fn adapt_all<T>(
    records: Vec<LegacyRecord>,
    adapt: impl Fn(&LegacyRecord) -> Result<T, LegacyError>,
    id_of: impl Fn(&T) -> i64,
) -> Adapted<T> {
    let mut adapted = Adapted {
        rows: Vec::new(),
        invalid: Vec::new(),
    };
    for record in &records {
        match adapt(record) {
            Ok(row) => adapted.rows.push(row),
            Err(err) => adapted.invalid.push(err),
        }
    }
    adapted.rows.sort_by_key(|row| id_of(row));
    adapted
}

pub async fn read_persons(source: &dyn LegacySource) -> Result<Adapted<LegacyPersonRow>, LegacyError> {
    let records = source.fetch_rows(PERSONS_TABLE).await?;
    Ok(adapt_all(records, LegacyPersonRow::from_record, |r| r.legacy_id))
}

pub async fn read_clubs(source: &dyn LegacySource) -> Result<Adapted<LegacyClubRow>, LegacyError> {
    let records = source.fetch_rows(CLUBS_TABLE).await?;
    Ok(adapt_all(records, LegacyClubRow::from_record, |r| r.legacy_id))
}

/// Reads one year; `Ok(None)` when that year's table does not exist.
pub async fn read_year(
    source: &dyn LegacySource,
    year: i32,
    full_name_cutoff: i32,
) -> Result<Option<YearPartition>, LegacyError> {
    let table = partition_table(year);
    let Some(columns) = source.table_columns(&table).await? else {
        debug!(year, "legacy partition absent");
        return Ok(None);
    };
    let schema = SchemaVersion::for_year(year, full_name_cutoff);
    check_columns(&table, &columns, schema.required_columns())?;

    let records = source.fetch_rows(&table).await?;
    let adapted = adapt_all(
        records,
        |record| LegacyEventRow::from_record(year, schema, record).map(LegacyEventRow::normalize),
        |row| row.legacy_id,
    );
    Ok(Some(YearPartition {
        year,
        schema,
        rows: adapted.rows,
        invalid: adapted.invalid,
    }))
}

/// A table as stored in a fixture file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureTable {
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<JsonMap<String, JsonValue>>,
}

/// Legacy source read from `<dir>/<table>.json` files.
#[derive(Debug, Clone, Default)]
pub struct FixtureLegacySource {
    tables: BTreeMap<String, FixtureTable>,
}

impl FixtureLegacySource {
    pub fn from_tables(tables: BTreeMap<String, FixtureTable>) -> Self {
        Self { tables }
    }

    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut tables = BTreeMap::new();
        let entries =
            fs::read_dir(dir).with_context(|| format!("reading fixture dir {}", dir.display()))?;
        for entry in entries {
            let path = entry
                .with_context(|| format!("listing {}", dir.display()))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(table) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let parsed: FixtureTable = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            tables.insert(table, parsed);
        }
        Ok(Self { tables })
    }

    pub fn insert_table(&mut self, name: impl Into<String>, table: FixtureTable) {
        self.tables.insert(name.into(), table);
    }
}

#[async_trait]
impl LegacySource for FixtureLegacySource {
    fn source_id(&self) -> &str {
        "fixtures"
    }

    async fn table_columns(&self, table: &str) -> Result<Option<Vec<String>>, LegacyError> {
        Ok(self.tables.get(table).map(|t| t.columns.clone()))
    }

    async fn fetch_rows(&self, table: &str) -> Result<Vec<LegacyRecord>, LegacyError> {
        let Some(fixture) = self.tables.get(table) else {
            return Ok(Vec::new());
        };
        let mut rows = fixture
            .rows
            .iter()
            .cloned()
            .map(LegacyRecord)
            .collect::<Vec<_>>();
        rows.sort_by_key(|r| r.int("id").unwrap_or(i64::MAX));
        Ok(rows)
    }

    async fn close(&self) {}
}

#[async_trait]
impl PartitionCleanup for FixtureLegacySource {
    async fn drop_partition(&mut self, year: i32) -> Result<bool, LegacyError> {
        let dropped = self.tables.remove(&partition_table(year)).is_some();
        debug!(year, dropped, "fixture partition drop");
        Ok(dropped)
    }
}

fn safe_identifier(table: &str) -> Result<&str, LegacyError> {
    if !table.is_empty() && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(table)
    } else {
        Err(LegacyError::UnsafeTableName(table.to_string()))
    }
}

/// Legacy tables living in a Postgres database; rows come back as JSON objects.
#[derive(Debug, Clone)]
pub struct PgLegacySource {
    pool: PgPool,
}

impl PgLegacySource {
    pub async fn connect(database_url: &str) -> Result<Self, LegacyError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .map_err(|err| LegacyError::Unavailable(err.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl LegacySource for PgLegacySource {
    fn source_id(&self) -> &str {
        "postgres"
    }

    async fn table_columns(&self, table: &str) -> Result<Option<Vec<String>>, LegacyError> {
        let rows = sqlx::query(
            "SELECT column_name::text AS column_name FROM information_schema.columns
             WHERE table_schema = current_schema() AND table_name = $1
             ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|source| LegacyError::Query {
            table: table.to_string(),
            source,
        })?;
        if rows.is_empty() {
            return Ok(None);
        }
        rows.iter()
            .map(|row| row.try_get::<String, _>("column_name"))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
            .map_err(|source| LegacyError::Query {
                table: table.to_string(),
                source,
            })
    }

    async fn fetch_rows(&self, table: &str) -> Result<Vec<LegacyRecord>, LegacyError> {
        let table = safe_identifier(table)?;
        let rows = sqlx::query(&format!(
            "SELECT row_to_json(t)::text AS payload FROM {table} t ORDER BY t.id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|source| LegacyError::Query {
            table: table.to_string(),
            source,
        })?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.try_get("payload").map_err(|source| LegacyError::Query {
                table: table.to_string(),
                source,
            })?;
            let value: JsonMap<String, JsonValue> =
                serde_json::from_str(&payload).map_err(|err| LegacyError::InvalidRow {
                    table: table.to_string(),
                    reason: err.to_string(),
                })?;
            records.push(LegacyRecord(value));
        }
        Ok(records)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl PartitionCleanup for PgLegacySource {
    async fn drop_partition(&mut self, year: i32) -> Result<bool, LegacyError> {
        let table = partition_table(year);
        let query_error = |source: sqlx::Error| LegacyError::Query {
            table: table.clone(),
            source,
        };
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables
                            WHERE table_schema = current_schema() AND table_name = $1)",
        )
        .bind(&table)
        .fetch_one(&self.pool)
        .await
        .map_err(query_error)?;
        if !exists {
            return Ok(false);
        }
        sqlx::query(&format!("DROP TABLE {}", safe_identifier(&table)?))
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        info!(%table, "dropped legacy partition");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: JsonValue) -> LegacyRecord {
        match value {
            JsonValue::Object(map) => LegacyRecord(map),
            other => panic!("not an object: {other}"),
        }
    }

    fn table(columns: &[&str], rows: Vec<JsonValue>) -> FixtureTable {
        FixtureTable {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .into_iter()
                .map(|r| match r {
                    JsonValue::Object(map) => map,
                    other => panic!("not an object: {other}"),
                })
                .collect(),
        }
    }

    #[test]
    fn name_lists_split_trim_and_dedupe() {
        assert_eq!(
            split_name_list(Some(" Bianchi Luca,Verdi  Anna ;; bianchi luca\nNeri")),
            vec!["Bianchi Luca", "Verdi Anna", "Neri"]
        );
        assert!(split_name_list(Some(" , ; ")).is_empty());
        assert!(split_name_list(None).is_empty());
    }

    #[test]
    fn legacy_dates_in_every_observed_format() {
        let expected = NaiveDate::from_ymd_opt(2019, 5, 4);
        assert_eq!(parse_legacy_date("2019-05-04"), expected);
        assert_eq!(parse_legacy_date("04/05/2019"), expected);
        assert_eq!(parse_legacy_date("2019-05-04 08:30:00"), expected);
        assert_eq!(parse_legacy_date("sometime in May"), None);
    }

    #[test]
    fn schema_version_switches_at_cutoff() {
        assert_eq!(SchemaVersion::for_year(2020, 2021), SchemaVersion::SurnameEra);
        assert_eq!(SchemaVersion::for_year(2021, 2021), SchemaVersion::FullNameEra);
        assert!(SchemaVersion::FullNameEra
            .required_columns()
            .contains(&"Disponibili"));
        assert!(!SchemaVersion::SurnameEra
            .required_columns()
            .contains(&"Disponibili"));
    }

    #[test]
    fn both_schema_versions_normalize_to_one_shape() {
        let old = record(json!({
            "id": 7, "Torneo": "Coppa Primavera", "DataInizio": "12/04/2019",
            "DataFine": null, "Circolo": "GC Roma", "Zona": "SZR6", "Tipo": "GN",
            "TD": "Rossi Mario", "Arbitri": "Bianchi Luca, Verdi Anna", "Osservatori": ""
        }));
        let row = LegacyEventRow::from_record(2019, SchemaVersion::SurnameEra, &old)
            .expect("adapt")
            .normalize();
        assert_eq!(row.legacy_id, 7);
        assert_eq!(row.directors, vec!["Rossi Mario"]);
        assert_eq!(row.referees, vec!["Bianchi Luca", "Verdi Anna"]);
        assert!(row.observers.is_empty());
        assert!(row.available.is_empty());
        assert_eq!(row.end_date, row.start_date);

        let new = record(json!({
            "id": "3", "Torneo": "Open", "DataInizio": "2022-06-01", "DataFine": "2022-06-02",
            "Circolo": "X", "Zona": "SZR1", "Tipo": "GN", "TD": "", "Arbitri": "",
            "Osservatori": "", "Disponibili": "Rossi Mario"
        }));
        let row = LegacyEventRow::from_record(2022, SchemaVersion::FullNameEra, &new)
            .expect("adapt")
            .normalize();
        assert_eq!(row.legacy_id, 3);
        assert_eq!(row.available, vec!["Rossi Mario"]);
        assert!(row.directors.is_empty());
    }

    #[test]
    fn column_values_ignore_key_case() {
        let lower = record(json!({
            "id": 3, "nome": "Mario", "cognome": "Rossi", "EMAIL": "m@example.org"
        }));
        assert_eq!(lower.text("Nome").as_deref(), Some("Mario"));
        assert_eq!(lower.text("Cognome").as_deref(), Some("Rossi"));
        assert_eq!(lower.text("Email").as_deref(), Some("m@example.org"));
        assert_eq!(lower.int("id"), Some(3));
        assert_eq!(lower.int("ID"), Some(3));

        let event = record(json!({
            "ID": 5, "torneo": "Coppa", "datainizio": "2019-05-04", "td": "Rossi Mario",
            "arbitri": "Bianchi Luca", "zona": "SZR6"
        }));
        let row = LegacyEventRow::from_record(2019, SchemaVersion::SurnameEra, &event)
            .expect("adapt")
            .normalize();
        assert_eq!(row.legacy_id, 5);
        assert_eq!(row.directors, vec!["Rossi Mario"]);
        assert_eq!(row.referees, vec!["Bianchi Luca"]);
    }

    #[test]
    fn rows_without_numeric_id_are_invalid() {
        let bad = record(json!({ "id": "abc", "Torneo": "X" }));
        let err = LegacyEventRow::from_record(2019, SchemaVersion::SurnameEra, &bad)
            .expect_err("invalid");
        assert!(matches!(err, LegacyError::InvalidRow { .. }));
    }

    #[tokio::test]
    async fn absent_year_is_none_but_missing_columns_fail() {
        let mut source = FixtureLegacySource::default();
        source.insert_table(
            "gare_2018",
            table(&["id", "Torneo", "Zona"], vec![json!({"id": 1, "Torneo": "X"})]),
        );

        assert!(read_year(&source, 2017, 2021).await.expect("absent").is_none());
        let err = read_year(&source, 2018, 2021).await.expect_err("mismatch");
        match err {
            LegacyError::MissingColumns { table, missing } => {
                assert_eq!(table, "gare_2018");
                assert!(missing.contains(&"TD".to_string()));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn year_rows_come_back_in_ascending_id_order() {
        let mut source = FixtureLegacySource::default();
        let columns = SchemaVersion::SurnameEra.required_columns();
        source.insert_table(
            "gare_2019",
            table(
                columns,
                vec![
                    json!({"id": 9, "Torneo": "B"}),
                    json!({"id": 2, "Torneo": "A"}),
                    json!({"id": null, "Torneo": "broken"}),
                ],
            ),
        );
        let partition = read_year(&source, 2019, 2021)
            .await
            .expect("read")
            .expect("present");
        let ids = partition.rows.iter().map(|r| r.legacy_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 9]);
        assert_eq!(partition.invalid.len(), 1);
    }

    #[tokio::test]
    async fn verification_requires_base_tables() {
        let mut source = FixtureLegacySource::default();
        source.insert_table("arbitri", table(PERSON_COLUMNS, vec![]));
        let err = verify_source(&source).await.expect_err("no clubs table");
        assert!(matches!(err, LegacyError::Unavailable(_)));

        source.insert_table("circoli", table(CLUB_COLUMNS, vec![]));
        verify_source(&source).await.expect("verified");
    }

    #[tokio::test]
    async fn fixture_partition_drop_reports_presence() {
        let mut source = FixtureLegacySource::default();
        source.insert_table("gare_2018", table(&["id"], vec![]));
        source.insert_table(PERSONS_TABLE, table(PERSON_COLUMNS, vec![]));

        assert!(source.drop_partition(2018).await.expect("drop"));
        assert!(!source.drop_partition(2018).await.expect("drop again"));
        assert!(source.table_columns("gare_2018").await.expect("columns").is_none());
        assert!(source.table_columns(PERSONS_TABLE).await.expect("columns").is_some());
    }

    #[test]
    fn fixture_dir_loads_every_json_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("circoli.json"),
            r#"{"columns": ["id", "Codice", "Nome", "Zona"], "rows": [{"id": 1, "Codice": "gcr", "Nome": "GC Roma", "Zona": "SZR4"}]}"#,
        )
        .expect("write");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write");

        let source = FixtureLegacySource::load_dir(dir.path()).expect("load");
        let club = LegacyClubRow::from_record(&LegacyRecord(
            source.tables["circoli"].rows[0].clone(),
        ))
        .expect("club");
        assert_eq!(club.code.as_deref(), Some("GCR"));
        assert_eq!(source.tables.len(), 1);
    }
}
