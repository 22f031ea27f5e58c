use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Utc};
use clubsync_core::normalize_name;
use serde::Deserialize;

/// Process configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub legacy_database_url: Option<String>,
    /// Canonical target; runs against an ephemeral in-memory store when unset.
    pub database_url: Option<String>,
    pub seeds_path: PathBuf,
    /// When set, the legacy source is read from JSON fixture tables instead of Postgres.
    pub fixtures_dir: Option<PathBuf>,
    pub reports_dir: PathBuf,
    pub first_year: i32,
    pub last_year: i32,
}

impl MigrationConfig {
    pub fn from_env() -> Self {
        let current_year = Utc::now().year();
        Self {
            legacy_database_url: std::env::var("LEGACY_DATABASE_URL").ok(),
            database_url: std::env::var("DATABASE_URL").ok(),
            seeds_path: std::env::var("CLUBSYNC_SEEDS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./seeds.yaml")),
            fixtures_dir: std::env::var("CLUBSYNC_FIXTURES_DIR").ok().map(PathBuf::from),
            reports_dir: std::env::var("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            first_year: std::env::var("CLUBSYNC_FIRST_YEAR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2015),
            last_year: std::env::var("CLUBSYNC_LAST_YEAR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(current_year),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SeedEntry {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedDefaults {
    pub zone_code: String,
    pub category_code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyRulesFile {
    #[serde(default = "default_designated_zone")]
    pub designated_zone: String,
    #[serde(default = "default_full_name_cutoff")]
    pub full_name_cutoff: i32,
    #[serde(default = "default_skip_sentinels")]
    pub skip_sentinels: Vec<String>,
}

impl Default for LegacyRulesFile {
    fn default() -> Self {
        Self {
            designated_zone: default_designated_zone(),
            full_name_cutoff: default_full_name_cutoff(),
            skip_sentinels: default_skip_sentinels(),
        }
    }
}

fn default_designated_zone() -> String {
    "SZR6".to_string()
}

fn default_full_name_cutoff() -> i32 {
    2021
}

fn default_skip_sentinels() -> Vec<String> {
    vec!["Attività Giovanile".to_string()]
}

/// Seed file layout this build understands.
pub const SEED_FILE_VERSION: u32 = 1;

/// Reference data seeded before any import, plus the legacy rules.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedFile {
    pub version: u32,
    #[serde(default)]
    pub zones: Vec<SeedEntry>,
    #[serde(default)]
    pub categories: Vec<SeedEntry>,
    pub defaults: SeedDefaults,
    #[serde(default)]
    pub legacy: LegacyRulesFile,
}

impl SeedFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let seeds: Self = serde_yaml::from_str(text)?;
        if seeds.version != SEED_FILE_VERSION {
            bail!(
                "unsupported seed file version {} (expected {SEED_FILE_VERSION})",
                seeds.version
            );
        }
        Ok(seeds)
    }

    pub fn rules(&self) -> MigrationRules {
        MigrationRules {
            default_zone_code: self.defaults.zone_code.clone(),
            default_category_code: self.defaults.category_code.clone(),
            designated_zone_code: self.legacy.designated_zone.clone(),
            full_name_cutoff: self.legacy.full_name_cutoff,
            skip_sentinels: self.legacy.skip_sentinels.clone(),
        }
    }
}

/// Decision inputs shared by the mapper and the importers for one run.
#[derive(Debug, Clone)]
pub struct MigrationRules {
    pub default_zone_code: String,
    pub default_category_code: String,
    pub designated_zone_code: String,
    pub full_name_cutoff: i32,
    pub skip_sentinels: Vec<String>,
}

impl Default for MigrationRules {
    fn default() -> Self {
        let legacy = LegacyRulesFile::default();
        Self {
            default_zone_code: "SZR1".to_string(),
            default_category_code: "GZ".to_string(),
            designated_zone_code: legacy.designated_zone,
            full_name_cutoff: legacy.full_name_cutoff,
            skip_sentinels: legacy.skip_sentinels,
        }
    }
}

impl MigrationRules {
    pub fn is_skip_sentinel(&self, raw: Option<&str>) -> bool {
        let Some(raw) = raw else {
            return false;
        };
        let key = normalize_name(raw);
        !key.is_empty()
            && self
                .skip_sentinels
                .iter()
                .any(|sentinel| normalize_name(sentinel) == key)
    }

    pub fn is_designated_zone(&self, zone_code: Option<&str>) -> bool {
        zone_code.is_some_and(|code| code.trim().eq_ignore_ascii_case(&self.designated_zone_code))
    }
}
