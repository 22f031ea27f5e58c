//! Resolves legacy zone, category and club references to canonical ids.
//!
//! Every chain is code, then exact name, then name substring in ascending id
//! order, then the configured default. Reruns depend on that order.

use std::collections::BTreeMap;

use clubsync_core::{
    creation_order, normalize_name, Category, EntityId, MigrationError, Organization, Zone,
};
use clubsync_storage::{CanonicalStore, StoreResult};
use tracing::{debug, info};

use crate::config::MigrationRules;
use crate::reconcile::insert_organization_unique;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStep {
    Code,
    Name,
    Fuzzy,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    pub id: EntityId,
    pub step: LookupStep,
}

/// Anything with an id, a code and a display name.
trait Coded {
    fn id(&self) -> EntityId;
    fn code(&self) -> &str;
    fn name(&self) -> &str;
}

impl Coded for Zone {
    fn id(&self) -> EntityId {
        self.id
    }
    fn code(&self) -> &str {
        &self.code
    }
    fn name(&self) -> &str {
        &self.name
    }
}

impl Coded for Category {
    fn id(&self) -> EntityId {
        self.id
    }
    fn code(&self) -> &str {
        &self.code
    }
    fn name(&self) -> &str {
        &self.name
    }
}

impl Coded for Organization {
    fn id(&self) -> EntityId {
        self.id
    }
    fn code(&self) -> &str {
        &self.code
    }
    fn name(&self) -> &str {
        &self.name
    }
}

/// Code, exact name, substring; `None` when all three miss. `items` must be in ascending id order.
fn chain<T: Coded>(items: &[T], raw: &str) -> Option<Lookup> {
    let raw = raw.trim();
    let key = normalize_name(raw);
    if key.is_empty() {
        return None;
    }
    if let Some(hit) = items.iter().find(|i| i.code().eq_ignore_ascii_case(raw)) {
        return Some(Lookup {
            id: hit.id(),
            step: LookupStep::Code,
        });
    }
    if let Some(hit) = items.iter().find(|i| normalize_name(i.name()) == key) {
        return Some(Lookup {
            id: hit.id(),
            step: LookupStep::Name,
        });
    }
    items
        .iter()
        .find(|i| normalize_name(i.name()).contains(&key))
        .map(|hit| Lookup {
            id: hit.id(),
            step: LookupStep::Fuzzy,
        })
}

pub fn sentinel_code(zone_code: &str) -> String {
    format!("TBA-{}", zone_code.trim().to_uppercase())
}

pub struct ReferenceMapper {
    zones: Vec<Zone>,
    categories: Vec<Category>,
    organizations: Vec<Organization>,
    default_zone_code: String,
    default_category_code: String,
    sentinels: BTreeMap<String, EntityId>,
}

impl ReferenceMapper {
    pub async fn load(store: &dyn CanonicalStore, rules: &MigrationRules) -> StoreResult<Self> {
        let mut mapper = Self {
            zones: store.zones().await?,
            categories: store.categories().await?,
            organizations: store.organizations().await?,
            default_zone_code: rules.default_zone_code.clone(),
            default_category_code: rules.default_category_code.clone(),
            sentinels: BTreeMap::new(),
        };
        mapper.sort();
        Ok(mapper)
    }

    fn sort(&mut self) {
        self.zones.sort_by_key(|z| creation_order(z.id));
        self.categories.sort_by_key(|c| creation_order(c.id));
        self.organizations.sort_by_key(|o| creation_order(o.id));
    }

    pub fn zone(&self, id: EntityId) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == id)
    }

    pub fn zone_by_code(&self, code: &str) -> Option<&Zone> {
        self.zones
            .iter()
            .find(|z| z.code.eq_ignore_ascii_case(code.trim()))
    }

    /// Resolves without falling back; for fields where a default would be a guess.
    pub fn find_zone(&self, raw: &str) -> Option<Lookup> {
        chain(&self.zones, raw)
    }

    pub fn resolve_zone(&self, raw: Option<&str>) -> Option<Lookup> {
        raw.and_then(|raw| chain(&self.zones, raw)).or_else(|| {
            self.zone_by_code(&self.default_zone_code).map(|z| Lookup {
                id: z.id,
                step: LookupStep::Default,
            })
        })
    }

    pub fn resolve_category(&self, raw: Option<&str>) -> Option<Lookup> {
        raw.and_then(|raw| chain(&self.categories, raw)).or_else(|| {
            self.categories
                .iter()
                .find(|c| c.code.eq_ignore_ascii_case(&self.default_category_code))
                .map(|c| Lookup {
                    id: c.id,
                    step: LookupStep::Default,
                })
        })
    }

    /// Real clubs first; falls back to the zone's placeholder club, creating it on first use.
    pub async fn resolve_organization(
        &mut self,
        store: &dyn CanonicalStore,
        raw: Option<&str>,
        zone_id: Option<EntityId>,
    ) -> Result<Lookup, MigrationError> {
        let real = self
            .organizations
            .iter()
            .filter(|o| !o.is_placeholder)
            .cloned()
            .collect::<Vec<_>>();
        if let Some(hit) = raw.and_then(|raw| chain(&real, raw)) {
            return Ok(hit);
        }
        let id = self.sentinel_for(store, zone_id).await?;
        debug!(raw = ?raw, sentinel = id, "club reference fell back to placeholder");
        Ok(Lookup {
            id,
            step: LookupStep::Default,
        })
    }

    async fn sentinel_for(
        &mut self,
        store: &dyn CanonicalStore,
        zone_id: Option<EntityId>,
    ) -> Result<EntityId, MigrationError> {
        let zone = zone_id
            .and_then(|id| self.zone(id))
            .or_else(|| self.zone_by_code(&self.default_zone_code))
            .cloned();
        let zone_code = zone
            .as_ref()
            .map(|z| z.code.clone())
            .unwrap_or_else(|| self.default_zone_code.clone());
        let code = sentinel_code(&zone_code);

        if let Some(id) = self.sentinels.get(&code) {
            return Ok(*id);
        }
        if let Some(existing) = store.find_organization_by_code(&code).await? {
            self.sentinels.insert(code, existing.id);
            return Ok(existing.id);
        }

        let placeholder = Organization {
            id: 0,
            name: format!(
                "TBA {}",
                zone.as_ref().map(|z| z.name.as_str()).unwrap_or(&zone_code)
            ),
            code: code.clone(),
            address: None,
            city: None,
            zone_id: zone.as_ref().map(|z| z.id),
            is_placeholder: true,
        };
        let stored = insert_organization_unique(store, &placeholder).await?;
        info!(code = %stored.code, id = stored.id, "created placeholder club");
        self.sentinels.insert(code, stored.id);
        self.register_organization(stored.clone());
        Ok(stored.id)
    }

    pub fn register_organization(&mut self, organization: Organization) {
        match self
            .organizations
            .iter_mut()
            .find(|o| o.id == organization.id)
        {
            Some(slot) => *slot = organization,
            None => {
                self.organizations.push(organization);
                self.sort();
            }
        }
    }

    pub fn organization_by_name(&self, name: &str) -> Option<&Organization> {
        let key = normalize_name(name);
        self.organizations
            .iter()
            .find(|o| !o.is_placeholder && normalize_name(&o.name) == key)
    }
}
