//! Matches free-text person names from legacy columns against the canonical
//! person directory.

use clubsync_core::{creation_order, normalize_name, EntityId, Person};
use strsim::jaro_winkler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    Direct,
    PairInversion,
    /// Last token is the given name, everything before it the family name.
    LastTokenGiven,
    /// First two tokens form a compound family name.
    CompoundFamily,
    /// First token is the family name, the rest a compound given name.
    CompoundGiven,
    Partial,
    ZoneSuffix,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Match {
        id: EntityId,
        strategy: MatchStrategy,
    },
    /// More than one candidate at the first step that produced hits. `chosen`
    /// is the best-ranked one and only a low-confidence pick.
    Ambiguous {
        chosen: EntityId,
        candidates: Vec<EntityId>,
        confidence: f64,
        strategy: MatchStrategy,
    },
    NoMatch,
}

impl Resolution {
    pub fn id(&self) -> Option<EntityId> {
        match self {
            Resolution::Match { id, .. } => Some(*id),
            Resolution::Ambiguous { chosen, .. } => Some(*chosen),
            Resolution::NoMatch => None,
        }
    }
}

/// How a name from one legacy row may be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameScope {
    Open,
    /// Rows from partitions before the full-name cutoff. Single-token
    /// fragments are surnames and only resolve inside the designated zone.
    SurnameEra {
        row_in_designated_zone: bool,
        designated_zone: Option<EntityId>,
    },
}

#[derive(Debug, Clone)]
struct Candidate {
    id: EntityId,
    key: String,
    zone_id: Option<EntityId>,
}

/// Person directory snapshot, kept in ascending id order.
#[derive(Debug, Clone, Default)]
pub struct CandidatePool {
    candidates: Vec<Candidate>,
}

impl CandidatePool {
    pub fn from_persons(persons: &[Person]) -> Self {
        let mut candidates = persons
            .iter()
            .map(|p| Candidate {
                id: p.id,
                key: normalize_name(&p.name),
                zone_id: p.zone_id,
            })
            .filter(|c| !c.key.is_empty())
            .collect::<Vec<_>>();
        candidates.sort_by_key(|c| creation_order(c.id));
        Self { candidates }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn resolve_in(&self, raw: &str, scope: NameScope) -> Resolution {
        match scope {
            NameScope::SurnameEra {
                row_in_designated_zone,
                designated_zone,
            } if normalize_name(raw).split(' ').count() == 1 => {
                if !row_in_designated_zone {
                    return Resolution::NoMatch;
                }
                match designated_zone {
                    Some(zone) => self.resolve_zone_suffix(raw, zone),
                    None => Resolution::NoMatch,
                }
            }
            _ => self.resolve(raw),
        }
    }

    /// Direct, inverted, permuted, then partial; stops at the first step with a hit.
    pub fn resolve(&self, raw: &str) -> Resolution {
        let key = normalize_name(raw);
        if key.is_empty() {
            return Resolution::NoMatch;
        }

        for (strategy, attempt) in name_attempts(&key) {
            let hits = self.exact(&attempt);
            if !hits.is_empty() {
                return settle(hits, strategy, &key, self);
            }
        }

        let hits = self
            .candidates
            .iter()
            .filter(|c| c.key.contains(&key))
            .map(|c| c.id)
            .collect::<Vec<_>>();
        if hits.is_empty() {
            Resolution::NoMatch
        } else {
            settle(hits, MatchStrategy::Partial, &key, self)
        }
    }

    /// Candidates of `zone` whose name ends with `" " + fragment`.
    pub fn resolve_zone_suffix(&self, fragment: &str, zone: EntityId) -> Resolution {
        let key = normalize_name(fragment);
        if key.is_empty() {
            return Resolution::NoMatch;
        }
        let suffix = format!(" {key}");
        let hits = self
            .candidates
            .iter()
            .filter(|c| c.zone_id == Some(zone) && c.key.ends_with(&suffix))
            .map(|c| c.id)
            .collect::<Vec<_>>();
        if hits.is_empty() {
            Resolution::NoMatch
        } else {
            settle(hits, MatchStrategy::ZoneSuffix, &key, self)
        }
    }

    fn exact(&self, key: &str) -> Vec<EntityId> {
        self.candidates
            .iter()
            .filter(|c| c.key == key)
            .map(|c| c.id)
            .collect()
    }

    fn key_of(&self, id: EntityId) -> &str {
        self.candidates
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.key.as_str())
            .unwrap_or_default()
    }
}

/// Candidate spellings for `key` in strategy order.
fn name_attempts(key: &str) -> Vec<(MatchStrategy, String)> {
    let tokens = key.split(' ').collect::<Vec<_>>();
    let mut attempts = vec![(MatchStrategy::Direct, key.to_string())];
    match tokens.len() {
        2 => attempts.push((
            MatchStrategy::PairInversion,
            format!("{} {}", tokens[1], tokens[0]),
        )),
        n if n >= 3 => {
            attempts.push((
                MatchStrategy::LastTokenGiven,
                format!("{} {}", tokens[n - 1], tokens[..n - 1].join(" ")),
            ));
            attempts.push((
                MatchStrategy::CompoundFamily,
                format!("{} {}", tokens[2..].join(" "), tokens[..2].join(" ")),
            ));
            attempts.push((
                MatchStrategy::CompoundGiven,
                format!("{} {}", tokens[1..].join(" "), tokens[0]),
            ));
        }
        _ => {}
    }
    attempts
}

fn settle(
    mut hits: Vec<EntityId>,
    strategy: MatchStrategy,
    key: &str,
    pool: &CandidatePool,
) -> Resolution {
    if hits.len() == 1 {
        return Resolution::Match {
            id: hits[0],
            strategy,
        };
    }

    // Closest spelling first; the oldest candidate breaks ties so reruns pick the same one.
    let mut ranked = hits
        .iter()
        .map(|id| (jaro_winkler(key, pool.key_of(*id)), *id))
        .collect::<Vec<_>>();
    ranked.sort_by(|a, b| {
        b.0.total_cmp(&a.0)
            .then(creation_order(a.1).cmp(&creation_order(b.1)))
    });
    let (best_score, chosen) = ranked[0];
    hits.sort_unstable_by_key(|id| creation_order(*id));

    Resolution::Ambiguous {
        chosen,
        confidence: best_score / hits.len() as f64,
        candidates: hits,
        strategy,
    }
}
