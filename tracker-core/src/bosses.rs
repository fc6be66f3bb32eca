use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::Result;

/// One or several event IDs backing a boss. Multi-phase fights persist a
/// flag per phase; the boss counts as defeated when any of them is set.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EventIds {
    One(u32),
    Many(Vec<u32>),
}

impl EventIds {
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        match self {
            EventIds::One(id) => std::slice::from_ref(id).iter().copied(),
            EventIds::Many(ids) => ids.iter().copied(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BossDef {
    pub name: String,
    pub event_id: EventIds,
}

/// Boss reference data grouped by location, as shipped in the bundled JSON.
#[derive(Debug, Clone, Default)]
pub struct BossCatalog {
    locations: BTreeMap<String, Vec<BossDef>>,
}

impl BossCatalog {
    pub fn from_json(text: &str) -> Result<Self> {
        let locations = serde_json::from_str(text)?;
        Ok(BossCatalog { locations })
    }

    /// The bundled reference catalog. Its validity is covered by tests, so
    /// a parse failure here is a build defect rather than a runtime state.
    pub fn builtin() -> Self {
        Self::from_json(include_str!("../data/boss_ids_reference.json"))
            .expect("bundled boss reference data is valid")
    }

    pub fn locations(&self) -> impl Iterator<Item = (&str, &[BossDef])> {
        self.locations
            .iter()
            .map(|(name, bosses)| (name.as_str(), bosses.as_slice()))
    }

    pub fn boss_count(&self) -> usize {
        self.locations.values().map(Vec::len).sum()
    }

    /// Deduplicated, sorted set of every event ID to monitor.
    pub fn all_event_ids(&self) -> Vec<u32> {
        let mut ids = BTreeSet::new();
        for bosses in self.locations.values() {
            for boss in bosses {
                ids.extend(boss.event_id.iter());
            }
        }
        ids.into_iter().collect()
    }

    /// Boss name for an event ID, across all locations.
    pub fn name_by_id(&self, event_id: u32) -> Option<&str> {
        self.locations
            .values()
            .flatten()
            .find(|boss| boss.event_id.iter().any(|id| id == event_id))
            .map(|boss| boss.name.as_str())
    }

    /// `(defeated, total)` boss counts for a flag map; a boss is defeated
    /// when any of its event IDs reads true.
    pub fn defeated_counts(&self, statuses: &BTreeMap<String, bool>) -> (usize, usize) {
        let mut defeated = 0;
        let mut total = 0;
        for bosses in self.locations.values() {
            for boss in bosses {
                total += 1;
                let is_defeated = boss
                    .event_id
                    .iter()
                    .any(|id| statuses.get(&id.to_string()).copied().unwrap_or(false));
                if is_defeated {
                    defeated += 1;
                }
            }
        }
        (defeated, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "Limgrave": [
            { "name": "Margit, the Fell Omen", "event_id": 10000850 },
            { "name": "Godrick the Grafted", "event_id": 10000800 }
        ],
        "Leyndell, Royal Capital": [
            { "name": "Godfrey, First Elden Lord", "event_id": 11000850 },
            { "name": "Morgott, the Omen King", "event_id": [11000800, 11000801] }
        ]
    }"#;

    #[test]
    fn builtin_catalog_parses() {
        let catalog = BossCatalog::builtin();
        assert!(catalog.boss_count() > 0);
        assert!(!catalog.all_event_ids().is_empty());
    }

    #[test]
    fn collects_deduplicated_event_ids() {
        let catalog = BossCatalog::from_json(SAMPLE).unwrap();
        let ids = catalog.all_event_ids();
        assert_eq!(ids, vec![10000800, 10000850, 11000800, 11000801, 11000850]);
    }

    #[test]
    fn resolves_names_including_multi_id_bosses() {
        let catalog = BossCatalog::from_json(SAMPLE).unwrap();
        assert_eq!(catalog.name_by_id(10000850), Some("Margit, the Fell Omen"));
        assert_eq!(
            catalog.name_by_id(11000801),
            Some("Morgott, the Omen King")
        );
        assert_eq!(catalog.name_by_id(42), None);
    }

    #[test]
    fn any_true_id_marks_a_boss_defeated() {
        let catalog = BossCatalog::from_json(SAMPLE).unwrap();
        let statuses = BTreeMap::from([
            ("10000850".to_string(), true),
            ("11000801".to_string(), true),
            ("11000800".to_string(), false),
        ]);
        assert_eq!(catalog.defeated_counts(&statuses), (2, 4));
    }
}
