//! Reward definitions and weighted selection.
//!
//! Each community keeps its catalog in `<souls_dir>/<community_id>/souls.json`.
//! An empty or missing catalog falls back to a single global default soul,
//! deliberately unfavorable so communities are nudged into creating their own.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::logging::{self, obj, v_str, Domain};
use crate::profile::MemberId;

/// Identity of a soul. The global default is its own variant so call sites
/// match on it instead of comparing against a magic id string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SoulId {
    Default,
    Catalog(String),
}

impl fmt::Display for SoulId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SoulId::Default => f.write_str("default"),
            SoulId::Catalog(id) => f.write_str(id),
        }
    }
}

impl Serialize for SoulId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SoulId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(if raw == "default" { SoulId::Default } else { SoulId::Catalog(raw) })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Soul {
    pub id: SoulId,
    pub name: String,
    pub author: MemberId,
    /// Lower is more common. Selection weight is 1/rarity; base value when
    /// caught equals the rarity.
    pub rarity: u32,
    pub emoji: String,
    /// File stem of the sound asset played by the platform layer.
    pub audio_cue: String,
    pub global: bool,
}

pub fn default_soul() -> Soul {
    Soul {
        id: SoulId::Default,
        name: "wisp".to_string(),
        author: "system".to_string(),
        rarity: 5,
        emoji: "\u{1F47B}".to_string(),
        audio_cue: "wisp".to_string(),
        global: true,
    }
}

pub fn soul_value(soul: &Soul) -> i64 {
    i64::from(soul.rarity)
}

fn weight(soul: &Soul) -> f64 {
    1.0 / f64::from(soul.rarity.max(1))
}

/// Select the entry whose cumulative weight first exceeds `draw`.
/// Total for any catalog and any draw: a float edge at the upper boundary
/// resolves to the last entry.
pub fn pick_at(souls: &[Soul], draw: f64) -> Soul {
    let mut acc = 0.0;
    for soul in souls {
        acc += weight(soul);
        if draw < acc {
            return soul.clone();
        }
    }
    match souls.last() {
        Some(soul) => soul.clone(),
        None => default_soul(),
    }
}

pub fn pick_weighted(rng: &mut impl Rng, souls: &[Soul]) -> Soul {
    if souls.is_empty() {
        return default_soul();
    }
    let total: f64 = souls.iter().map(weight).sum();
    pick_at(souls, rng.gen_range(0.0..total))
}

#[derive(Deserialize)]
struct CatalogFile {
    souls: Vec<Soul>,
}

/// Per-community catalogs backed by JSON files on disk.
pub struct SoulCatalog {
    root: PathBuf,
}

impl SoulCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, community_id: &str) -> PathBuf {
        self.root.join(community_id).join("souls.json")
    }

    /// Missing or unreadable catalogs load as empty, never as an error.
    pub fn load(&self, community_id: &str) -> Vec<Soul> {
        let path = self.path_for(community_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str::<CatalogFile>(&raw) {
            Ok(file) => file.souls,
            Err(err) => {
                logging::warn(
                    Domain::System,
                    "catalog_unparseable",
                    obj(&[
                        ("community", v_str(community_id)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                Vec::new()
            }
        }
    }

    pub fn select_weighted(&self, rng: &mut impl Rng, community_id: &str) -> Soul {
        pick_weighted(rng, &self.load(community_id))
    }

    /// The default id always maps to the global default regardless of
    /// catalog contents; any other id falls back to the default on a miss.
    pub fn resolve_or_default(&self, id: &SoulId, community_id: &str) -> Soul {
        match id {
            SoulId::Default => default_soul(),
            SoulId::Catalog(_) => self
                .load(community_id)
                .into_iter()
                .find(|soul| &soul.id == id)
                .unwrap_or_else(default_soul),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn soul(id: &str, rarity: u32) -> Soul {
        Soul {
            id: SoulId::Catalog(id.to_string()),
            name: id.to_string(),
            author: "author".to_string(),
            rarity,
            emoji: "\u{1F480}".to_string(),
            audio_cue: id.to_string(),
            global: false,
        }
    }

    #[test]
    fn empty_catalog_selects_default() {
        let mut rng = StdRng::seed_from_u64(7);
        let picked = pick_weighted(&mut rng, &[]);
        assert_eq!(picked.id, SoulId::Default);
        assert_eq!(picked.rarity, 5);
        assert!(picked.global);
    }

    #[test]
    fn draw_zero_selects_first() {
        let souls = vec![soul("a", 1), soul("b", 4)];
        assert_eq!(pick_at(&souls, 0.0).id, SoulId::Catalog("a".to_string()));
    }

    #[test]
    fn draw_below_total_selects_last() {
        // weights [1.0, 0.25], total 1.25
        let souls = vec![soul("a", 1), soul("b", 4)];
        assert_eq!(pick_at(&souls, 1.249).id, SoulId::Catalog("b".to_string()));
    }

    #[test]
    fn boundary_draw_falls_to_last_entry() {
        let souls = vec![soul("a", 1), soul("b", 4)];
        // At or past the total the walk never fires; the last entry wins.
        assert_eq!(pick_at(&souls, 1.25).id, SoulId::Catalog("b".to_string()));
        assert_eq!(pick_at(&souls, 99.0).id, SoulId::Catalog("b".to_string()));
    }

    #[test]
    fn selection_frequency_tracks_inverse_rarity() {
        let souls = vec![soul("a", 1), soul("b", 4)];
        let mut rng = StdRng::seed_from_u64(42);
        let draws = 20_000;
        let mut first = 0usize;
        for _ in 0..draws {
            if pick_weighted(&mut rng, &souls).id == SoulId::Catalog("a".to_string()) {
                first += 1;
            }
        }
        // Expected share: 1.0 / 1.25 = 0.8
        let share = first as f64 / draws as f64;
        assert!((share - 0.8).abs() < 0.05, "share was {share}");
    }

    #[test]
    fn soul_id_serde_maps_default() {
        let json = serde_json::to_string(&SoulId::Default).unwrap();
        assert_eq!(json, "\"default\"");
        let back: SoulId = serde_json::from_str("\"default\"").unwrap();
        assert_eq!(back, SoulId::Default);
        let named: SoulId = serde_json::from_str("\"howl\"").unwrap();
        assert_eq!(named, SoulId::Catalog("howl".to_string()));
    }

    #[test]
    fn catalog_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let community = dir.path().join("c1");
        std::fs::create_dir_all(&community).unwrap();
        let souls = vec![soul("howl", 2), soul("creak", 6)];
        let body = serde_json::json!({ "souls": souls });
        std::fs::write(community.join("souls.json"), body.to_string()).unwrap();

        let catalog = SoulCatalog::new(dir.path());
        let loaded = catalog.load("c1");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, SoulId::Catalog("howl".to_string()));

        assert!(catalog.load("missing").is_empty());
    }

    #[test]
    fn resolve_or_default_rules() {
        let dir = tempfile::tempdir().unwrap();
        let community = dir.path().join("c1");
        std::fs::create_dir_all(&community).unwrap();
        let body = serde_json::json!({ "souls": vec![soul("howl", 2)] });
        std::fs::write(community.join("souls.json"), body.to_string()).unwrap();
        let catalog = SoulCatalog::new(dir.path());

        // The default id is stable across catalog edits.
        assert_eq!(catalog.resolve_or_default(&SoulId::Default, "c1").id, SoulId::Default);
        // Hit.
        let hit = catalog.resolve_or_default(&SoulId::Catalog("howl".to_string()), "c1");
        assert_eq!(hit.rarity, 2);
        // Miss falls back.
        let miss = catalog.resolve_or_default(&SoulId::Catalog("gone".to_string()), "c1");
        assert_eq!(miss.id, SoulId::Default);
    }
}
