use serde::Deserialize;
use std::path::Path;

use super::archive::ArchiveIndexError;

pub const LATEST: &str = "latest";

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    pub game_id: String,
    pub slug: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub default_version: Option<String>,
}

/// A game as seen by manifest resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameRef {
    pub game_id: String,
    pub slug: String,
    pub title: Option<String>,
    pub default_version: String,
}

/// Slug / game id mapping loaded from `GAME_CATALOG`.
#[derive(Debug, Clone, Default)]
pub struct GameCatalog {
    entries: Vec<CatalogEntry>,
}

impl GameCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    pub fn load(path: &Path) -> Result<Self, ArchiveIndexError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::new(serde_json::from_str(&raw)?))
    }

    fn to_ref(entry: &CatalogEntry) -> GameRef {
        GameRef {
            game_id: entry.game_id.clone(),
            slug: entry.slug.clone(),
            title: entry.title.clone(),
            default_version: entry
                .default_version
                .clone()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| LATEST.to_string()),
        }
    }

    /// Unknown slugs resolve to themselves with version `latest`.
    pub fn lookup(&self, slug: &str) -> GameRef {
        self.entries
            .iter()
            .find(|e| e.slug == slug || e.game_id == slug)
            .map(Self::to_ref)
            .unwrap_or_else(|| GameRef {
                game_id: slug.to_string(),
                slug: slug.to_string(),
                title: None,
                default_version: LATEST.to_string(),
            })
    }

    pub fn by_game_id(&self, game_id: &str) -> Option<GameRef> {
        self.entries
            .iter()
            .find(|e| e.game_id == game_id)
            .map(Self::to_ref)
    }

    pub fn slugs(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.slug.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> GameCatalog {
        serde_json::from_str::<Vec<CatalogEntry>>(
            r#"[{"game_id": "g-1", "slug": "demo", "title": "Demo", "default_version": "1.2"},
                {"game_id": "g-2", "slug": "other"}]"#,
        )
        .map(GameCatalog::new)
        .unwrap()
    }

    #[test]
    fn test_lookup_known_and_unknown() {
        let catalog = catalog();
        let demo = catalog.lookup("demo");
        assert_eq!(demo.game_id, "g-1");
        assert_eq!(demo.default_version, "1.2");
        assert_eq!(catalog.lookup("g-2").slug, "other");
        assert_eq!(catalog.lookup("other").default_version, LATEST);

        let unknown = catalog.lookup("mystery");
        assert_eq!(unknown.game_id, "mystery");
        assert_eq!(unknown.default_version, LATEST);
        assert!(catalog.by_game_id("mystery").is_none());
    }
}
