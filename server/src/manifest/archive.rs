//! Pre-built chunk-archive index
//!
//! An external index describing games that ship as pre-chunked compressed
//! archives. Lookup tries, first match wins: an app-id override or exact app
//! id, then a normalized-name match with an equal version, then the most
//! recently updated entry with that normalized name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveIndexError {
    #[error("failed to read archive index: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid archive index: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveChunk {
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub sha256: String,
}

fn default_cleanup() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveGame {
    pub name: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub app_id: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub archive_dir: Option<String>,
    #[serde(default = "default_cleanup")]
    pub cleanup: bool,
    #[serde(default)]
    pub base_path: String,
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub chunks: Vec<ArchiveChunk>,
    #[serde(default)]
    pub files: Vec<String>,
}

impl ArchiveGame {
    fn updated(&self) -> Option<DateTime<Utc>> {
        self.updated_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchiveIndex {
    /// game id (or slug) -> app id
    #[serde(default)]
    pub overrides: HashMap<String, String>,
    #[serde(default)]
    pub games: Vec<ArchiveGame>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Lowercase ASCII alphanumerics only.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// What a lookup is matched against.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveQuery<'a> {
    pub game_id: &'a str,
    pub slug: &'a str,
    pub title: Option<&'a str>,
    pub version: &'a str,
}

impl ArchiveIndex {
    pub fn load(path: &Path) -> Result<Self, ArchiveIndexError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&raw)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn find(&self, query: ArchiveQuery<'_>) -> Option<&ArchiveGame> {
        let app_id = self
            .overrides
            .get(query.game_id)
            .or_else(|| self.overrides.get(query.slug))
            .map(String::as_str)
            .unwrap_or(query.game_id);
        if let Some(game) = self
            .games
            .iter()
            .find(|g| g.app_id.as_deref() == Some(app_id))
        {
            return Some(game);
        }

        let names: Vec<String> = [query.title, Some(query.slug), Some(query.game_id)]
            .into_iter()
            .flatten()
            .map(normalize_name)
            .filter(|n| !n.is_empty())
            .collect();
        let same_name = |g: &&ArchiveGame| names.contains(&normalize_name(&g.name));

        if let Some(game) = self
            .games
            .iter()
            .filter(same_name)
            .find(|g| g.version.as_deref() == Some(query.version))
        {
            return Some(game);
        }

        self.games
            .iter()
            .filter(same_name)
            .max_by_key(|g| g.updated())
    }

    /// Display names of every indexed game.
    pub fn game_names(&self) -> Vec<String> {
        self.games.iter().map(|g| g.name.clone()).collect()
    }
}
