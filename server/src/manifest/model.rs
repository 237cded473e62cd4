//! Manifest data model
//!
//! A manifest is identified by `(game_id, version, build_id)` and is never
//! mutated after it has been issued. Inline manifests posted by clients may
//! carry only `files[].path`, `files[].size` and `files[].hash`; every other
//! field has a serde default.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::storage::cas::chunk_hash_of_bytes;
use crate::storage::{normalize_relative_path, DEFAULT_CHUNK_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMode {
    #[default]
    Direct,
    ArchiveChunks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub index: u32,
    #[serde(default)]
    pub hash: String,
    pub size: u64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub fallback_urls: Vec<String>,
    #[serde(default)]
    pub compression: Compression,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    #[serde(default)]
    pub size: u64,
    /// Empty when the manifest does not know the hash.
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(default)]
    pub chunks: Vec<ChunkEntry>,
}

impl FileEntry {
    /// Lowercased expected hash, `None` when absent.
    pub fn expected_hash(&self) -> Option<String> {
        let trimmed = self.hash.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_ascii_lowercase())
    }

    pub fn chunk(&self, index: u32) -> Option<&ChunkEntry> {
        self.chunks.iter().find(|c| c.index == index)
    }
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub game_id: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub build_id: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub compressed_size: u64,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub install_mode: InstallMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_dir: Option<String>,
    #[serde(default)]
    pub archive_cleanup: bool,
    #[serde(default)]
    pub archive_files: BTreeSet<String>,
}

/// Who and which version a manifest is built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestIdentity {
    pub game_id: String,
    pub slug: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestSummary {
    pub game_id: String,
    pub version: String,
    pub build_id: String,
    pub install_mode: InstallMode,
    pub file_count: usize,
    pub chunk_count: usize,
    pub total_size: u64,
}

/// Content-derived build id: first 16 hex of SHA-256 over `"{game_id}:{version}"`.
pub fn build_id_for(game_id: &str, version: &str) -> String {
    let mut id = chunk_hash_of_bytes(format!("{game_id}:{version}").as_bytes());
    id.truncate(16);
    id
}

impl Manifest {
    /// Empty manifest for `identity`; sizes are filled by [`Manifest::finalize`].
    pub fn new(identity: &ManifestIdentity, chunk_size: u64) -> Self {
        Self {
            game_id: identity.game_id.clone(),
            slug: identity.slug.clone(),
            version: identity.version.clone(),
            build_id: build_id_for(&identity.game_id, &identity.version),
            chunk_size,
            total_size: 0,
            compressed_size: 0,
            files: Vec::new(),
            install_mode: InstallMode::Direct,
            archive_dir: None,
            archive_cleanup: false,
            archive_files: BTreeSet::new(),
        }
    }

    /// Recompute totals from the file list.
    pub fn finalize(mut self) -> Self {
        self.total_size = self.files.iter().map(|f| f.size).sum();
        // no codec yet
        self.compressed_size = self.total_size;
        self
    }

    pub fn find_file(&self, path: &str) -> Option<&FileEntry> {
        let wanted = normalize_relative_path(path);
        self.files
            .iter()
            .find(|f| normalize_relative_path(&f.path) == wanted)
    }

    pub fn find_by_file_id(&self, file_id: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.file_id == file_id)
    }

    pub fn summary(&self) -> ManifestSummary {
        ManifestSummary {
            game_id: self.game_id.clone(),
            version: self.version.clone(),
            build_id: self.build_id.clone(),
            install_mode: self.install_mode,
            file_count: self.files.len(),
            chunk_count: self.files.iter().map(|f| f.chunks.len()).sum(),
            total_size: self.total_size,
        }
    }

    /// Sorted keys, no whitespace.
    pub fn canonical_json(&self) -> Result<String, serde_json::Error> {
        let value = serde_json::to_value(self)?;
        serde_json::to_string(&value)
    }

    pub fn canonical_hash(&self) -> Result<String, serde_json::Error> {
        Ok(chunk_hash_of_bytes(self.canonical_json()?.as_bytes()))
    }

    /// Files whose chunk sizes do not add up, or whose inner chunks are short.
    pub fn layout_violations(&self) -> Vec<String> {
        self.files
            .iter()
            .filter(|f| {
                let sum: u64 = f.chunks.iter().map(|c| c.size).sum();
                let inner_short = f.chunks.len() > 1
                    && self.install_mode == InstallMode::Direct
                    && f.chunks[..f.chunks.len() - 1]
                        .iter()
                        .any(|c| c.size != self.chunk_size);
                sum != f.size || inner_short
            })
            .map(|f| f.path.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ManifestIdentity {
        ManifestIdentity {
            game_id: "g-1".into(),
            slug: "demo".into(),
            version: "1.0.0".into(),
        }
    }

    #[test]
    fn test_build_id_is_content_derived() {
        let a = build_id_for("g-1", "1.0.0");
        assert_eq!(a.len(), 16);
        assert_eq!(a, build_id_for("g-1", "1.0.0"));
        assert_ne!(a, build_id_for("g-1", "1.0.1"));
        assert_eq!(Manifest::new(&identity(), 1024).build_id, a);
    }

    #[test]
    fn test_inline_manifest_defaults() {
        let raw = r#"{"files":[{"path":"bin\\a.exe","size":3,"hash":"ABC"}]}"#;
        let manifest: Manifest = serde_json::from_str(raw).unwrap();
        assert_eq!(manifest.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(manifest.install_mode, InstallMode::Direct);
        assert_eq!(manifest.files[0].expected_hash().as_deref(), Some("abc"));
        assert!(manifest.find_file("bin/a.exe").is_some());
    }

    #[test]
    fn test_canonical_json_sorted_and_compact() {
        let manifest = Manifest::new(&identity(), 1024).finalize();
        let json = manifest.canonical_json().unwrap();
        assert!(!json.contains(' '));
        assert!(!json.contains('\n'));
        let archive_pos = json.find("\"archive_cleanup\"").unwrap();
        let version_pos = json.find("\"version\"").unwrap();
        assert!(archive_pos < version_pos);
        assert_eq!(manifest.canonical_hash().unwrap().len(), 64);
    }

    #[test]
    fn test_missing_hash_is_none() {
        let entry = FileEntry {
            path: "a".into(),
            size: 0,
            hash: "  ".into(),
            file_id: String::new(),
            source_path: None,
            chunks: vec![],
        };
        assert!(entry.expected_hash().is_none());
    }

    #[test]
    fn test_install_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&InstallMode::ArchiveChunks).unwrap(),
            "\"archive_chunks\""
        );
        assert_eq!(serde_json::to_string(&Compression::None).unwrap(), "\"none\"");
    }
}
