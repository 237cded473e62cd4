//! Manifest construction from a build directory or a chunk-archive entry.

use rayon::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use super::archive::ArchiveGame;
use super::model::{
    build_id_for, ChunkEntry, Compression, FileEntry, InstallMode, Manifest, ManifestIdentity,
};
use crate::storage::cas::file_id_for;
use crate::storage::{digest_file, normalize_relative_path, FileDigest, DEFAULT_CHUNK_SIZE};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("chunk size must be positive")]
    InvalidChunkSize,
    #[error("walk failed: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Delivery hosts used to build chunk URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdnHosts {
    pub primary: String,
    pub fallbacks: Vec<String>,
}

impl CdnHosts {
    pub fn new(primary: impl Into<String>, fallbacks: Vec<String>) -> Self {
        Self {
            primary: primary.into().trim_end_matches('/').to_string(),
            fallbacks: fallbacks
                .into_iter()
                .map(|h| h.trim_end_matches('/').to_string())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    /// `build` pins the manifest the chunk belongs to, since file ids repeat
    /// across versions of a game.
    pub fn chunk_url(host: &str, chunk: &ChunkAddress<'_>) -> String {
        format!(
            "{host}/cdn/chunks/{}/{}/{}?size={}&build={}",
            chunk.game_id, chunk.file_id, chunk.index, chunk.size, chunk.build_id
        )
    }

    /// Primary URL plus one fallback per fallback host, in order.
    pub fn urls_for(&self, chunk: &ChunkAddress<'_>) -> (String, Vec<String>) {
        let primary = Self::chunk_url(&self.primary, chunk);
        let fallbacks = self
            .fallbacks
            .iter()
            .map(|host| Self::chunk_url(host, chunk))
            .collect();
        (primary, fallbacks)
    }
}

/// Everything a chunk URL is built from.
#[derive(Debug, Clone, Copy)]
pub struct ChunkAddress<'a> {
    pub game_id: &'a str,
    pub build_id: &'a str,
    pub file_id: &'a str,
    pub index: u32,
    pub size: u64,
}

pub(crate) fn file_entry(
    rel_path: &str,
    digest: FileDigest,
    identity: &ManifestIdentity,
    hosts: &CdnHosts,
    source_path: Option<String>,
) -> FileEntry {
    let file_id = file_id_for(rel_path);
    let build_id = build_id_for(&identity.game_id, &identity.version);
    let chunks = digest
        .chunks
        .into_iter()
        .map(|chunk| {
            let (url, fallback_urls) = hosts.urls_for(&ChunkAddress {
                game_id: &identity.game_id,
                build_id: &build_id,
                file_id: &file_id,
                index: chunk.span.index,
                size: chunk.span.size,
            });
            ChunkEntry {
                index: chunk.span.index,
                hash: chunk.hash,
                size: chunk.span.size,
                url,
                fallback_urls,
                compression: Compression::None,
            }
        })
        .collect();
    FileEntry {
        path: rel_path.to_string(),
        size: digest.size,
        hash: digest.hash,
        file_id,
        source_path,
        chunks,
    }
}

/// Regular files under `root`, sorted by name at each level, symlinks skipped.
fn collect_files(root: &Path) -> Result<Vec<(PathBuf, String)>, BuildError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        let rel = normalize_relative_path(&rel);
        if rel.is_empty() {
            continue;
        }
        files.push((entry.into_path(), rel));
    }
    Ok(files)
}

/// Hash every regular file under `root`, in parallel.
pub fn build_from_directory(
    root: &Path,
    identity: &ManifestIdentity,
    chunk_size: u64,
    hosts: &CdnHosts,
) -> Result<Manifest, BuildError> {
    if chunk_size == 0 {
        return Err(BuildError::InvalidChunkSize);
    }
    if !root.is_dir() {
        return Err(BuildError::NotADirectory(root.to_path_buf()));
    }

    let files = collect_files(root)?;
    let entries = files
        .par_iter()
        .map(|(abs, rel)| {
            let digest = digest_file(abs, chunk_size).map_err(|source| BuildError::Io {
                path: abs.clone(),
                source,
            })?;
            Ok(file_entry(rel, digest, identity, hosts, None))
        })
        .collect::<Result<Vec<_>, BuildError>>()?;

    let mut manifest = Manifest::new(identity, chunk_size);
    manifest.files = entries;
    let manifest = manifest.finalize();
    tracing::info!(
        slug = %identity.slug,
        version = %identity.version,
        files = manifest.files.len(),
        total_size = manifest.total_size,
        "built manifest from directory"
    );
    Ok(manifest)
}

/// Re-express each archive chunk as a single-chunk file entry.
pub fn build_from_archive_index(
    game: &ArchiveGame,
    identity: &ManifestIdentity,
    hosts: &CdnHosts,
) -> Manifest {
    let chunk_size = game
        .chunk_size
        .or_else(|| game.chunks.iter().map(|c| c.size).max())
        .filter(|size| *size > 0)
        .unwrap_or(DEFAULT_CHUNK_SIZE);
    let base = game.base_path.trim_matches('/');
    let archive_dir = game
        .archive_dir
        .as_deref()
        .map(normalize_relative_path)
        .filter(|d| !d.is_empty());

    let build_id = build_id_for(&identity.game_id, &identity.version);
    let files = game
        .chunks
        .iter()
        .map(|chunk| {
            let chunk_rel = normalize_relative_path(&chunk.path);
            let path = match &archive_dir {
                Some(dir) => format!("{}/{}", dir.trim_end_matches('/'), chunk_rel),
                None => chunk_rel.clone(),
            };
            let source_path = if base.is_empty() {
                chunk_rel.clone()
            } else {
                format!("{base}/{chunk_rel}")
            };
            let file_id = file_id_for(&path);
            let hash = chunk.sha256.trim().to_ascii_lowercase();
            let (url, fallback_urls) = hosts.urls_for(&ChunkAddress {
                game_id: &identity.game_id,
                build_id: &build_id,
                file_id: &file_id,
                index: 0,
                size: chunk.size,
            });
            FileEntry {
                path,
                size: chunk.size,
                hash: hash.clone(),
                file_id,
                source_path: Some(source_path),
                chunks: vec![ChunkEntry {
                    index: 0,
                    hash,
                    size: chunk.size,
                    url,
                    fallback_urls,
                    compression: Compression::None,
                }],
            }
        })
        .collect();

    let mut manifest = Manifest::new(identity, chunk_size);
    manifest.files = files;
    manifest.install_mode = InstallMode::ArchiveChunks;
    manifest.archive_dir = archive_dir;
    manifest.archive_cleanup = game.cleanup;
    manifest.archive_files = game
        .files
        .iter()
        .map(|f| normalize_relative_path(f))
        .filter(|f| !f.is_empty())
        .collect();
    manifest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::archive::ArchiveChunk;
    use crate::storage::cas::chunk_hash_of_bytes;
    use std::fs;

    fn hosts() -> CdnHosts {
        CdnHosts::new("http://cdn.local/", vec!["http://mirror-a".into(), "".into()])
    }

    fn identity() -> ManifestIdentity {
        ManifestIdentity {
            game_id: "g-42".into(),
            slug: "demo".into(),
            version: "1.0".into(),
        }
    }

    #[test]
    fn test_chunk_urls() {
        let (url, fallbacks) = hosts().urls_for(&ChunkAddress {
            game_id: "g-42",
            build_id: "0123456789abcdef",
            file_id: "abc",
            index: 3,
            size: 99,
        });
        assert_eq!(url, "http://cdn.local/cdn/chunks/g-42/abc/3?size=99&build=0123456789abcdef");
        assert_eq!(
            fallbacks,
            vec!["http://mirror-a/cdn/chunks/g-42/abc/3?size=99&build=0123456789abcdef"]
        );
    }

    #[test]
    fn test_build_from_directory_layout_and_idempotence() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("bin")).unwrap();
        fs::write(temp.path().join("bin/game.exe"), vec![7u8; 2_500]).unwrap();
        fs::write(temp.path().join("readme.txt"), b"hello").unwrap();
        fs::write(temp.path().join("empty.dat"), b"").unwrap();

        let first = build_from_directory(temp.path(), &identity(), 1_000, &hosts()).unwrap();
        let second = build_from_directory(temp.path(), &identity(), 1_000, &hosts()).unwrap();
        assert_eq!(first, second);
        assert!(first.layout_violations().is_empty());

        let exe = first.find_file("bin/game.exe").unwrap();
        assert_eq!(exe.chunks.len(), 3);
        assert_eq!(exe.chunks[2].size, 500);
        assert_eq!(exe.hash, chunk_hash_of_bytes(&vec![7u8; 2_500]));
        assert_eq!(exe.file_id, file_id_for("bin/game.exe"));
        assert_eq!(exe.chunks[0].fallback_urls.len(), 1);

        let empty = first.find_file("empty.dat").unwrap();
        assert!(empty.chunks.is_empty());
        assert_eq!(first.total_size, 2_505);
        assert_eq!(first.compressed_size, first.total_size);
    }

    #[test]
    fn test_build_rejects_missing_root() {
        let temp = tempfile::tempdir().unwrap();
        let err = build_from_directory(&temp.path().join("nope"), &identity(), 1024, &hosts());
        assert!(matches!(err, Err(BuildError::NotADirectory(_))));
        let err = build_from_directory(temp.path(), &identity(), 0, &hosts());
        assert!(matches!(err, Err(BuildError::InvalidChunkSize)));
    }

    #[test]
    fn test_build_from_archive_index() {
        let game = ArchiveGame {
            name: "Demo Game".into(),
            app_id: Some("4242".into()),
            version: Some("1.0".into()),
            updated_at: None,
            archive_dir: Some("_archives".into()),
            cleanup: true,
            base_path: "/demo/1.0/".into(),
            chunk_size: None,
            chunks: vec![
                ArchiveChunk {
                    path: "demo.7z.001".into(),
                    size: 4096,
                    sha256: "AA".into(),
                },
                ArchiveChunk {
                    path: "demo.7z.002".into(),
                    size: 100,
                    sha256: "bb".into(),
                },
            ],
            files: vec!["bin\\demo.exe".into(), "data/a.pak".into()],
        };
        let manifest = build_from_archive_index(&game, &identity(), &hosts());
        assert_eq!(manifest.install_mode, InstallMode::ArchiveChunks);
        assert_eq!(manifest.chunk_size, 4096);
        assert_eq!(manifest.files.len(), 2);
        let first = &manifest.files[0];
        assert_eq!(first.path, "_archives/demo.7z.001");
        assert_eq!(first.source_path.as_deref(), Some("demo/1.0/demo.7z.001"));
        assert_eq!(first.hash, "aa");
        assert_eq!(first.chunks.len(), 1);
        assert!(manifest.archive_files.contains("bin/demo.exe"));
        assert!(manifest.archive_cleanup);
        assert_eq!(manifest.total_size, 4196);
        assert!(manifest.layout_violations().is_empty());
    }
}
