//! Chunk delivery
//!
//! A chunk is served from the first source that works: synthetic bytes for
//! stub manifests, a slice of a local file (or zip member), then each remote
//! mirror in turn. Remote sources are retried with linear backoff; a 404
//! moves straight to the next mirror. Running out of sources is
//! [`FetchError::ChunkUnavailable`], never a short body.

use reqwest::header::{AUTHORIZATION, RANGE};
use reqwest::StatusCode;
use std::io::{Read, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::config::Config;
use crate::manifest::stub::stub_chunk_bytes;
use crate::manifest::{FileEntry, ManifestOrigin, ResolvedManifest};
use crate::storage::cas::verify_hash;
use crate::storage::safe_join;

/// Largest chunk a single request may ask for.
pub const MAX_CHUNK_REQUEST: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("chunk unavailable: {0}")]
    ChunkUnavailable(String),
    #[error("invalid chunk range: {0}")]
    InvalidRange(String),
    #[error("unknown chunk: {0}")]
    UnknownChunk(String),
}

#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(120),
        }
    }
}

/// Where chunk bytes may come from besides the manifest's own build tree.
#[derive(Debug, Clone, Default)]
pub struct SourceSettings {
    pub source_root: Option<PathBuf>,
    pub remote_base: Option<String>,
    pub remote_mirrors: Vec<String>,
    pub token: Option<String>,
    pub full_fetch_suffixes: Vec<String>,
}

impl SourceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            source_root: config.source_root.clone(),
            remote_base: config.remote_source_url.clone(),
            remote_mirrors: config.remote_source_mirrors.clone(),
            token: config.remote_source_token.clone(),
            full_fetch_suffixes: config.full_fetch_suffixes.clone(),
        }
    }

    fn mirrors(&self) -> Vec<String> {
        self.remote_base
            .iter()
            .chain(self.remote_mirrors.iter())
            .map(|m| m.trim_end_matches('/').to_string())
            .filter(|m| !m.is_empty())
            .collect()
    }

    fn wants_full_fetch(&self, path: &str) -> bool {
        let lower = path.to_ascii_lowercase();
        self.full_fetch_suffixes
            .iter()
            .any(|suffix| lower.ends_with(&suffix.to_ascii_lowercase()))
    }
}

/// Bytes of one chunk, ready to stream.
pub enum ChunkPayload {
    /// File positioned at the chunk offset; exactly `len` bytes follow.
    Local { file: tokio::fs::File, len: u64 },
    Memory(Vec<u8>),
}

impl ChunkPayload {
    pub fn len(&self) -> u64 {
        match self {
            ChunkPayload::Local { len, .. } => *len,
            ChunkPayload::Memory(bytes) => bytes.len() as u64,
        }
    }

    pub async fn into_vec(self) -> std::io::Result<Vec<u8>> {
        match self {
            ChunkPayload::Memory(bytes) => Ok(bytes),
            ChunkPayload::Local { file, len } => {
                let mut out = Vec::with_capacity(len as usize);
                file.take(len).read_to_end(&mut out).await?;
                Ok(out)
            }
        }
    }
}

/// One requested byte range of a manifest file.
#[derive(Debug, Clone, Copy)]
pub struct ChunkRange {
    pub index: u32,
    pub offset: u64,
    pub size: u64,
    /// Covers the whole chunk, so the chunk hash applies.
    pub whole: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChunkSource {
    Synthetic,
    Local(PathBuf),
    ZipMember { archive: PathBuf, member: String },
    Remote { path: String },
}

#[derive(Debug)]
enum AttemptError {
    NotFound,
    Auth(StatusCode),
    Status(StatusCode),
    Transport(String),
    Truncated { expected: u64, actual: u64 },
}

impl AttemptError {
    fn retryable(&self) -> bool {
        match self {
            AttemptError::Status(status) => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
            AttemptError::Transport(_) | AttemptError::Truncated { .. } => true,
            AttemptError::NotFound | AttemptError::Auth(_) => false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct FetchStats {
    pub local_served: u64,
    pub remote_served: u64,
    pub synthetic_served: u64,
    pub unavailable: u64,
}

#[derive(Default)]
struct Counters {
    local_served: AtomicU64,
    remote_served: AtomicU64,
    synthetic_served: AtomicU64,
    unavailable: AtomicU64,
}

pub struct ChunkFetcher {
    policy: FetchPolicy,
    sources: SourceSettings,
    client: reqwest::Client,
    counters: Counters,
}

/// Validate `index`/`size` against the file and its chunk list.
pub fn chunk_range(
    chunk_size: u64,
    file: &FileEntry,
    index: u32,
    size: u64,
) -> Result<ChunkRange, FetchError> {
    if size == 0 || size > MAX_CHUNK_REQUEST {
        return Err(FetchError::InvalidRange(format!(
            "size must be between 1 and {MAX_CHUNK_REQUEST}"
        )));
    }
    let chunk = file
        .chunk(index)
        .ok_or_else(|| FetchError::UnknownChunk(format!("{}#{}", file.file_id, index)))?;
    let offset = index as u64 * chunk_size;
    let end = offset
        .checked_add(size)
        .ok_or_else(|| FetchError::InvalidRange("range overflows".to_string()))?;
    if end > file.size {
        return Err(FetchError::InvalidRange(format!(
            "range {offset}..{end} exceeds file size {}",
            file.size
        )));
    }
    Ok(ChunkRange {
        index,
        offset,
        size,
        whole: chunk.size == size,
    })
}

impl ChunkFetcher {
    pub fn new(policy: FetchPolicy, sources: SourceSettings) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(policy.connect_timeout)
            .read_timeout(policy.read_timeout)
            .build()
            .unwrap_or_default();
        Self {
            policy,
            sources,
            client,
            counters: Counters::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let policy = FetchPolicy {
            max_attempts: config.fetch_max_attempts,
            backoff_base: config.fetch_backoff,
            connect_timeout: config.fetch_connect_timeout,
            read_timeout: config.fetch_read_timeout,
        };
        Self::new(policy, SourceSettings::from_config(config))
    }

    pub fn stats(&self) -> FetchStats {
        FetchStats {
            local_served: self.counters.local_served.load(Ordering::Relaxed),
            remote_served: self.counters.remote_served.load(Ordering::Relaxed),
            synthetic_served: self.counters.synthetic_served.load(Ordering::Relaxed),
            unavailable: self.counters.unavailable.load(Ordering::Relaxed),
        }
    }

    fn plan_sources(&self, resolved: &ResolvedManifest, file: &FileEntry) -> Vec<ChunkSource> {
        if resolved.origin == ManifestOrigin::Synthetic {
            return vec![ChunkSource::Synthetic];
        }

        let mut sources = Vec::new();
        if let Some(root) = &resolved.local_root {
            if let Ok(path) = safe_join(root, &file.path) {
                if path.is_file() {
                    sources.push(ChunkSource::Local(path));
                }
            }
        }

        let remote_path = file.source_path.clone().unwrap_or_else(|| file.path.clone());
        if let Some(root) = &self.sources.source_root {
            if let Some((archive, member)) = remote_path.split_once(".zip!/") {
                if let Ok(archive) = safe_join(root, &format!("{archive}.zip")) {
                    if archive.is_file() {
                        sources.push(ChunkSource::ZipMember {
                            archive,
                            member: member.to_string(),
                        });
                    }
                }
            } else if let Ok(path) = safe_join(root, &remote_path) {
                if path.is_file() && !sources.contains(&ChunkSource::Local(path.clone())) {
                    sources.push(ChunkSource::Local(path));
                }
            }
        }

        if !self.sources.mirrors().is_empty() {
            sources.push(ChunkSource::Remote { path: remote_path });
        }
        sources
    }

    /// Fetch `range` of `file`, trying every source in order.
    pub async fn fetch(
        &self,
        resolved: &ResolvedManifest,
        file: &FileEntry,
        range: ChunkRange,
    ) -> Result<ChunkPayload, FetchError> {
        let label = format!("{}/{}#{}", resolved.manifest.game_id, file.file_id, range.index);
        let expected_hash = file
            .chunk(range.index)
            .map(|c| c.hash.clone())
            .filter(|h| range.whole && !h.is_empty());

        for source in self.plan_sources(resolved, file) {
            let outcome = match &source {
                ChunkSource::Synthetic => {
                    self.counters.synthetic_served.fetch_add(1, Ordering::Relaxed);
                    return Ok(ChunkPayload::Memory(stub_chunk_bytes(
                        &resolved.manifest.game_id,
                        &file.file_id,
                        range.index,
                        range.size,
                    )));
                }
                ChunkSource::Local(path) => open_local_slice(path, range).await,
                ChunkSource::ZipMember { archive, member } => {
                    read_zip_slice(archive.clone(), member.clone(), range).await
                }
                ChunkSource::Remote { path } => {
                    match self.fetch_remote(path, range, expected_hash.as_deref()).await {
                        Some(bytes) => {
                            self.counters.remote_served.fetch_add(1, Ordering::Relaxed);
                            return Ok(ChunkPayload::Memory(bytes));
                        }
                        None => continue,
                    }
                }
            };
            match outcome {
                Ok(payload) => {
                    self.counters.local_served.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(chunk = %label, ?source, "chunk served locally");
                    return Ok(payload);
                }
                Err(e) => {
                    tracing::warn!(chunk = %label, ?source, error = %e, "local source failed");
                }
            }
        }

        self.counters.unavailable.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(chunk = %label, "all chunk sources exhausted");
        Err(FetchError::ChunkUnavailable(label))
    }

    /// Try each mirror; `None` once all are exhausted.
    async fn fetch_remote(
        &self,
        path: &str,
        range: ChunkRange,
        expected_hash: Option<&str>,
    ) -> Option<Vec<u8>> {
        let path = path.trim_start_matches('/');
        let full = self.sources.wants_full_fetch(path);

        for mirror in self.sources.mirrors() {
            let url = format!("{mirror}/{path}");
            let Some(bytes) = self.fetch_from_mirror(&url, range, full).await else {
                continue;
            };
            if let Some(expected) = expected_hash {
                if !verify_hash(&bytes, expected) {
                    tracing::warn!(url = %url, "chunk hash mismatch, trying next mirror");
                    continue;
                }
            }
            return Some(bytes);
        }
        None
    }

    async fn fetch_from_mirror(&self, url: &str, range: ChunkRange, full: bool) -> Option<Vec<u8>> {
        let mut send_token = self.sources.token.is_some();
        let mut attempt = 1u32;

        while attempt <= self.policy.max_attempts {
            match self.fetch_once(url, range, full, send_token).await {
                Ok(bytes) => return Some(bytes),
                Err(AttemptError::NotFound) => {
                    tracing::debug!(url, "404, moving to next mirror");
                    return None;
                }
                Err(AttemptError::Auth(status)) if send_token => {
                    tracing::debug!(url, %status, "auth rejected, retrying without token");
                    send_token = false;
                    continue;
                }
                Err(e) if e.retryable() => {
                    tracing::debug!(url, attempt, error = ?e, "chunk fetch attempt failed");
                }
                Err(e) => {
                    tracing::debug!(url, error = ?e, "chunk fetch failed");
                    return None;
                }
            }
            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.backoff_base * attempt).await;
            }
            attempt += 1;
        }
        None
    }

    async fn fetch_once(
        &self,
        url: &str,
        range: ChunkRange,
        full: bool,
        send_token: bool,
    ) -> Result<Vec<u8>, AttemptError> {
        let mut request = self.client.get(url);
        if !full {
            request = request.header(
                RANGE,
                format!("bytes={}-{}", range.offset, range.offset + range.size - 1),
            );
        }
        if send_token {
            if let Some(token) = &self.sources.token {
                request = request.header(AUTHORIZATION, format!("Bearer {token}"));
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| AttemptError::Transport(e.to_string()))?;
        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => return Err(AttemptError::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(AttemptError::Auth(status)),
            s if !s.is_success() => return Err(AttemptError::Status(s)),
            _ => {}
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AttemptError::Transport(e.to_string()))?;

        // 206 carries the range; 200 carries the whole object
        let bytes = if status == StatusCode::PARTIAL_CONTENT {
            body.to_vec()
        } else {
            let start = range.offset as usize;
            let end = start + range.size as usize;
            if body.len() < end {
                return Err(AttemptError::Truncated {
                    expected: end as u64,
                    actual: body.len() as u64,
                });
            }
            body[start..end].to_vec()
        };
        if bytes.len() as u64 != range.size {
            return Err(AttemptError::Truncated {
                expected: range.size,
                actual: bytes.len() as u64,
            });
        }
        Ok(bytes)
    }
}

async fn open_local_slice(path: &Path, range: ChunkRange) -> std::io::Result<ChunkPayload> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    if len < range.offset + range.size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("local file is {len} bytes, chunk ends at {}", range.offset + range.size),
        ));
    }
    file.seek(SeekFrom::Start(range.offset)).await?;
    Ok(ChunkPayload::Local {
        file,
        len: range.size,
    })
}

async fn read_zip_slice(archive: PathBuf, member: String, range: ChunkRange) -> std::io::Result<ChunkPayload> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&archive)?;
        let mut zip = zip::ZipArchive::new(file).map_err(std::io::Error::other)?;
        let mut entry = zip.by_name(&member).map_err(std::io::Error::other)?;
        // deflate streams are not seekable; skip to the offset
        std::io::copy(&mut (&mut entry).take(range.offset), &mut std::io::sink())?;
        let mut out = Vec::with_capacity(range.size as usize);
        (&mut entry).take(range.size).read_to_end(&mut out)?;
        if out.len() as u64 != range.size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "zip member shorter than chunk",
            ));
        }
        Ok(ChunkPayload::Memory(out))
    })
    .await
    .map_err(std::io::Error::other)?
}
