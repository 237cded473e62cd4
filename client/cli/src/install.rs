//! Chunked install
//!
//! Chunks of a file are fetched concurrently, possibly out of order, and
//! written strictly in index order through a small reorder buffer so the
//! whole-file hash is computed in the same pass. Files land under a `.part`
//! name and are renamed only once size and hash check out.

use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::api::{ApiClient, ChunkEntry, FileEntry, Manifest};

const ATTEMPTS_PER_URL: u32 = 2;

/// Polls the server-side session between chunks (cooperative cancellation).
pub struct SessionGate {
    api: Arc<ApiClient>,
    id: Uuid,
    interval: Duration,
    last_check: Mutex<Option<Instant>>,
}

impl SessionGate {
    pub fn new(api: Arc<ApiClient>, id: Uuid) -> Self {
        Self {
            api,
            id,
            interval: Duration::from_secs(1),
            last_check: Mutex::new(None),
        }
    }

    /// Returns once the session may transfer; waits while paused.
    pub async fn checkpoint(&self) -> anyhow::Result<()> {
        let mut last = self.last_check.lock().await;
        if last.map(|t| t.elapsed() < self.interval).unwrap_or(false) {
            return Ok(());
        }
        loop {
            let state = self.api.session_state(self.id).await?;
            match state.session.status.as_str() {
                "cancelled" => anyhow::bail!("download session {} was cancelled", self.id),
                "paused" => {
                    tracing::debug!(session = %self.id, "session paused, waiting");
                    tokio::time::sleep(self.interval).await;
                }
                _ => break,
            }
        }
        *last = Some(Instant::now());
        Ok(())
    }
}

/// Resolve a manifest path under `root`, refusing anything that escapes it.
pub fn target_path(root: &Path, relative: &str) -> anyhow::Result<PathBuf> {
    let relative = Path::new(relative);
    if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
        anyhow::bail!("unsafe manifest path: {}", relative.display());
    }
    Ok(root.join(relative))
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}

/// Fetch one chunk from its URLs in order, verifying size and hash.
pub async fn fetch_chunk(http: &reqwest::Client, chunk: &ChunkEntry) -> anyhow::Result<Vec<u8>> {
    for url in chunk.urls() {
        for attempt in 1..=ATTEMPTS_PER_URL {
            let resp = match http.get(&url).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::debug!(url = %url, attempt, error = %e, "chunk request failed");
                    tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
                    continue;
                }
            };
            let status = resp.status();
            if !status.is_success() {
                tracing::debug!(url = %url, %status, "chunk request rejected");
                if status.is_server_error() || status.as_u16() == 429 || status.as_u16() == 408 {
                    tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
                    continue;
                }
                break;
            }
            let bytes = match resp.bytes().await {
                Ok(bytes) => bytes.to_vec(),
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, "chunk body interrupted");
                    continue;
                }
            };
            if bytes.len() as u64 != chunk.size {
                tracing::warn!(url = %url, got = bytes.len(), want = chunk.size, "short chunk");
                continue;
            }
            if !chunk.hash.is_empty() && hex::encode(Sha256::digest(&bytes)) != chunk.hash.to_ascii_lowercase() {
                tracing::warn!(url = %url, index = chunk.index, "chunk hash mismatch, trying next mirror");
                break;
            }
            return Ok(bytes);
        }
    }
    anyhow::bail!("chunk {} unavailable from every mirror", chunk.index)
}

/// Writes chunk payloads in position order, hashing as it goes.
struct OrderedWriter {
    file: tokio::fs::File,
    hasher: Sha256,
    next: usize,
    pending: BTreeMap<usize, Vec<u8>>,
    written: u64,
}

impl OrderedWriter {
    fn new(file: tokio::fs::File) -> Self {
        Self {
            file,
            hasher: Sha256::new(),
            next: 0,
            pending: BTreeMap::new(),
            written: 0,
        }
    }

    /// Buffer `bytes` for `position`, then flush every contiguous payload.
    async fn accept(&mut self, position: usize, bytes: Vec<u8>) -> std::io::Result<u64> {
        self.pending.insert(position, bytes);
        let mut flushed = 0;
        while let Some(bytes) = self.pending.remove(&self.next) {
            self.file.write_all(&bytes).await?;
            self.hasher.update(&bytes);
            flushed += bytes.len() as u64;
            self.next += 1;
        }
        self.written += flushed;
        Ok(flushed)
    }

    async fn finish(mut self) -> std::io::Result<(u64, String)> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok((self.written, hex::encode(self.hasher.finalize())))
    }
}

pub struct Downloader {
    http: reqwest::Client,
    parallel: usize,
    gate: Option<Arc<SessionGate>>,
    progress: ProgressBar,
}

impl Downloader {
    pub fn new(http: reqwest::Client, parallel: usize, gate: Option<Arc<SessionGate>>) -> Self {
        Self {
            http,
            parallel: parallel.max(1),
            gate,
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_progress(mut self, total: u64) -> Self {
        let bar = ProgressBar::new(total);
        if let Ok(style) =
            ProgressStyle::with_template("{bar:40} {bytes}/{total_bytes} {bytes_per_sec} {msg}")
        {
            bar.set_style(style);
        }
        self.progress = bar;
        self
    }

    pub async fn install(&self, manifest: &Manifest, root: &Path) -> anyhow::Result<u64> {
        let mut total = 0;
        for file in &manifest.files {
            total += self.download_file(file, root).await?;
        }
        self.progress.finish_with_message("done");
        Ok(total)
    }

    /// Download `file` under `root`, replacing any existing copy.
    pub async fn download_file(&self, file: &FileEntry, root: &Path) -> anyhow::Result<u64> {
        let target = target_path(root, &file.path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = part_path(&target);
        self.progress.set_message(file.path.clone());

        let result = self.write_part(file, &part).await;
        match result {
            Ok(()) => {
                tokio::fs::rename(&part, &target).await?;
                tracing::info!(path = %file.path, size = file.size, "file installed");
                Ok(file.size)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }

    async fn write_part(&self, file: &FileEntry, part: &Path) -> anyhow::Result<()> {
        let mut chunks = file.chunks.clone();
        chunks.sort_by_key(|c| c.index);
        let mut writer = OrderedWriter::new(tokio::fs::File::create(part).await?);
        let mut queue = chunks.into_iter().enumerate();
        let mut in_flight = JoinSet::new();

        loop {
            while in_flight.len() < self.parallel {
                let Some((position, chunk)) = queue.next() else {
                    break;
                };
                if let Some(gate) = &self.gate {
                    if let Err(e) = gate.checkpoint().await {
                        in_flight.abort_all();
                        return Err(e);
                    }
                }
                let http = self.http.clone();
                in_flight.spawn(async move { (position, fetch_chunk(&http, &chunk).await) });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let (position, fetched) = joined?;
            let bytes = match fetched {
                Ok(bytes) => bytes,
                Err(e) => {
                    in_flight.abort_all();
                    return Err(e.context(format!("downloading {}", file.path)));
                }
            };
            let flushed = writer.accept(position, bytes).await?;
            self.progress.inc(flushed);
        }

        let (written, hash) = writer.finish().await?;
        if written != file.size {
            anyhow::bail!("{}: wrote {} bytes, expected {}", file.path, written, file.size);
        }
        if !file.hash.is_empty() && hash != file.hash.to_ascii_lowercase() {
            anyhow::bail!("{}: file hash mismatch after reassembly", file.path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path as UrlPath, http::StatusCode, routing::get, Router};

    fn content() -> Vec<u8> {
        (0..2500u32).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn sha(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    async fn origin() -> String {
        async fn good(UrlPath(index): UrlPath<usize>) -> Vec<u8> {
            let data = content();
            let start = index * 1024;
            data[start..(start + 1024).min(data.len())].to_vec()
        }
        async fn corrupt(UrlPath(index): UrlPath<usize>) -> Vec<u8> {
            let mut bytes = good(UrlPath(index)).await;
            bytes[0] ^= 0xFF;
            bytes
        }
        let app = Router::new()
            .route("/good/:index", get(good))
            .route("/corrupt/:index", get(corrupt))
            .route("/missing/:index", get(|| async { StatusCode::NOT_FOUND }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn entry(base: &str, primary: [&str; 3], file_hash: String) -> FileEntry {
        let data = content();
        let chunks = (0..3)
            .map(|i| {
                let start = i * 1024;
                let end = (start + 1024).min(data.len());
                ChunkEntry {
                    index: i as u32,
                    hash: sha(&data[start..end]),
                    size: (end - start) as u64,
                    url: format!("{base}/{}/{i}", primary[i]),
                    fallback_urls: vec![format!("{base}/good/{i}")],
                }
            })
            .collect();
        FileEntry {
            path: "bin/game.bin".into(),
            size: data.len() as u64,
            hash: file_hash,
            file_id: "f".into(),
            chunks,
        }
    }

    #[tokio::test]
    async fn test_mirror_fallback_and_reassembly() {
        let base = origin().await;
        let root = tempfile::tempdir().unwrap();
        let file = entry(&base, ["good", "missing", "corrupt"], sha(&content()));

        let downloader = Downloader::new(reqwest::Client::new(), 3, None);
        let written = downloader.download_file(&file, root.path()).await.unwrap();
        assert_eq!(written, 2500);
        let installed = std::fs::read(root.path().join("bin/game.bin")).unwrap();
        assert_eq!(installed, content());
        assert!(!root.path().join("bin/game.bin.part").exists());
    }

    #[tokio::test]
    async fn test_file_hash_mismatch_leaves_nothing() {
        let base = origin().await;
        let root = tempfile::tempdir().unwrap();
        let file = entry(&base, ["good", "good", "good"], "00".repeat(32));

        let downloader = Downloader::new(reqwest::Client::new(), 2, None);
        let err = downloader.download_file(&file, root.path()).await.unwrap_err();
        assert!(err.to_string().contains("hash mismatch"));
        assert!(!root.path().join("bin/game.bin").exists());
        assert!(!root.path().join("bin/game.bin.part").exists());
    }

    #[tokio::test]
    async fn test_ordered_writer_reorders() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let mut writer = OrderedWriter::new(tokio::fs::File::create(&path).await.unwrap());
        assert_eq!(writer.accept(2, b"cc".to_vec()).await.unwrap(), 0);
        assert_eq!(writer.accept(0, b"a".to_vec()).await.unwrap(), 1);
        assert_eq!(writer.accept(1, b"bb".to_vec()).await.unwrap(), 4);
        let (written, hash) = writer.finish().await.unwrap();
        assert_eq!(written, 5);
        assert_eq!(hash, sha(b"abbcc"));
        assert_eq!(std::fs::read(&path).unwrap(), b"abbcc");
    }

    #[test]
    fn test_target_path_rejects_escape() {
        let root = Path::new("/games/demo");
        assert!(target_path(root, "../etc/passwd").is_err());
        assert!(target_path(root, "/etc/passwd").is_err());
        assert_eq!(target_path(root, "a/b.bin").unwrap(), root.join("a/b.bin"));
    }
}
