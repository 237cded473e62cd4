//! TTL manifest cache with an optional on-disk mirror
//!
//! Memory is checked first; on a miss the disk copy is used when it is still
//! within TTL. Disk files are replaced write-then-rename so a reader never
//! sees a partial file. Every `put` sweeps expired entries and evicts the
//! oldest ones past the entry cap. Synthetic manifests are never mirrored to
//! disk.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::service::{ManifestOrigin, ResolvedManifest};
use crate::storage::write_atomic;

struct CachedEntry {
    stored_at: Instant,
    value: Arc<ResolvedManifest>,
}

#[derive(Serialize, Deserialize)]
struct DiskEntry {
    key: String,
    stored_at: i64,
    resolved: ResolvedManifest,
}

pub const DEFAULT_MAX_ENTRIES: usize = 1024;

pub struct ManifestCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, CachedEntry>>,
    disk_dir: Option<PathBuf>,
}

/// Prefix-preserving file name for a cache key.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'.' {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{b:02x}"));
        }
    }
    out
}

impl ManifestCache {
    pub fn new(ttl: Duration, disk_dir: Option<PathBuf>) -> Self {
        Self {
            ttl,
            max_entries: DEFAULT_MAX_ENTRIES,
            entries: Mutex::new(HashMap::new()),
            disk_dir,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    fn disk_path(&self, key: &str) -> Option<PathBuf> {
        self.disk_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", encode_key(key))))
    }

    pub fn get(&self, key: &str) -> Option<Arc<ResolvedManifest>> {
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get(key) {
                Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                    return Some(entry.value.clone());
                }
                Some(_) => {
                    entries.remove(key);
                }
                None => {}
            }
        }

        let path = self.disk_path(key)?;
        let value = Arc::new(self.read_disk(&path)?);
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                key.to_string(),
                CachedEntry {
                    stored_at: Instant::now(),
                    value: value.clone(),
                },
            );
        tracing::debug!(key, "manifest cache disk hit");
        Some(value)
    }

    fn read_disk(&self, path: &Path) -> Option<ResolvedManifest> {
        let raw = std::fs::read(path).ok()?;
        let entry: DiskEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "discarding unreadable cache file");
                let _ = std::fs::remove_file(path);
                return None;
            }
        };
        let age = chrono::Utc::now().timestamp() - entry.stored_at;
        if age < 0 || age as u64 >= self.ttl.as_secs() {
            let _ = std::fs::remove_file(path);
            return None;
        }
        Some(entry.resolved)
    }

    /// Most recently stored fresh entry matching `pred`.
    pub fn find(&self, pred: impl Fn(&ResolvedManifest) -> bool) -> Option<Arc<ResolvedManifest>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|(_, entry)| entry.stored_at.elapsed() < self.ttl)
            .filter(|(_, entry)| pred(&entry.value))
            .max_by(|(ka, a), (kb, b)| a.stored_at.cmp(&b.stored_at).then_with(|| ka.cmp(kb)))
            .map(|(_, entry)| entry.value.clone())
    }

    /// Drop expired entries, then the oldest ones beyond `max_entries - room`.
    fn sweep(&self, entries: &mut HashMap<String, CachedEntry>, room: usize) -> usize {
        let before = entries.len();
        entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);

        let limit = self.max_entries.saturating_sub(room);
        if entries.len() > limit {
            let mut by_age: Vec<(Instant, String)> = entries
                .iter()
                .map(|(key, entry)| (entry.stored_at, key.clone()))
                .collect();
            by_age.sort();
            let excess = entries.len() - limit;
            for (_, key) in by_age.into_iter().take(excess) {
                entries.remove(&key);
            }
        }
        before - entries.len()
    }

    /// Store `value` under every key.
    pub fn put(&self, keys: &[String], value: Arc<ResolvedManifest>) {
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let fresh = keys.iter().filter(|k| !entries.contains_key(*k)).count();
            let swept = self.sweep(&mut entries, fresh);
            if swept > 0 {
                tracing::debug!(swept, "manifest cache swept");
            }
            for key in keys {
                entries.insert(
                    key.clone(),
                    CachedEntry {
                        stored_at: Instant::now(),
                        value: value.clone(),
                    },
                );
            }
        }

        if value.origin == ManifestOrigin::Synthetic {
            return;
        }
        for key in keys {
            let Some(path) = self.disk_path(key) else {
                continue;
            };
            let entry = DiskEntry {
                key: key.clone(),
                stored_at: chrono::Utc::now().timestamp(),
                resolved: (*value).clone(),
            };
            let written = serde_json::to_vec(&entry)
                .map_err(std::io::Error::other)
                .and_then(|bytes| write_atomic(&path, &bytes));
            if let Err(e) = written {
                tracing::warn!(key = %key, error = %e, "failed to write manifest cache file");
            }
        }
    }

    /// Drop the exact `keys` and every key starting with `prefix`.
    pub fn invalidate(&self, keys: &[&str], prefix: &str) -> usize {
        let matches = |key: &str| keys.contains(&key) || (!prefix.is_empty() && key.starts_with(prefix));

        let removed = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let before = entries.len();
            entries.retain(|key, _| !matches(key));
            before - entries.len()
        };

        if let Some(dir) = &self.disk_dir {
            let encoded_keys: Vec<String> = keys.iter().map(|k| format!("{}.json", encode_key(k))).collect();
            let encoded_prefix = encode_key(prefix);
            if let Ok(read_dir) = std::fs::read_dir(dir) {
                for entry in read_dir.filter_map(|e| e.ok()) {
                    let name = entry.file_name().to_string_lossy().to_string();
                    let hit = encoded_keys.contains(&name)
                        || (!prefix.is_empty() && name.starts_with(&encoded_prefix));
                    if hit {
                        let _ = std::fs::remove_file(entry.path());
                    }
                }
            }
        }

        tracing::debug!(removed, prefix, "manifest cache invalidated");
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
