//! Install verification
//!
//! Each manifest file goes through a short decision sequence: existence,
//! size, then a single read that feeds SHA-256 and the fast hash together.
//! Checks are read-only and share nothing, so they fan out across a rayon
//! pool and are joined in manifest order once every worker is done.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::UNIX_EPOCH;
use uuid::Uuid;

use super::index::FileSnapshot;
use crate::manifest::{FileEntry, Manifest};
use crate::storage::cas::HASH_BLOCK_SIZE;
use crate::storage::{normalize_relative_path, safe_join, FastHasher};

pub const MAX_WORKERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Ok,
    Missing,
    Corrupt,
    Error,
}

impl FileStatus {
    pub fn needs_repair(self) -> bool {
        !matches!(self, FileStatus::Ok)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanReason {
    Verified,
    FastHashMatch,
    MissingFile,
    InstallPathMissing,
    SizeMismatch,
    HashMismatch,
    MetadataFailed,
    ReadFailed,
    InvalidPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanEngine {
    FullScan,
    FastDelta,
    InstallPathMissing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVerificationResult {
    pub path: String,
    pub exists: bool,
    pub expected_size: u64,
    #[serde(default)]
    pub actual_size: u64,
    #[serde(default)]
    pub expected_hash: Option<String>,
    #[serde(default)]
    pub actual_hash: Option<String>,
    #[serde(default)]
    pub fast_hash: Option<String>,
    pub status: FileStatus,
    pub reason: ScanReason,
    /// Nanoseconds since the epoch, 0 when unknown.
    #[serde(default)]
    pub modified_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub total: usize,
    pub verified: usize,
    pub missing: usize,
    pub corrupt: usize,
    pub error: usize,
}

impl ScanSummary {
    fn from_results(files: &[FileVerificationResult]) -> Self {
        let count = |status| files.iter().filter(|f| f.status == status).count();
        Self {
            total: files.len(),
            verified: count(FileStatus::Ok),
            missing: count(FileStatus::Missing),
            corrupt: count(FileStatus::Corrupt),
            error: count(FileStatus::Error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    #[serde(default)]
    pub report_id: String,
    #[serde(default)]
    pub install_path: String,
    pub engine: ScanEngine,
    #[serde(default)]
    pub worker_count: usize,
    #[serde(default)]
    pub summary: ScanSummary,
    pub files: Vec<FileVerificationResult>,
    pub hot_fix_queue: Vec<String>,
    #[serde(default = "Utc::now")]
    pub scanned_at: DateTime<Utc>,
}

impl ScanReport {
    fn assemble(install_path: &Path, engine: ScanEngine, worker_count: usize, files: Vec<FileVerificationResult>) -> Self {
        let hot_fix_queue = files
            .iter()
            .filter(|f| f.status.needs_repair())
            .map(|f| f.path.clone())
            .collect();
        Self {
            report_id: Uuid::new_v4().to_string(),
            install_path: install_path.to_string_lossy().to_string(),
            engine,
            worker_count,
            summary: ScanSummary::from_results(&files),
            files,
            hot_fix_queue,
            scanned_at: Utc::now(),
        }
    }
}

/// `clamp(requested, 1, 64)`, default `clamp(2 * cpu, 8, 32)`.
pub fn resolve_workers(requested: Option<usize>) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(8);
    let recommended = (2 * cores).clamp(8, 32);
    requested.unwrap_or(recommended).clamp(1, MAX_WORKERS)
}

fn modified_nanos(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

struct Check<'a> {
    path: String,
    entry: &'a FileEntry,
    expected_hash: Option<String>,
}

impl Check<'_> {
    fn result(
        &self,
        status: FileStatus,
        reason: ScanReason,
        exists: bool,
        actual_size: u64,
        modified_at: i64,
    ) -> FileVerificationResult {
        FileVerificationResult {
            path: self.path.clone(),
            exists,
            expected_size: self.entry.size,
            actual_size,
            expected_hash: self.expected_hash.clone(),
            actual_hash: None,
            fast_hash: None,
            status,
            reason,
            modified_at,
        }
    }
}

/// SHA-256 and fast hash from one pass over the file.
fn hash_both(path: &Path, hasher: &dyn FastHasher) -> io::Result<(String, String)> {
    let mut file = File::open(path)?;
    let mut sha = Sha256::new();
    let mut fast = hasher.start();
    let mut buffer = vec![0u8; HASH_BLOCK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        sha.update(&buffer[..read]);
        fast.update(&buffer[..read]);
    }
    Ok((hex::encode(sha.finalize()), fast.finish()))
}

/// Does the snapshot still describe this file well enough to trust a fast hash?
fn snapshot_usable(snapshot: &FileSnapshot, size: u64, modified_at: i64, expected: Option<&str>) -> bool {
    snapshot.status == FileStatus::Ok
        && snapshot.size == size
        && modified_at != 0
        && snapshot.modified_at == modified_at
        && snapshot.fast_hash.is_some()
        && match expected {
            Some(expected) => snapshot.canonical_hash.as_deref() == Some(expected),
            None => true,
        }
}

/// Verify one file. Never fails: problems become `error` results.
pub fn check_file(
    install_root: &Path,
    entry: &FileEntry,
    hasher: &dyn FastHasher,
    snapshot: Option<&FileSnapshot>,
) -> FileVerificationResult {
    let check = Check {
        path: normalize_relative_path(&entry.path),
        entry,
        expected_hash: entry.expected_hash(),
    };

    let target = match safe_join(install_root, &entry.path) {
        Ok(target) => target,
        Err(_) => return check.result(FileStatus::Error, ScanReason::InvalidPath, false, 0, 0),
    };

    let meta = match std::fs::metadata(&target) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return check.result(FileStatus::Missing, ScanReason::MissingFile, false, 0, 0)
        }
        Err(_) => return check.result(FileStatus::Error, ScanReason::MetadataFailed, true, 0, 0),
    };
    if !meta.is_file() {
        return check.result(FileStatus::Missing, ScanReason::MissingFile, false, 0, 0);
    }

    let actual_size = meta.len();
    let modified_at = modified_nanos(&meta);
    if actual_size != entry.size {
        return check.result(FileStatus::Corrupt, ScanReason::SizeMismatch, true, actual_size, modified_at);
    }

    let Some(expected) = check.expected_hash.clone() else {
        return check.result(FileStatus::Ok, ScanReason::Verified, true, actual_size, modified_at);
    };

    if let Some(snapshot) = snapshot.filter(|s| snapshot_usable(s, actual_size, modified_at, Some(&expected))) {
        if let Ok(fast) = File::open(&target).and_then(|mut f| hasher.hash_reader(&mut f)) {
            if Some(&fast) == snapshot.fast_hash.as_ref() {
                let mut result =
                    check.result(FileStatus::Ok, ScanReason::FastHashMatch, true, actual_size, modified_at);
                result.actual_hash = snapshot.canonical_hash.clone();
                result.fast_hash = Some(fast);
                return result;
            }
        }
    }

    match hash_both(&target, hasher) {
        Ok((sha, fast)) => {
            let (status, reason) = if sha == expected {
                (FileStatus::Ok, ScanReason::Verified)
            } else {
                (FileStatus::Corrupt, ScanReason::HashMismatch)
            };
            let mut result = check.result(status, reason, true, actual_size, modified_at);
            result.actual_hash = Some(sha);
            result.fast_hash = Some(fast);
            result
        }
        Err(_) => check.result(FileStatus::Error, ScanReason::ReadFailed, true, actual_size, modified_at),
    }
}

/// Verify `install_root` against `manifest` with `workers` threads.
///
/// `snapshots`, when given, lets unchanged files be confirmed by fast hash.
pub fn scan_install(
    install_root: &Path,
    manifest: &Manifest,
    hasher: &dyn FastHasher,
    snapshots: Option<&HashMap<String, FileSnapshot>>,
    workers: usize,
) -> ScanReport {
    if !install_root.is_dir() {
        let files = manifest
            .files
            .iter()
            .map(|entry| FileVerificationResult {
                path: normalize_relative_path(&entry.path),
                exists: false,
                expected_size: entry.size,
                actual_size: 0,
                expected_hash: entry.expected_hash(),
                actual_hash: None,
                fast_hash: None,
                status: FileStatus::Missing,
                reason: ScanReason::InstallPathMissing,
                modified_at: 0,
            })
            .collect();
        tracing::info!(install = %install_root.display(), "install path missing, every file queued");
        return ScanReport::assemble(install_root, ScanEngine::InstallPathMissing, 0, files);
    }

    let workers = workers.clamp(1, MAX_WORKERS);
    let run = |entry: &FileEntry| {
        let snapshot = snapshots.and_then(|s| s.get(&normalize_relative_path(&entry.path)));
        check_file(install_root, entry, hasher, snapshot)
    };

    let files: Vec<FileVerificationResult> = match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
        Ok(pool) => pool.install(|| manifest.files.par_iter().map(run).collect()),
        Err(e) => {
            tracing::warn!(error = %e, "scan pool unavailable, scanning sequentially");
            manifest.files.iter().map(run).collect()
        }
    };

    let engine = if snapshots.is_some() {
        ScanEngine::FastDelta
    } else {
        ScanEngine::FullScan
    };
    let report = ScanReport::assemble(install_root, engine, workers, files);
    tracing::info!(
        report_id = %report.report_id,
        install = %report.install_path,
        engine = ?report.engine,
        total = report.summary.total,
        queued = report.hot_fix_queue.len(),
        "scan finished"
    );
    report
}
