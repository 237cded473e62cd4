//! Per-install file index from the previous scan.

use std::collections::HashMap;
use std::sync::Mutex;

use super::scanner::{FileStatus, FileVerificationResult, ScanReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSnapshot {
    pub size: u64,
    pub modified_at: i64,
    pub fast_hash: Option<String>,
    pub canonical_hash: Option<String>,
    pub status: FileStatus,
}

impl FileSnapshot {
    pub fn from_result(result: &FileVerificationResult) -> Self {
        Self {
            size: result.actual_size,
            modified_at: result.modified_at,
            fast_hash: result.fast_hash.clone(),
            canonical_hash: result.actual_hash.clone(),
            status: result.status,
        }
    }
}

/// install path -> relative path -> snapshot
#[derive(Default)]
pub struct FileIndex {
    installs: Mutex<HashMap<String, HashMap<String, FileSnapshot>>>,
}

impl FileIndex {
    pub fn snapshot(&self, install_key: &str) -> Option<HashMap<String, FileSnapshot>> {
        self.installs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(install_key)
            .cloned()
    }

    /// Replace the snapshots of `report.install_path` with this scan's results.
    pub fn record(&self, report: &ScanReport) {
        let files = report
            .files
            .iter()
            .filter(|f| f.exists)
            .map(|f| (f.path.clone(), FileSnapshot::from_result(f)))
            .collect();
        self.installs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(report.install_path.clone(), files);
    }

    pub fn len(&self) -> usize {
        self.installs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
