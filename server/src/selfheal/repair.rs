//! Repair planning
//!
//! Turns a scan report into the list of files to re-fetch. The report must
//! come from a scan against `manifest`; paths the manifest does not know are
//! dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::scanner::{ScanReason, ScanReport};
use crate::manifest::Manifest;

pub const CHUNK_REFETCH: &str = "chunk_refetch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    NoOp,
    TargetedHotFix,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairQueueItem {
    pub path: String,
    pub expected_size: u64,
    pub expected_hash: Option<String>,
    pub strategy: String,
    pub reason: Option<ScanReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairPlan {
    pub repair_id: String,
    pub report_id: String,
    pub strategy: RepairStrategy,
    pub queue: Vec<RepairQueueItem>,
    pub queue_count: usize,
    pub generated_at: DateTime<Utc>,
}

pub fn plan_repair(report: &ScanReport, manifest: &Manifest) -> RepairPlan {
    let queue: Vec<RepairQueueItem> = report
        .hot_fix_queue
        .iter()
        .filter_map(|path| {
            let entry = manifest.find_file(path)?;
            let reason = report
                .files
                .iter()
                .find(|f| f.path == *path)
                .map(|f| f.reason);
            Some(RepairQueueItem {
                path: path.clone(),
                expected_size: entry.size,
                expected_hash: entry.expected_hash(),
                strategy: CHUNK_REFETCH.to_string(),
                reason,
            })
        })
        .collect();

    let strategy = if queue.is_empty() {
        RepairStrategy::NoOp
    } else {
        RepairStrategy::TargetedHotFix
    };

    RepairPlan {
        repair_id: Uuid::new_v4().to_string(),
        report_id: report.report_id.clone(),
        strategy,
        queue_count: queue.len(),
        queue,
        generated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selfheal::scanner::{FileStatus, FileVerificationResult, ScanEngine, ScanSummary};

    fn manifest() -> Manifest {
        serde_json::from_str(
            r#"{"files": [
                {"path": "a.bin", "size": 1, "hash": "AA"},
                {"path": "b.bin", "size": 2, "hash": "bb"},
                {"path": "c.bin", "size": 3}
            ]}"#,
        )
        .unwrap()
    }

    fn report(queue: &[&str]) -> ScanReport {
        ScanReport {
            report_id: "r-1".into(),
            install_path: "/games/x".into(),
            engine: ScanEngine::FullScan,
            worker_count: 1,
            summary: ScanSummary::default(),
            files: vec![FileVerificationResult {
                path: "a.bin".into(),
                exists: true,
                expected_size: 1,
                actual_size: 1,
                expected_hash: Some("aa".into()),
                actual_hash: Some("ff".into()),
                fast_hash: None,
                status: FileStatus::Corrupt,
                reason: ScanReason::HashMismatch,
                modified_at: 0,
            }],
            hot_fix_queue: queue.iter().map(|s| s.to_string()).collect(),
            scanned_at: Utc::now(),
        }
    }

    #[test]
    fn test_queue_matches_hot_fix_queue_known_paths() {
        let plan = plan_repair(&report(&["a.bin", "stale.bin", "c.bin"]), &manifest());
        assert_eq!(plan.strategy, RepairStrategy::TargetedHotFix);
        let paths: Vec<_> = plan.queue.iter().map(|q| q.path.as_str()).collect();
        assert_eq!(paths, vec!["a.bin", "c.bin"]);
        assert_eq!(plan.queue_count, plan.queue.len());
        assert_eq!(plan.report_id, "r-1");

        let first = &plan.queue[0];
        assert_eq!(first.expected_hash.as_deref(), Some("aa"));
        assert_eq!(first.strategy, CHUNK_REFETCH);
        assert_eq!(first.reason, Some(ScanReason::HashMismatch));
        assert!(plan.queue[1].expected_hash.is_none());
    }

    #[test]
    fn test_empty_queue_is_no_op() {
        let plan = plan_repair(&report(&[]), &manifest());
        assert_eq!(plan.strategy, RepairStrategy::NoOp);
        assert!(plan.queue.is_empty());
        assert_eq!(plan.queue_count, 0);
        assert_eq!(serde_json::to_value(plan.strategy).unwrap(), "no_op");
    }
}
