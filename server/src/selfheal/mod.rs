//! Self-heal: scan an install, then plan the minimal re-fetch.

pub mod index;
pub mod repair;
pub mod scanner;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::manifest::Manifest;
use crate::storage::FastHasher;
use index::FileIndex;
pub use repair::{plan_repair, RepairPlan, RepairStrategy};
pub use scanner::{resolve_workers, FileStatus, ScanEngine, ScanReason, ScanReport};

/// Reports kept for later repair requests.
pub const REPORT_HISTORY: usize = 64;

#[derive(Error, Debug)]
pub enum SelfHealError {
    #[error("invalid repair input: {0}")]
    InvalidRepairInput(String),
    #[error("scan report not found: {0}")]
    ReportNotFound(String),
    #[error("scan task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub install_path: PathBuf,
    pub use_fast_delta: bool,
    pub max_workers: Option<usize>,
}

struct StoredReport {
    report: Arc<ScanReport>,
    manifest: Arc<Manifest>,
}

pub struct SelfHealService {
    hasher: Arc<dyn FastHasher>,
    index: FileIndex,
    reports: Mutex<VecDeque<StoredReport>>,
}

impl SelfHealService {
    pub fn new(hasher: Arc<dyn FastHasher>) -> Self {
        Self {
            hasher,
            index: FileIndex::default(),
            reports: Mutex::new(VecDeque::new()),
        }
    }

    pub fn hasher_name(&self) -> &'static str {
        self.hasher.name()
    }

    /// Scan on the blocking pool, then remember the report and file index.
    pub async fn scan(
        &self,
        manifest: Arc<Manifest>,
        options: ScanOptions,
    ) -> Result<Arc<ScanReport>, SelfHealError> {
        let install_key = options.install_path.to_string_lossy().to_string();
        let snapshots = if options.use_fast_delta {
            self.index.snapshot(&install_key)
        } else {
            None
        };
        let workers = resolve_workers(options.max_workers);
        let hasher = Arc::clone(&self.hasher);
        let scan_manifest = Arc::clone(&manifest);

        let report = tokio::task::spawn_blocking(move || {
            scanner::scan_install(
                &options.install_path,
                &scan_manifest,
                hasher.as_ref(),
                snapshots.as_ref(),
                workers,
            )
        })
        .await
        .map_err(|e| SelfHealError::Task(e.to_string()))?;

        if report.engine != ScanEngine::InstallPathMissing {
            self.index.record(&report);
        }
        let report = Arc::new(report);
        self.remember(Arc::clone(&report), manifest);
        Ok(report)
    }

    fn remember(&self, report: Arc<ScanReport>, manifest: Arc<Manifest>) {
        let mut reports = self.reports.lock().unwrap_or_else(|e| e.into_inner());
        reports.push_back(StoredReport { report, manifest });
        while reports.len() > REPORT_HISTORY {
            reports.pop_front();
        }
    }

    /// A stored report and the manifest it was scanned against.
    pub fn report(&self, report_id: &str) -> Result<(Arc<ScanReport>, Arc<Manifest>), SelfHealError> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .find(|stored| stored.report.report_id == report_id)
            .map(|stored| (Arc::clone(&stored.report), Arc::clone(&stored.manifest)))
            .ok_or_else(|| SelfHealError::ReportNotFound(report_id.to_string()))
    }

    pub fn plan(&self, report: &ScanReport, manifest: &Manifest) -> RepairPlan {
        let plan = plan_repair(report, manifest);
        tracing::info!(
            repair_id = %plan.repair_id,
            report_id = %plan.report_id,
            queued = plan.queue_count,
            "repair plan generated"
        );
        plan
    }

    pub fn stored_reports(&self) -> usize {
        self.reports.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn indexed_installs(&self) -> usize {
        self.index.len()
    }
}
