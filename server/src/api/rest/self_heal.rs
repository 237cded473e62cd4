//! Self-heal routes
//!
//! Scan an install against a manifest and turn reports into repair plans.
//! Plans are never executed here; the client re-fetches the queue.

use crate::api::AppState;
use crate::manifest::{Manifest, ManifestSummary};
use crate::selfheal::{RepairPlan, ScanOptions, ScanReport, SelfHealError};
use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use super::error::AppError;
use super::manifests::DEFAULT_CHANNEL;

// ============================================================================
// ROUTES
// ============================================================================

pub fn self_heal_routes() -> Router<AppState> {
    Router::new()
        .route("/v2/self-heal/scan", post(scan))
        .route("/v2/self-heal/repair", post(repair))
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Deserialize)]
struct ScanRequest {
    install_path: String,
    slug: Option<String>,
    version: Option<String>,
    channel: Option<String>,
    #[serde(default, alias = "use_fast_delta")]
    use_usn_delta: bool,
    max_workers: Option<usize>,
    manifest: Option<Manifest>,
}

#[derive(Serialize)]
struct ScanResponse {
    #[serde(flatten)]
    report: ScanReport,
    slug: Option<String>,
    channel: String,
    version: String,
    manifest_summary: ManifestSummary,
}

#[derive(Deserialize)]
struct RepairRequest {
    report_id: Option<String>,
    scan_report: Option<ScanReport>,
    slug: Option<String>,
    version: Option<String>,
    install_path: Option<String>,
    manifest: Option<Manifest>,
    #[serde(default = "default_dry_run")]
    dry_run: bool,
}

fn default_dry_run() -> bool {
    true
}

#[derive(Serialize)]
struct RepairResponse {
    report_id: String,
    dry_run: bool,
    repair_plan: RepairPlan,
    applied: bool,
    message: String,
}

// ============================================================================
// HANDLERS
// ============================================================================

/// Inline manifest wins; otherwise resolve `slug`.
async fn manifest_for(
    state: &AppState,
    inline: Option<Manifest>,
    slug: Option<&str>,
    version: Option<&str>,
) -> Result<Option<Arc<Manifest>>, AppError> {
    if let Some(manifest) = inline {
        return Ok(Some(Arc::new(manifest)));
    }
    match slug.map(str::trim).filter(|s| !s.is_empty()) {
        Some(slug) => {
            let resolved = state.manifests.resolve(slug, version).await?;
            Ok(Some(Arc::new(resolved.manifest.clone())))
        }
        None => Ok(None),
    }
}

fn install_dir(raw: &str) -> Result<PathBuf, AppError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest("install_path is required".into()));
    }
    Ok(PathBuf::from(trimmed))
}

async fn scan(
    State(state): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> Result<Json<ScanResponse>, AppError> {
    let install_path = install_dir(&req.install_path)?;
    let manifest = manifest_for(&state, req.manifest, req.slug.as_deref(), req.version.as_deref())
        .await?
        .ok_or_else(|| AppError::BadRequest("either slug or manifest is required".into()))?;

    let report = state
        .self_heal
        .scan(
            Arc::clone(&manifest),
            ScanOptions {
                install_path,
                use_fast_delta: req.use_usn_delta,
                max_workers: req.max_workers,
            },
        )
        .await?;

    Ok(Json(ScanResponse {
        report: (*report).clone(),
        slug: req.slug.or_else(|| Some(manifest.slug.clone()).filter(|s| !s.is_empty())),
        channel: req.channel.unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
        version: manifest.version.clone(),
        manifest_summary: manifest.summary(),
    }))
}

async fn repair(
    State(state): State<AppState>,
    Json(req): Json<RepairRequest>,
) -> Result<Json<RepairResponse>, AppError> {
    let (report, manifest) = if let Some(report_id) = &req.report_id {
        state.self_heal.report(report_id)?
    } else if let Some(report) = req.scan_report {
        let manifest = match manifest_for(&state, req.manifest, req.slug.as_deref(), req.version.as_deref()).await? {
            Some(manifest) => manifest,
            None => state
                .self_heal
                .report(&report.report_id)
                .map(|(_, manifest)| manifest)
                .map_err(|_| {
                    SelfHealError::InvalidRepairInput("scan_report needs a slug or manifest".into())
                })?,
        };
        (Arc::new(report), manifest)
    } else if let (Some(slug), Some(install_path)) = (req.slug.as_deref(), req.install_path.as_deref()) {
        let install_path = install_dir(install_path)?;
        let manifest = manifest_for(&state, req.manifest, Some(slug), req.version.as_deref())
            .await?
            .ok_or_else(|| SelfHealError::InvalidRepairInput("slug is empty".into()))?;
        let report = state
            .self_heal
            .scan(
                Arc::clone(&manifest),
                ScanOptions {
                    install_path,
                    use_fast_delta: false,
                    max_workers: None,
                },
            )
            .await?;
        (report, manifest)
    } else {
        return Err(SelfHealError::InvalidRepairInput(
            "provide report_id, scan_report, or slug with install_path".into(),
        )
        .into());
    };

    let plan = state.self_heal.plan(&report, &manifest);
    let message = if plan.queue.is_empty() {
        "install is healthy, nothing to repair".to_string()
    } else if req.dry_run {
        format!("dry run: {} file(s) would be re-fetched", plan.queue_count)
    } else {
        format!(
            "{} file(s) queued; the client must re-fetch them to apply the plan",
            plan.queue_count
        )
    };

    Ok(Json(RepairResponse {
        report_id: report.report_id.clone(),
        dry_run: req.dry_run,
        repair_plan: plan,
        applied: false,
        message,
    }))
}
