//! Verify and repair an install through the server's self-heal endpoints.

use std::path::Path;

use crate::api::{ApiClient, Manifest, RepairResponse, ScanReport};
use crate::install::Downloader;

pub fn print_report(report: &ScanReport) {
    let s = &report.summary;
    println!(
        "scan {} ({}): {} files, {} ok, {} missing, {} corrupt, {} error",
        report.report_id, report.engine, s.total, s.verified, s.missing, s.corrupt, s.error
    );
    for file in report.files.iter().filter(|f| f.status != "ok") {
        println!("  {:<8} {:<22} {}", file.status, file.reason, file.path);
    }
}

/// Re-fetch every queued file of `plan` from `manifest`.
pub async fn apply_plan(
    downloader: &Downloader,
    manifest: &Manifest,
    plan: &RepairResponse,
    install: &Path,
) -> anyhow::Result<usize> {
    let mut repaired = 0;
    for item in &plan.repair_plan.queue {
        let Some(file) = manifest.find_file(&item.path) else {
            tracing::warn!(path = %item.path, "queued file missing from manifest, skipped");
            continue;
        };
        downloader.download_file(file, install).await?;
        println!("  repaired {}", item.path);
        repaired += 1;
    }
    Ok(repaired)
}

pub async fn verify(
    api: &ApiClient,
    slug: &str,
    version: Option<&str>,
    install: &Path,
    fast: bool,
) -> anyhow::Result<bool> {
    let report = api
        .scan(slug, version, &install.to_string_lossy(), fast)
        .await?;
    print_report(&report);
    Ok(report.hot_fix_queue.is_empty())
}

pub async fn repair(
    api: &ApiClient,
    downloader: &Downloader,
    slug: &str,
    version: Option<&str>,
    channel: &str,
    install: &Path,
    apply: bool,
) -> anyhow::Result<()> {
    let plan = api
        .repair_plan(slug, version, &install.to_string_lossy(), !apply)
        .await?;
    println!(
        "repair {} for report {}: {} ({} queued)",
        plan.repair_plan.repair_id, plan.report_id, plan.repair_plan.strategy, plan.repair_plan.queue_count
    );
    println!("{}", plan.message);
    for item in &plan.repair_plan.queue {
        println!("  {} ({} bytes)", item.path, item.expected_size);
    }

    if !apply || plan.repair_plan.queue.is_empty() {
        return Ok(());
    }

    let envelope = api.get_manifest(slug, version, channel).await?;
    let repaired = apply_plan(downloader, &envelope.manifest, &plan, install).await?;
    println!("{repaired} file(s) re-fetched");

    // Confirm the repair took
    if !verify(api, slug, Some(&envelope.version), install, false).await? {
        anyhow::bail!("install still has damaged files after repair");
    }
    Ok(())
}
