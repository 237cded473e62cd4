//! Admin routes
//!
//! Server info, counters, and manifest version overrides.

use crate::api::AppState;
use crate::delivery::fetcher::FetchStats;
use crate::manifest::service::ManifestStats;
use axum::{
    extract::{Path, State},
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::error::AppError;

// ============================================================================
// ROUTES
// ============================================================================

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/admin/stats", get(get_stats))
        .route("/server/info", get(get_server_info))
        .route(
            "/admin/manifests/:slug/version",
            put(set_version_override).delete(clear_version_override),
        )
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Serialize)]
struct ServerInfo {
    name: String,
    version: String,
    fast_hash: &'static str,
    chunk_size: u64,
}

#[derive(Serialize)]
struct StatsResponse {
    manifests: ManifestStats,
    delivery: FetchStats,
    sessions: usize,
    stored_reports: usize,
    indexed_installs: usize,
}

#[derive(Deserialize)]
struct VersionOverrideRequest {
    version: String,
}

#[derive(Serialize)]
struct VersionOverrideResponse {
    slug: String,
    version: Option<String>,
    cleared: bool,
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn get_server_info(State(state): State<AppState>) -> Json<ServerInfo> {
    Json(ServerInfo {
        name: state.config.server_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        fast_hash: state.self_heal.hasher_name(),
        chunk_size: state.config.chunk_size,
    })
}

async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        manifests: state.manifests.stats(),
        delivery: state.fetcher.stats(),
        sessions: state.sessions.len(),
        stored_reports: state.self_heal.stored_reports(),
        indexed_installs: state.self_heal.indexed_installs(),
    })
}

async fn set_version_override(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(req): Json<VersionOverrideRequest>,
) -> Result<Json<VersionOverrideResponse>, AppError> {
    let version = req.version.trim();
    if version.is_empty() {
        return Err(AppError::BadRequest("version is required".into()));
    }
    state.manifests.set_version_override(&slug, version);
    Ok(Json(VersionOverrideResponse {
        slug,
        version: Some(version.to_string()),
        cleared: false,
    }))
}

async fn clear_version_override(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<VersionOverrideResponse>, AppError> {
    if !state.manifests.clear_version_override(&slug) {
        return Err(AppError::NotFound(format!("no version override for {slug}")));
    }
    Ok(Json(VersionOverrideResponse {
        slug,
        version: None,
        cleared: true,
    }))
}

#[cfg(test)]
mod tests {
    use super::super::{router, testing};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use std::fs;

    #[tokio::test]
    async fn test_server_info() {
        let temp = tempfile::tempdir().unwrap();
        let app = router(testing::state(temp.path()));
        let (status, body) = testing::get_json(&app, "/server/info").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Depot");
        assert_eq!(body["fast_hash"], "blake3");
        assert_eq!(body["chunk_size"], 1024);
    }

    #[tokio::test]
    async fn test_version_override_switches_default() {
        let temp = tempfile::tempdir().unwrap();
        for (version, len) in [("1.0", 10usize), ("2.0", 20)] {
            let dir = temp.path().join("demo").join(version);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("game.bin"), vec![1u8; len]).unwrap();
        }
        let app = router(testing::state(temp.path()));

        let (status, _) = testing::send_json(
            &app,
            "PUT",
            "/admin/manifests/demo/version",
            json!({"version": "2.0"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, envelope) = testing::get_json(&app, "/manifests/v2/demo").await;
        assert_eq!(envelope["version"], "2.0");
        assert_eq!(envelope["manifest"]["total_size"], 20);

        let delete = Request::delete("/admin/manifests/demo/version").body(Body::empty()).unwrap();
        let (status, _) = testing::send(&app, delete).await;
        assert_eq!(status, StatusCode::OK);
        let delete = Request::delete("/admin/manifests/demo/version").body(Body::empty()).unwrap();
        let (status, _) = testing::send(&app, delete).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, stats) = testing::get_json(&app, "/admin/stats").await;
        assert_eq!(stats["manifests"]["version_overrides"], 0);
        assert_eq!(stats["sessions"], 0);
    }
}
