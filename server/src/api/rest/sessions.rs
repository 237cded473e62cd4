//! Download session routes (v2)
//!
//! Creating a session resolves its manifest and records the transfer plan,
//! leaving the session in `chunk_transfer`. Clients poll `/state` and stop
//! their own transfers once it reports `cancelled`.

use crate::api::AppState;
use crate::session::{
    ControlAction, DownloadSession, NewSession, SessionStatus, Stage, TaskSnapshot,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::AppError;
use super::manifests::DEFAULT_CHANNEL;

// ============================================================================
// ROUTES
// ============================================================================

pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/v2/download-sessions", post(create_session))
        .route("/v2/download-sessions/:id/control", post(control_session))
        .route("/v2/download-sessions/:id/state", get(session_state))
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Deserialize)]
struct CreateSessionRequest {
    slug: String,
    version: Option<String>,
    channel: Option<String>,
    method: Option<String>,
    user_id: Option<String>,
    download_id: Option<String>,
    install_path: Option<String>,
    meta: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ControlRequest {
    action: ControlAction,
}

#[derive(Serialize)]
struct SessionResponse {
    session: DownloadSession,
    task: Option<TaskSnapshot>,
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), AppError> {
    let slug = req.slug.trim();
    if slug.is_empty() {
        return Err(AppError::BadRequest("slug is required".into()));
    }
    let resolved = state.manifests.resolve(slug, req.version.as_deref()).await?;
    let manifest = &resolved.manifest;

    let session = state.sessions.create(NewSession {
        user_id: req.user_id,
        download_id: req.download_id,
        game_id: manifest.game_id.clone(),
        slug: manifest.slug.clone(),
        channel: req.channel.unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
        method: req.method.unwrap_or_else(|| "chunks".to_string()),
        version: manifest.version.clone(),
        install_path: req.install_path,
        meta: req.meta.filter(|m| m.is_object()),
    });

    let summary = manifest.summary();
    let canonical_hash = manifest
        .canonical_hash()
        .map_err(|e| AppError::Internal(format!("canonical manifest encoding failed: {e}")))?;
    state.sessions.set_stage(session.id, Stage::PlanBuild, None)?;
    state.sessions.merge_meta(
        session.id,
        serde_json::json!({
            "plan": {
                "build_id": summary.build_id,
                "canonical_hash": canonical_hash,
                "origin": resolved.origin,
                "file_count": summary.file_count,
                "chunk_count": summary.chunk_count,
                "total_size": summary.total_size,
            }
        }),
    )?;
    let session = state
        .sessions
        .set_stage(session.id, Stage::ChunkTransfer, Some(SessionStatus::Downloading))?;

    let task = TaskSnapshot::from_session(&session);
    state.tasks.upsert(task.clone());

    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            session,
            task: Some(task),
        }),
    ))
}

async fn control_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state.sessions.control(id, req.action)?;
    let task = match state.tasks.update_status(&session.download_id, session.status) {
        Some(task) => Some(task),
        None => {
            let task = TaskSnapshot::from_session(&session);
            state.tasks.upsert(task.clone());
            Some(task)
        }
    };
    Ok(Json(SessionResponse { session, task }))
}

async fn session_state(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state.sessions.get(id)?;
    let task = state.tasks.get(&session.download_id);
    Ok(Json(SessionResponse { session, task }))
}

#[cfg(test)]
mod tests {
    use super::super::{router, testing};
    use axum::http::StatusCode;
    use serde_json::json;
    use std::fs;

    fn app() -> (tempfile::TempDir, axum::Router) {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("demo")).unwrap();
        fs::write(temp.path().join("demo/game.bin"), vec![3u8; 4000]).unwrap();
        let app = router(testing::state(temp.path()));
        (temp, app)
    }

    #[tokio::test]
    async fn test_create_advances_to_chunk_transfer() {
        let (_tree, app) = app();
        let (status, body) = testing::send_json(
            &app,
            "POST",
            "/v2/download-sessions",
            json!({"slug": "demo", "download_id": "dl-7", "install_path": "/games/demo"}),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let session = &body["session"];
        assert_eq!(session["stage"], "chunk_transfer");
        assert_eq!(session["status"], "downloading");
        assert_eq!(session["channel"], "stable");
        assert_eq!(session["meta"]["plan"]["chunk_count"], 4);
        assert_eq!(session["meta"]["plan"]["origin"], "native");
        assert_eq!(body["task"]["download_id"], "dl-7");
    }

    #[tokio::test]
    async fn test_pause_resume_cancel_round() {
        let (_tree, app) = app();
        let (_, created) =
            testing::send_json(&app, "POST", "/v2/download-sessions", json!({"slug": "demo"})).await;
        let id = created["session"]["id"].as_str().unwrap().to_string();
        let control = format!("/v2/download-sessions/{id}/control");

        let (_, paused) = testing::send_json(&app, "POST", &control, json!({"action": "pause"})).await;
        assert_eq!(paused["session"]["stage"], "transfer_paused");
        assert_eq!(paused["task"]["status"], "paused");

        let (_, resumed) = testing::send_json(&app, "POST", &control, json!({"action": "resume"})).await;
        assert_eq!(resumed["session"]["stage"], "chunk_transfer");

        let (_, cancelled) = testing::send_json(&app, "POST", &control, json!({"action": "cancel"})).await;
        assert_eq!(cancelled["session"]["stage"], "cancelled");

        let (status, state) =
            testing::get_json(&app, &format!("/v2/download-sessions/{id}/state")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state["session"]["status"], "cancelled");
        assert_eq!(state["task"]["status"], "cancelled");
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let (_tree, app) = app();
        let id = uuid::Uuid::new_v4();
        let (status, _) = testing::get_json(&app, &format!("/v2/download-sessions/{id}/state")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = testing::send_json(
            &app,
            "POST",
            &format!("/v2/download-sessions/{id}/control"),
            json!({"action": "pause"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
