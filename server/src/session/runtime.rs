//! v2 download sessions
//!
//! A shared table of pipeline annotations. The runtime never drives a
//! download itself: callers push stages as their own work progresses and
//! poll the status to honour pause and cancel. Finished sessions are
//! dropped once they have been idle for the retention period.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ManifestFetch,
    PlanBuild,
    ChunkTransfer,
    Verify,
    Finalize,
    TransferPaused,
    Cancelled,
}

impl Stage {
    /// Position on the main pipeline; side states have none.
    fn position(self) -> Option<u8> {
        match self {
            Stage::ManifestFetch => Some(0),
            Stage::PlanBuild => Some(1),
            Stage::ChunkTransfer => Some(2),
            Stage::Verify => Some(3),
            Stage::Finalize => Some(4),
            Stage::TransferPaused | Stage::Cancelled => None,
        }
    }

    pub fn can_move_to(self, next: Stage) -> bool {
        if self == next || next == Stage::Cancelled {
            return true;
        }
        match (self, next) {
            (Stage::ChunkTransfer, Stage::TransferPaused) => true,
            (Stage::TransferPaused, Stage::ChunkTransfer) => true,
            _ => match (self.position(), next.position()) {
                (Some(from), Some(to)) => to > from,
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Queued,
    Downloading,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Cancelled | SessionStatus::Completed | SessionStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("download session not found: {0}")]
    NotFound(Uuid),
    #[error("session {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition { id: Uuid, from: Stage, to: Stage },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSession {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub download_id: String,
    pub game_id: String,
    pub slug: String,
    pub channel: String,
    pub method: String,
    pub version: String,
    pub status: SessionStatus,
    pub stage: Stage,
    pub install_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub user_id: Option<String>,
    pub download_id: Option<String>,
    pub game_id: String,
    pub slug: String,
    pub channel: String,
    pub method: String,
    pub version: String,
    pub install_path: Option<String>,
    pub meta: Option<serde_json::Value>,
}

/// How long a finished session stays queryable after its last update.
pub const SESSION_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

pub struct SessionRuntime {
    sessions: Mutex<HashMap<Uuid, DownloadSession>>,
    retention: Duration,
}

impl Default for SessionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRuntime {
    pub fn new() -> Self {
        Self::with_retention(SESSION_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            retention,
        }
    }

    pub fn create(&self, new: NewSession) -> DownloadSession {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let session = DownloadSession {
            id,
            user_id: new.user_id,
            download_id: new.download_id.unwrap_or_else(|| id.to_string()),
            game_id: new.game_id,
            slug: new.slug,
            channel: new.channel,
            method: new.method,
            version: new.version,
            status: SessionStatus::Queued,
            stage: Stage::ManifestFetch,
            install_path: new.install_path,
            created_at: now,
            updated_at: now,
            meta: new.meta.unwrap_or_else(|| serde_json::json!({})),
        };
        {
            let mut sessions = self.lock();
            let swept = self.sweep_locked(&mut sessions);
            if swept > 0 {
                tracing::debug!(swept, "finished sessions dropped");
            }
            sessions.insert(id, session.clone());
        }
        tracing::info!(session_id = %id, slug = %session.slug, version = %session.version, "download session created");
        session
    }

    pub fn get(&self, id: Uuid) -> Result<DownloadSession, SessionError> {
        self.lock().get(&id).cloned().ok_or(SessionError::NotFound(id))
    }

    /// Force the stage and status of `action`. Cancelled sessions can be
    /// resumed; rejecting that is up to the caller.
    pub fn control(&self, id: Uuid, action: ControlAction) -> Result<DownloadSession, SessionError> {
        let (status, stage) = match action {
            ControlAction::Pause => (SessionStatus::Paused, Stage::TransferPaused),
            ControlAction::Resume => (SessionStatus::Downloading, Stage::ChunkTransfer),
            ControlAction::Cancel => (SessionStatus::Cancelled, Stage::Cancelled),
        };
        let session = self.mutate(id, |session| {
            session.status = status;
            session.stage = stage;
            Ok(())
        })?;
        tracing::info!(session_id = %id, ?action, "session control applied");
        Ok(session)
    }

    /// Advance along the pipeline. Moving to `cancelled` also cancels the
    /// status, and a cancelled session keeps that status.
    pub fn set_stage(
        &self,
        id: Uuid,
        stage: Stage,
        status: Option<SessionStatus>,
    ) -> Result<DownloadSession, SessionError> {
        self.mutate(id, |session| {
            if !session.stage.can_move_to(stage) {
                return Err(SessionError::InvalidTransition {
                    id,
                    from: session.stage,
                    to: stage,
                });
            }
            session.stage = stage;
            if stage == Stage::Cancelled {
                session.status = SessionStatus::Cancelled;
            } else if let Some(status) = status {
                session.status = status;
            }
            Ok(())
        })
    }

    /// Merge `patch` object keys into the session meta.
    pub fn merge_meta(&self, id: Uuid, patch: serde_json::Value) -> Result<DownloadSession, SessionError> {
        self.mutate(id, |session| {
            if let (Some(meta), serde_json::Value::Object(patch)) = (session.meta.as_object_mut(), patch) {
                meta.extend(patch);
            }
            Ok(())
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Drop finished sessions idle for longer than the retention period.
    pub fn sweep_finished(&self) -> usize {
        let mut sessions = self.lock();
        self.sweep_locked(&mut sessions)
    }

    fn sweep_locked(&self, sessions: &mut HashMap<Uuid, DownloadSession>) -> usize {
        let now = Utc::now();
        let before = sessions.len();
        sessions.retain(|_, session| {
            let idle = (now - session.updated_at).to_std().unwrap_or(Duration::ZERO);
            !(session.status.is_terminal() && idle >= self.retention)
        });
        before - sessions.len()
    }

    /// Apply `change` and bump `updated_at` under one lock.
    fn mutate<F>(&self, id: Uuid, change: F) -> Result<DownloadSession, SessionError>
    where
        F: FnOnce(&mut DownloadSession) -> Result<(), SessionError>,
    {
        let mut sessions = self.lock();
        let session = sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        change(session)?;
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, DownloadSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime_with_session() -> (SessionRuntime, Uuid) {
        let runtime = SessionRuntime::new();
        let session = runtime.create(NewSession {
            game_id: "g-1".into(),
            slug: "nebula".into(),
            channel: "stable".into(),
            method: "chunks".into(),
            version: "1.0".into(),
            ..Default::default()
        });
        (runtime, session.id)
    }

    #[test]
    fn test_create_defaults() {
        let (runtime, id) = runtime_with_session();
        let session = runtime.get(id).unwrap();
        assert_eq!(session.stage, Stage::ManifestFetch);
        assert_eq!(session.status, SessionStatus::Queued);
        assert_eq!(session.download_id, id.to_string());
        assert_eq!(session.meta, serde_json::json!({}));
    }

    #[test]
    fn test_pause_resume_cancel() {
        let (runtime, id) = runtime_with_session();
        runtime.set_stage(id, Stage::PlanBuild, None).unwrap();
        runtime
            .set_stage(id, Stage::ChunkTransfer, Some(SessionStatus::Downloading))
            .unwrap();

        let paused = runtime.control(id, ControlAction::Pause).unwrap();
        assert_eq!(paused.stage, Stage::TransferPaused);
        assert_eq!(paused.status, SessionStatus::Paused);

        let resumed = runtime.control(id, ControlAction::Resume).unwrap();
        assert_eq!(resumed.stage, Stage::ChunkTransfer);
        assert_eq!(resumed.status, SessionStatus::Downloading);

        let cancelled = runtime.control(id, ControlAction::Cancel).unwrap();
        assert_eq!(cancelled.stage, Stage::Cancelled);
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
        assert!(cancelled.updated_at >= resumed.updated_at);
    }

    #[test]
    fn test_stage_rules() {
        assert!(Stage::ManifestFetch.can_move_to(Stage::ChunkTransfer));
        assert!(Stage::Verify.can_move_to(Stage::Verify));
        assert!(Stage::TransferPaused.can_move_to(Stage::ChunkTransfer));
        assert!(Stage::Finalize.can_move_to(Stage::Cancelled));
        assert!(!Stage::Verify.can_move_to(Stage::PlanBuild));
        assert!(!Stage::PlanBuild.can_move_to(Stage::TransferPaused));
        assert!(!Stage::TransferPaused.can_move_to(Stage::Verify));
        assert!(!Stage::Cancelled.can_move_to(Stage::ChunkTransfer));
    }

    #[test]
    fn test_set_stage_rejects_backwards() {
        let (runtime, id) = runtime_with_session();
        runtime.set_stage(id, Stage::Verify, None).unwrap();
        let err = runtime.set_stage(id, Stage::PlanBuild, None).unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidTransition {
                id,
                from: Stage::Verify,
                to: Stage::PlanBuild
            }
        );
        assert_eq!(runtime.get(id).unwrap().stage, Stage::Verify);

        let cancelled = runtime.set_stage(id, Stage::Cancelled, None).unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
    }

    #[test]
    fn test_unknown_session() {
        let runtime = SessionRuntime::new();
        let id = Uuid::new_v4();
        assert_eq!(runtime.get(id).unwrap_err(), SessionError::NotFound(id));
        assert_eq!(
            runtime.control(id, ControlAction::Pause).unwrap_err(),
            SessionError::NotFound(id)
        );
    }

    #[test]
    fn test_merge_meta() {
        let (runtime, id) = runtime_with_session();
        runtime.merge_meta(id, serde_json::json!({"files": 3})).unwrap();
        let session = runtime.merge_meta(id, serde_json::json!({"chunks": 7})).unwrap();
        assert_eq!(session.meta, serde_json::json!({"files": 3, "chunks": 7}));
    }

    #[test]
    fn test_cancelled_status_is_final() {
        let (runtime, id) = runtime_with_session();
        runtime.set_stage(id, Stage::Cancelled, None).unwrap();
        let again = runtime
            .set_stage(id, Stage::Cancelled, Some(SessionStatus::Completed))
            .unwrap();
        assert_eq!(again.status, SessionStatus::Cancelled);
        assert_eq!(again.stage, Stage::Cancelled);
    }

    #[test]
    fn test_finished_sessions_are_swept() {
        let runtime = SessionRuntime::with_retention(Duration::ZERO);
        let new = || NewSession {
            game_id: "g-1".into(),
            slug: "nebula".into(),
            ..Default::default()
        };
        let done = runtime.create(new());
        let active = runtime.create(new());
        runtime.control(done.id, ControlAction::Cancel).unwrap();
        assert_eq!(runtime.len(), 2);

        // creating a session sweeps too
        let third = runtime.create(new());
        assert_eq!(runtime.len(), 2);
        assert!(matches!(runtime.get(done.id), Err(SessionError::NotFound(_))));
        assert!(runtime.get(active.id).is_ok());
        assert!(runtime.get(third.id).is_ok());

        let kept = SessionRuntime::new();
        let session = kept.create(new());
        kept.control(session.id, ControlAction::Cancel).unwrap();
        assert_eq!(kept.sweep_finished(), 0);
        assert_eq!(kept.len(), 1);
    }
}
