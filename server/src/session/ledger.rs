//! Download task snapshots
//!
//! The coarse per-download record the route layer keeps next to a session.
//! Real deployments back this with a database table; the in-memory ledger
//! serves a single process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use super::runtime::{DownloadSession, SessionStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub download_id: String,
    pub game_id: String,
    pub slug: String,
    pub version: String,
    pub status: SessionStatus,
    pub install_path: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskSnapshot {
    pub fn from_session(session: &DownloadSession) -> Self {
        Self {
            download_id: session.download_id.clone(),
            game_id: session.game_id.clone(),
            slug: session.slug.clone(),
            version: session.version.clone(),
            status: session.status,
            install_path: session.install_path.clone(),
            updated_at: session.updated_at,
        }
    }
}

pub trait TaskLedger: Send + Sync {
    fn upsert(&self, task: TaskSnapshot);
    fn update_status(&self, download_id: &str, status: SessionStatus) -> Option<TaskSnapshot>;
    fn get(&self, download_id: &str) -> Option<TaskSnapshot>;
}

#[derive(Default)]
pub struct MemoryTaskLedger {
    tasks: Mutex<HashMap<String, TaskSnapshot>>,
}

impl TaskLedger for MemoryTaskLedger {
    fn upsert(&self, task: TaskSnapshot) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.download_id.clone(), task);
    }

    fn update_status(&self, download_id: &str, status: SessionStatus) -> Option<TaskSnapshot> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let task = tasks.get_mut(download_id)?;
        task.status = status;
        task.updated_at = Utc::now();
        Some(task.clone())
    }

    fn get(&self, download_id: &str) -> Option<TaskSnapshot> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(download_id)
            .cloned()
    }
}
