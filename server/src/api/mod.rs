pub mod rest;

use crate::config::Config;
use crate::delivery::ChunkFetcher;
use crate::manifest::ManifestService;
use crate::selfheal::SelfHealService;
use crate::session::{MemoryTaskLedger, SessionRuntime, TaskLedger};
use crate::storage::FastHasher;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub manifests: Arc<ManifestService>,
    pub fetcher: Arc<ChunkFetcher>,
    pub self_heal: Arc<SelfHealService>,
    /// v2 pipeline annotations, process-local
    pub sessions: Arc<SessionRuntime>,
    /// Coarse download records kept alongside sessions
    pub tasks: Arc<dyn TaskLedger>,
}

impl AppState {
    pub fn new(
        config: Config,
        manifests: Arc<ManifestService>,
        fetcher: ChunkFetcher,
        hasher: Arc<dyn FastHasher>,
    ) -> Self {
        Self {
            config,
            manifests,
            fetcher: Arc::new(fetcher),
            self_heal: Arc::new(SelfHealService::new(hasher)),
            sessions: Arc::new(SessionRuntime::new()),
            tasks: Arc::new(MemoryTaskLedger::default()),
        }
    }
}
