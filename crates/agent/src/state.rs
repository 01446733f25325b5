//! Per-process agent state: one worker, and at most one build active
//! on it at a time (spec §4.M).

use std::path::PathBuf;
use std::sync::Arc;

use clusterrunner_core::BuildId;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub struct AgentState {
    pub session_id: String,
    pub results_root: PathBuf,
    pub manager_url: Option<String>,
    pub http: reqwest::Client,
    pub current_build: Mutex<Option<BuildId>>,
    /// Flipped by `/kill`; `main` awaits it via `with_graceful_shutdown`
    /// (spec §4.B `kill()`, §6 `POST /kill`).
    pub shutdown: CancellationToken,
}

impl AgentState {
    pub fn new(session_id: String, results_root: PathBuf, manager_url: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            results_root,
            manager_url,
            http: reqwest::Client::new(),
            current_build: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn results_dir(&self, build_id: BuildId) -> PathBuf {
        self.results_root.join(build_id.get().to_string())
    }
}
