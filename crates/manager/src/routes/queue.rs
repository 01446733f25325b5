use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use clusterrunner_core::Clock;
use clusterrunner_worker::WorkerTransport;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /queue` (spec §6): ids of every build the scheduler pool still
/// has an active scheduler for.
pub async fn get_queue<C, T>(State(state): State<Arc<AppState<C, T>>>) -> Json<Value>
where
    C: Clock + Default,
    T: WorkerTransport,
{
    let ids: Vec<u64> = state.scheduler_pool.active_build_ids().await.into_iter().map(|id| id.get()).collect();
    Json(json!({ "queue": ids }))
}
