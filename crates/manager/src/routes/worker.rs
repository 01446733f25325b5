use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use clusterrunner_core::{Clock, WorkerId};
use clusterrunner_worker::{HttpWorkerTransport, Worker, WorkerTransport};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::eventlog::EventKind;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    worker: String,
    num_executors: u32,
    session_id: String,
}

#[derive(Debug, Serialize)]
struct WorkerApiRepresentation {
    worker_id: u64,
    url: String,
    num_executors: u32,
    executors_in_use: u32,
    is_alive: bool,
    is_shutdown: bool,
}

fn represent<T: WorkerTransport>(worker: &Worker<T>) -> WorkerApiRepresentation {
    WorkerApiRepresentation {
        worker_id: worker.id().get(),
        url: worker.url().to_string(),
        num_executors: worker.num_executors(),
        executors_in_use: worker.executors_in_use(),
        is_alive: worker.is_alive(),
        is_shutdown: worker.is_shutdown(),
    }
}

/// `POST /worker` (spec §6): register a worker process and queue it
/// idle immediately. The session id is the worker's own token, recorded
/// here as the value every later liveness probe and RPC is checked
/// against — the manager never mints one itself, since a worker that
/// restarts gets a new token only it knows.
pub async fn register_worker<C>(
    State(state): State<Arc<AppState<C, HttpWorkerTransport>>>,
    Json(body): Json<RegisterWorkerRequest>,
) -> Result<Json<Value>, ApiError>
where
    C: Clock + Default,
{
    let id = state.next_worker_id();
    let url = body.worker;
    let worker = Worker::new(id, url.clone(), body.num_executors, body.session_id, HttpWorkerTransport::default());
    state.workers.lock().insert(id, Arc::clone(&worker));
    state.allocator.add_idle_worker(worker).await;
    state.eventlog.record(EventKind::WorkerAdded { worker_id: id, url }, state.clock.epoch_ms());
    Ok(Json(json!({ "worker_id": id.get() })))
}

pub async fn list_workers<C>(State(state): State<Arc<AppState<C, HttpWorkerTransport>>>) -> Json<Value>
where
    C: Clock + Default,
{
    let workers: Vec<_> = state.all_workers().iter().map(|w| represent(w.as_ref())).collect();
    Json(json!({ "workers": workers }))
}

pub async fn get_worker<C>(
    State(state): State<Arc<AppState<C, HttpWorkerTransport>>>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, ApiError>
where
    C: Clock + Default,
{
    let worker = state
        .worker(WorkerId::from_raw(id))
        .ok_or_else(|| ApiError::NotFound(format!("worker {id} not found")))?;
    Ok(Json(json!({ "worker": represent(worker.as_ref()) })))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ShutdownWorkersRequest {
    ById { workers: Vec<u64> },
    All { shutdown_all: bool },
}

/// `POST /worker/shutdown` (spec §6): flips each targeted worker into
/// drain mode. A worker with no current build is killed immediately
/// (`Worker::set_shutdown_mode`); one mid-build finishes its current
/// subjobs and is torn down by the scheduler once drained.
pub async fn shutdown_workers<C>(
    State(state): State<Arc<AppState<C, HttpWorkerTransport>>>,
    Json(body): Json<ShutdownWorkersRequest>,
) -> Json<Value>
where
    C: Clock + Default,
{
    let targets: Vec<Arc<Worker<HttpWorkerTransport>>> = match body {
        ShutdownWorkersRequest::ById { workers } => {
            workers.into_iter().filter_map(|id| state.worker(WorkerId::from_raw(id))).collect()
        }
        ShutdownWorkersRequest::All { shutdown_all } if shutdown_all => state.all_workers(),
        ShutdownWorkersRequest::All { .. } => Vec::new(),
    };
    for worker in &targets {
        worker.set_shutdown_mode().await;
        state.eventlog.record(EventKind::WorkerShutdown { worker_id: worker.id() }, state.clock.epoch_ms());
    }
    Json(json!({ "shutdown_count": targets.len() }))
}
