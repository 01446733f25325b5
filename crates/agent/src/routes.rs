//! The four worker RPC endpoints plus liveness (spec §4.M, §6).

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use clusterrunner_core::{Atom, AtomState, BuildId, Subjob};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;

use crate::state::AgentState;

fn check_session(headers: &HeaderMap, state: &AgentState) -> Result<(), StatusCode> {
    let provided = headers.get("Session-Id").and_then(|v| v.to_str().ok());
    if provided != Some(state.session_id.as_str()) {
        return Err(StatusCode::PRECONDITION_FAILED);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    worker: LivenessBody,
}

#[derive(Debug, Serialize)]
struct LivenessBody {
    is_alive: bool,
    session_id: String,
}

pub async fn liveness(State(state): State<Arc<AgentState>>) -> Json<Value> {
    Json(json!(LivenessResponse { worker: LivenessBody { is_alive: true, session_id: state.session_id.clone() } }))
}

#[derive(Debug, Deserialize)]
pub struct SetupRequest {
    #[allow(dead_code)]
    executor_start_index: u32,
    #[serde(default)]
    #[allow(dead_code)]
    worker_param_overrides: std::collections::HashMap<String, String>,
}

pub async fn setup(
    State(state): State<Arc<AgentState>>,
    Path(build_id): Path<u64>,
    headers: HeaderMap,
    Json(_body): Json<SetupRequest>,
) -> Result<StatusCode, StatusCode> {
    check_session(&headers, &state)?;
    let build_id = BuildId::from_raw(build_id);
    let dir = state.results_dir(build_id);
    tokio::fs::create_dir_all(&dir).await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    *state.current_build.lock() = Some(build_id);
    Ok(StatusCode::OK)
}

/// Runs every atom in `subjob` sequentially, writes each one's
/// captured stdout+stderr under `artifact_{subjob}_{atom}/`, then
/// posts the completion callback the manager's `mark_subjob_complete`
/// waits on.
pub async fn run_subjob(
    State(state): State<Arc<AgentState>>,
    Path((build_id, _subjob_id)): Path<(u64, u32)>,
    headers: HeaderMap,
    Json(subjob): Json<Subjob>,
) -> Result<StatusCode, StatusCode> {
    check_session(&headers, &state)?;
    let build_id = BuildId::from_raw(build_id);
    let results_dir = state.results_dir(build_id);

    tokio::spawn(execute_and_report(state, build_id, results_dir, subjob));
    Ok(StatusCode::OK)
}

async fn execute_and_report(state: Arc<AgentState>, build_id: BuildId, results_dir: std::path::PathBuf, mut subjob: Subjob) {
    for atom in &mut subjob.atoms {
        *atom = run_atom(&results_dir, subjob.id, atom.clone()).await;
    }

    let Some(manager_url) = state.manager_url.as_ref() else { return };
    let body = json!({ "subjob_id": subjob.id, "atoms": subjob.atoms });
    if let Err(e) = state
        .http
        .post(format!("{manager_url}/internal/build/{build_id}/subjob/complete"))
        .json(&body)
        .send()
        .await
    {
        tracing::warn!(subjob_id = subjob.id, error = %e, "completion callback to manager failed");
    }
}

async fn run_atom(results_dir: &std::path::Path, subjob_id: u32, mut atom: Atom) -> Atom {
    atom.state = AtomState::Running;
    let artifact_dir = results_dir.join(format!("artifact_{subjob_id}_{}", atom.id));
    if let Err(e) = tokio::fs::create_dir_all(&artifact_dir).await {
        tracing::error!(error = %e, "failed to create artifact directory");
        atom.exit_code = Some(-1);
        atom.state = AtomState::Finished;
        return atom;
    }

    let started = Instant::now();
    let output = Command::new("sh")
        .arg("-c")
        .arg(&atom.command)
        .current_dir(&artifact_dir)
        .env("ARTIFACT_DIR", &artifact_dir)
        .stdin(Stdio::null())
        .output()
        .await;

    match output {
        Ok(output) => {
            let console_path = artifact_dir.join("clusterrunner_console_output");
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            let _ = tokio::fs::write(&console_path, combined).await;
            atom.exit_code = output.status.code().or(Some(-1));
        }
        Err(e) => {
            tracing::warn!(error = %e, command = %atom.command, "failed to spawn atom command");
            atom.exit_code = Some(-1);
        }
    }
    atom.actual_time_ms = Some(started.elapsed().as_millis() as u64);
    atom.state = AtomState::Finished;
    atom
}

pub async fn teardown(
    State(state): State<Arc<AgentState>>,
    Path(_build_id): Path<u64>,
    headers: HeaderMap,
) -> Result<StatusCode, StatusCode> {
    check_session(&headers, &state)?;
    *state.current_build.lock() = None;
    Ok(StatusCode::OK)
}

pub async fn kill(State(state): State<Arc<AgentState>>, headers: HeaderMap) -> impl IntoResponse {
    if check_session(&headers, &state).is_err() {
        return StatusCode::PRECONDITION_FAILED;
    }
    state.shutdown.cancel();
    StatusCode::OK
}
