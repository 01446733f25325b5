use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use clusterrunner_core::{Atom, BuildEvent, BuildId, Clock};
use clusterrunner_project::ShellJobProjectType;
use clusterrunner_scheduler::{Build, BuildArtifact};
use clusterrunner_worker::HttpWorkerTransport;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::eventlog::EventKind;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitBuildRequest {
    /// A `ShellJobProjectType` TOML job description (spec §4.L). A
    /// full config language and atomizer dispatch are out of scope.
    job_description: String,
}

/// `POST /build` (spec §6): parses the job description, builds and
/// prepares a `Build`, persists it, and enqueues it for allocation.
pub async fn submit_build<C>(
    State(state): State<Arc<AppState<C, HttpWorkerTransport>>>,
    Json(body): Json<SubmitBuildRequest>,
) -> Result<Json<Value>, ApiError>
where
    C: Clock + Default,
{
    let id = state.next_build_id();
    let results_dir = state.config.results_dir.join(id.get().to_string());
    std::fs::create_dir_all(&results_dir)?;

    let build_request = json!({ "job_description": body.job_description });
    let build = Build::new(id, build_request, results_dir.clone(), state.clock.clone());

    let project_type = ShellJobProjectType::from_toml_str(&body.job_description, "POST /build", results_dir)
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    build.prepare(&project_type).map_err(|e| ApiError::Validation(e.to_string()))?;

    state.store.add(Arc::clone(&build)).await?;
    state.scheduler_pool.get(&build).await;
    state.scheduler_pool.add_build_waiting_for_workers(build.id());
    state.eventlog.record(EventKind::BuildQueued { build_id: id }, state.clock.epoch_ms());

    Ok(Json(json!({ "build_id": id.get() })))
}

async fn load_build<C>(state: &AppState<C, HttpWorkerTransport>, id: u64) -> Result<Arc<Build<C>>, ApiError>
where
    C: Clock + Default,
{
    state
        .store
        .get(BuildId::from_raw(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("build {id} not found")))
}

pub async fn get_build<C>(
    State(state): State<Arc<AppState<C, HttpWorkerTransport>>>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, ApiError>
where
    C: Clock + Default,
{
    let build = load_build(&state, id).await?;
    Ok(Json(json!({ "build": build.api_representation() })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateBuildRequest {
    status: String,
}

/// `PUT /build/{id}` (spec §6): the only supported transition is a
/// cancel request, which is idempotent from a terminal state (spec §8
/// boundary property).
pub async fn update_build<C>(
    State(state): State<Arc<AppState<C, HttpWorkerTransport>>>,
    Path(id): Path<u64>,
    Json(body): Json<UpdateBuildRequest>,
) -> Result<Json<Value>, ApiError>
where
    C: Clock + Default,
{
    if body.status != "canceled" {
        return Err(ApiError::Validation(format!("unsupported status transition: {}", body.status)));
    }
    let build = load_build(&state, id).await?;
    build.cancel();
    let scheduler = state.scheduler_pool.get(&build).await;
    scheduler.teardown_all().await;
    state.eventlog.record(EventKind::BuildCanceled { build_id: build.id() }, state.clock.epoch_ms());
    Ok(Json(json!({ "build": build.api_representation() })))
}

/// `GET /build/{id}/artifacts.zip` (spec §6): 200 with the archive
/// bytes once the build has finished and zipped its results, 202 if
/// it hasn't gotten there yet.
pub async fn get_artifacts<C>(
    State(state): State<Arc<AppState<C, HttpWorkerTransport>>>,
    Path(id): Path<u64>,
) -> Result<axum::response::Response, ApiError>
where
    C: Clock + Default,
{
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    let build = load_build(&state, id).await?;
    let Some(artifact) = build.build_artifact() else {
        return Ok((StatusCode::ACCEPTED, Json(json!({ "status": build.fsm().state().to_string() }))).into_response());
    };
    let bytes = tokio::fs::read(artifact.archive_path()).await?;
    Ok((StatusCode::OK, [("content-type", "application/zip")], bytes).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ConsoleQuery {
    max_lines: Option<usize>,
    offset_line: Option<usize>,
}

/// `GET /build/{id}/subjob/{sj}/atom/{a}/console` (spec §6): reads the
/// worker-written console capture for one atom out of its results
/// directory, with the same line-windowing semantics as the worker's
/// own log tailing.
pub async fn get_console<C>(
    State(state): State<Arc<AppState<C, HttpWorkerTransport>>>,
    Path((id, subjob_id, atom_id)): Path<(u64, u32, u32)>,
    Query(q): Query<ConsoleQuery>,
) -> Result<Json<Value>, ApiError>
where
    C: Clock + Default,
{
    let build = load_build(&state, id).await?;
    let path = build.results_dir().join(format!("artifact_{subjob_id}_{atom_id}")).join("clusterrunner_console_output");
    let text = tokio::fs::read_to_string(&path).await.unwrap_or_default();
    let offset = q.offset_line.unwrap_or(0);
    let lines: Vec<&str> = text.lines().skip(offset).collect();
    let lines = match q.max_lines {
        Some(max) => &lines[..lines.len().min(max)],
        None => &lines[..],
    };
    Ok(Json(json!({ "content": lines.join("\n") })))
}

#[derive(Debug, Deserialize)]
pub struct SubjobCompleteRequest {
    subjob_id: u32,
    atoms: Vec<Atom>,
}

/// Internal worker-to-manager completion callback (§4.M's
/// `mark_subjob_complete` equivalent; not part of the public §6 table).
/// Once every subjob has reported in, builds the artifact archive and
/// advances the FSM past `POSTBUILD_TASKS_COMPLETE`.
pub async fn subjob_complete<C>(
    State(state): State<Arc<AppState<C, HttpWorkerTransport>>>,
    Path(id): Path<u64>,
    Json(body): Json<SubjobCompleteRequest>,
) -> Result<Json<Value>, ApiError>
where
    C: Clock + Default,
{
    let build = load_build(&state, id).await?;
    let was_full = build.mark_subjob_complete(body.subjob_id, body.atoms);
    if was_full {
        finish_build(&state, &build).await?;
    }
    Ok(Json(json!({ "ok": true })))
}

async fn finish_build<C>(state: &AppState<C, HttpWorkerTransport>, build: &Arc<Build<C>>) -> Result<(), ApiError>
where
    C: Clock + Default,
{
    build.finish().map_err(|e| ApiError::Validation(e.to_string()))?;

    let failed_commands: Vec<_> = build
        .all_subjobs_snapshot()
        .iter()
        .flat_map(|sj| sj.failed_atoms().map(|a| (sj.id, a.id)).collect::<Vec<_>>())
        .collect();
    let passed = failed_commands.is_empty();
    let timing_json = serde_json::to_string(&build.all_atom_commands()).unwrap_or_default();
    let artifact = match BuildArtifact::create(
        build.results_dir().clone(),
        failed_commands,
        build.timing_file_path().as_deref(),
        &timing_json,
    ) {
        Ok(artifact) => artifact,
        Err(e) => {
            // Archival failure means the build can never satisfy the
            // `FINISHED ⇒ build_artifact != nil` invariant; fail it
            // instead of leaving it stuck short of a terminal state.
            build.mark_failed(e.to_string());
            state.eventlog.record(
                EventKind::BuildError { build_id: build.id(), message: e.to_string() },
                state.clock.epoch_ms(),
            );
            state.scheduler_pool.remove(build.id()).await;
            state.store.add(Arc::clone(build)).await?;
            return Err(e.into());
        }
    };
    build.set_build_artifact(artifact);
    build.fsm().trigger(BuildEvent::PostbuildTasksComplete);
    state.eventlog.record(EventKind::BuildFinished { build_id: build.id(), passed }, state.clock.epoch_ms());

    state.scheduler_pool.remove(build.id()).await;
    state.store.add(Arc::clone(build)).await?;
    Ok(())
}
