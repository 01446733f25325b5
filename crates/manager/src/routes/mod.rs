//! HTTP route handlers (spec §6). One module per resource, wired into
//! a single `axum::Router` in `build_router`.

pub mod build;
pub mod events;
pub mod queue;
pub mod version;
pub mod worker;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use clusterrunner_core::Clock;
use clusterrunner_worker::HttpWorkerTransport;
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::state::AppState;

const DIGEST_HEADER: &str = "Clusterrunner-Message-Authentication-Digest";

/// Every POST/PUT that mutates cluster state must carry a matching
/// HMAC-SHA512 digest of its body (spec §6, §7, §8 property 8). The
/// body is buffered here so `verify` can see it and then handed back
/// unchanged to the real handler.
async fn verify_signature<C>(
    State(state): State<Arc<AppState<C, HttpWorkerTransport>>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError>
where
    C: Clock + Default,
{
    let digest = request
        .headers()
        .get(DIGEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or(ApiError::Unauthorized)?;

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, 10 * 1024 * 1024)
        .await
        .map_err(|e| ApiError::Validation(format!("failed to read request body: {e}")))?;
    if !state.signer.verify(&digest, &bytes) {
        return Err(ApiError::Unauthorized);
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(request).await)
}

/// Wires every handler onto a single router. Fixed to
/// [`HttpWorkerTransport`]: the fake transport used in tests lives in
/// `clusterrunner-worker`/`clusterrunner-scheduler`'s own test modules,
/// not behind this HTTP surface.
pub fn build_router<C>(state: Arc<AppState<C, HttpWorkerTransport>>) -> Router
where
    C: Clock + Default,
{
    let mutating = Router::new()
        .route("/build", post(build::submit_build))
        .route("/build/:id", axum::routing::put(build::update_build))
        .route("/worker", post(worker::register_worker))
        .route("/worker/shutdown", post(worker::shutdown_workers))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), verify_signature::<C>));

    // The manager->manager completion callback (`/internal/...`) is an
    // RPC target for the agent, not a cluster-state-mutation endpoint a
    // client signs per §6 — it is reached only over the private
    // manager<->worker channel, so it is left outside `mutating`.
    Router::new()
        .merge(mutating)
        .route("/version", get(version::get_version))
        .route("/build/:id", get(build::get_build))
        .route("/build/:id/artifacts.zip", get(build::get_artifacts))
        .route("/build/:id/subjob/:subjob_id/atom/:atom_id/console", get(build::get_console))
        .route("/internal/build/:id/subjob/complete", post(build::subjob_complete))
        .route("/worker", get(worker::list_workers))
        .route("/worker/:id", get(worker::get_worker))
        .route("/queue", get(queue::get_queue))
        .route("/events", get(events::get_events))
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
