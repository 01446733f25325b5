//! clusterrunner-agent: the worker-side RPC stub (spec §4.M). Exposed
//! as a library too so integration tests can run a real instance
//! in-process against an ephemeral port, the way the manager crate's
//! end-to-end tests do.
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use state::AgentState;

pub fn build_router(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/", get(routes::liveness))
        .route("/build/:id/setup", post(routes::setup))
        .route("/build/:id/subjob/:subjob_id", post(routes::run_subjob))
        .route("/build/:id/teardown", post(routes::teardown))
        .route("/kill", post(routes::kill))
        .with_state(state)
}
