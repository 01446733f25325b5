use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use clusterrunner_core::Clock;
use clusterrunner_worker::WorkerTransport;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    since_id: Option<u64>,
    since_timestamp: Option<u64>,
}

/// `GET /events` (spec §6 Event log): serves the ring-buffered activity
/// feed. `since_id` and `since_timestamp` are mutually exclusive; a
/// request carrying neither returns everything the cache still holds.
pub async fn get_events<C, T>(
    State(state): State<Arc<AppState<C, T>>>,
    Query(q): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError>
where
    C: Clock + Default,
    T: WorkerTransport,
{
    if q.since_id.is_some() && q.since_timestamp.is_some() {
        return Err(ApiError::Validation("since_id and since_timestamp are mutually exclusive".into()));
    }
    let events = match (q.since_id, q.since_timestamp) {
        (Some(id), None) => state.eventlog.since_id(id),
        (None, Some(ts)) => state.eventlog.since_timestamp(ts),
        _ => state.eventlog.since_id(0),
    };
    Ok(Json(json!({ "events": events })))
}
