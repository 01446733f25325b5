use axum::Json;
use serde_json::{json, Value};

/// `GET /version` (spec §6). The crate version doubles as the API
/// version; there is no independently versioned wire protocol yet.
pub async fn get_version() -> Json<Value> {
    Json(json!({ "api_version": env!("CARGO_PKG_VERSION") }))
}
