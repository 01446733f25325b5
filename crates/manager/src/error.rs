//! HTTP-facing error taxonomy (spec §7): library errors are converted
//! to a response here, at the transport boundary, never inside
//! `clusterrunner-core`/`-scheduler`/`-store`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("missing or invalid request signature")]
    Unauthorized,

    #[error("build not yet ready: {0}")]
    NotReady(String),

    #[error(transparent)]
    Store(#[from] clusterrunner_store::StoreError),

    #[error(transparent)]
    Artifact(#[from] clusterrunner_scheduler::ArtifactError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotReady(_) => StatusCode::ACCEPTED,
            ApiError::Store(_) | ApiError::Artifact(_) | ApiError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
