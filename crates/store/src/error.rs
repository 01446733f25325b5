//! Store error types (spec §4.H, §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("failed to serialize build request: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("build {0} not found in the relational store")]
    NotFound(clusterrunner_core::BuildId),
}
