//! Build/scheduler error types (spec §4.D, §7).

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("build {0} has already been prepared")]
    AlreadyPrepared(clusterrunner_core::BuildId),

    #[error("build {0} cannot finish: finished-subjob queue is not yet full")]
    NotYetComplete(clusterrunner_core::BuildId),
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to create results directory {path}: {source}")]
    CreateDir { path: String, source: std::io::Error },

    #[error("failed to write {path}: {source}")]
    Write { path: String, source: std::io::Error },

    #[error("failed to build archive {path}: {source}")]
    Zip { path: String, source: zip::result::ZipError },
}
