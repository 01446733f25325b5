//! Errors raised while resolving a job into subjobs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProjectTypeError {
    #[error("failed to read job description {path}: {source}")]
    Read { path: String, source: std::io::Error },

    #[error("failed to parse job description {path}: {source}")]
    Parse { path: String, source: toml::de::Error },

    #[error("job description is missing required field `{0}`")]
    MissingField(&'static str),
}
