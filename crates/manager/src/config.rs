//! Layered manager configuration: CLI flags (handled by the `cli`
//! binary) override environment variables, which override a TOML
//! config file, which override these built-in defaults. Grounded in
//! the teacher's `env.rs` (`OJ_STATE_DIR`/`OJ_TCP_PORT`/...
//! `env::var(..).ok().and_then(..).unwrap_or(..)` convention), extended
//! here with a TOML layer since this spec has a `--config-file` flag
//! the teacher's daemon does not.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ApiError;

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

/// Mirrors [`ManagerConfig`]'s fields, all optional, for deserializing
/// a `--config-file` TOML document where only a subset is set.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    port: Option<u16>,
    database_url: Option<String>,
    eventlog_file: Option<PathBuf>,
    results_dir: Option<PathBuf>,
    secret: Option<String>,
    worker_liveness_interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub port: u16,
    pub database_url: String,
    pub eventlog_file: Option<PathBuf>,
    pub results_dir: PathBuf,
    pub secret: String,
    pub worker_liveness_interval: Duration,
}

impl ManagerConfig {
    /// Resolve the full config: `config_file` (if given) provides the
    /// base, environment variables override it, and anything still
    /// unset falls back to a built-in default.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ApiError> {
        let file = match config_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text).map_err(|e| ApiError::Validation(format!("invalid config file: {e}")))?
            }
            None => FileConfig::default(),
        };

        let port = env_var("CLUSTERRUNNER_PORT")
            .and_then(|s| s.parse().ok())
            .or(file.port)
            .unwrap_or(43000);

        let database_url = env_var("CLUSTERRUNNER_DATABASE_URL")
            .or(file.database_url)
            .unwrap_or_else(|| "sqlite::memory:".to_string());

        let eventlog_file = env_var("CLUSTERRUNNER_EVENTLOG_FILE").map(PathBuf::from).or(file.eventlog_file);

        let results_dir = env_var("CLUSTERRUNNER_RESULTS_DIR")
            .map(PathBuf::from)
            .or(file.results_dir)
            .unwrap_or_else(|| std::env::temp_dir().join("clusterrunner-results"));

        let secret = env_var("CLUSTERRUNNER_SECRET").or(file.secret).unwrap_or_default();

        let worker_liveness_interval = env_var("CLUSTERRUNNER_WORKER_LIVENESS_INTERVAL_MS")
            .and_then(|s| s.parse::<u64>().ok())
            .or(file.worker_liveness_interval_ms)
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(30));

        Ok(Self { port, database_url, eventlog_file, results_dir, secret, worker_liveness_interval })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = ManagerConfig::load(None).unwrap();
        assert_eq!(config.port, 43000);
        assert_eq!(config.database_url, "sqlite::memory:");
    }

    #[test]
    fn config_file_values_are_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = 9001\nsecret = \"from-file\"\n").unwrap();
        let config = ManagerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.secret, "from-file");
    }

    // Mutates process-global env vars; must not interleave with any
    // other test touching CLUSTERRUNNER_PORT/CLUSTERRUNNER_SECRET.
    #[test]
    #[serial_test::serial]
    fn environment_variables_override_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = 9001\nsecret = \"from-file\"\n").unwrap();

        std::env::set_var("CLUSTERRUNNER_PORT", "9500");
        let config = ManagerConfig::load(Some(&path)).unwrap();
        std::env::remove_var("CLUSTERRUNNER_PORT");

        assert_eq!(config.port, 9500);
        assert_eq!(config.secret, "from-file", "env var unset for secret, file value still wins over the default");
    }
}
