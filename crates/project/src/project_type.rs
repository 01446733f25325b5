//! The `ProjectType` collaborator (spec §3, §4.L).
//!
//! Out of scope per spec §1: YAML job-config parsing and the atomizer
//! that turns a job definition into concrete subjobs. This trait is the
//! seam the `Build` talks to; `ShellJobProjectType` is the minimal
//! built-in implementation that makes the rest of the system runnable
//! end to end without a full config language.

use std::path::{Path, PathBuf};

use clusterrunner_core::Subjob;

use crate::job_config::{JobConfig, WorkerParamOverrides};

pub trait ProjectType: Send + Sync {
    fn job_config(&self) -> &JobConfig;

    /// Path the worker should write subjob atom timings to, so the next
    /// run of the same job can seed `Atom::expected_time_ms`.
    fn timing_file_path(&self, job_name: &str) -> PathBuf;

    fn worker_param_overrides(&self) -> WorkerParamOverrides;

    /// Expand the job definition into the subjobs a `Build` will
    /// dispatch. Out-of-scope atomizers do this by spawning a
    /// subprocess; `ShellJobProjectType` does it by reading its TOML
    /// description directly.
    fn atomize(&self) -> Vec<Subjob>;

    /// Signal any still-running atomizer subprocess to stop (spec §4.D
    /// cancellation contract). A no-op for project types that never
    /// spawn one.
    fn terminate_atomizer(&self) {}
}

pub fn default_timing_file_path(timing_dir: &Path, job_name: &str) -> PathBuf {
    timing_dir.join(format!("{job_name}-time.json"))
}
