//! `JobConfig`: the handful of knobs a `Build` reads out of its
//! `ProjectType` during `prepare()` (spec §4.D).

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub name: String,
    pub max_executors: u32,
    pub max_executors_per_worker: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self { name: "unnamed".to_string(), max_executors: u32::MAX, max_executors_per_worker: u32::MAX }
    }
}

/// Per-worker parameter overrides a `ProjectType` wants forwarded on
/// `setup()`. Opaque past this crate; carried through to the worker RPC.
pub type WorkerParamOverrides = HashMap<String, String>;
