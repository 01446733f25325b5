//! Worker-facing error types (spec §7).

pub use clusterrunner_core::{DeadWorkerError, WorkerError, WorkerShutdownError};
use thiserror::Error;

/// Errors `Worker::start_subjob` can raise before the RPC is even
/// dispatched, plus the RPC failure itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StartSubjobError {
    #[error(transparent)]
    Dead(#[from] DeadWorkerError),
    #[error(transparent)]
    Shutdown(#[from] WorkerShutdownError),
    #[error(transparent)]
    Rpc(#[from] WorkerError),
}

/// `claim_executor`/`free_executor`/`mark_as_idle` call out a violated
/// invariant rather than panicking (workspace lints forbid `panic!`
/// outside tests) — these only fire on a scheduler bug.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerCapacityError {
    #[error("worker {worker_id} has no free executors to claim ({in_use}/{capacity} in use)")]
    NoFreeExecutor { worker_id: clusterrunner_core::WorkerId, in_use: u32, capacity: u32 },

    #[error("worker {worker_id} has no claimed executors to free")]
    NoExecutorToFree { worker_id: clusterrunner_core::WorkerId },

    #[error("worker {worker_id} cannot be marked idle with {in_use} executors still in use")]
    NotIdle { worker_id: clusterrunner_core::WorkerId, in_use: u32 },
}

/// Outcome of `mark_as_idle`: either the capacity invariant was
/// violated, or the worker was shutting down and got killed instead of
/// requeued (spec §4.B).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MarkIdleError {
    #[error(transparent)]
    Capacity(#[from] WorkerCapacityError),
    #[error(transparent)]
    Shutdown(#[from] WorkerShutdownError),
}
