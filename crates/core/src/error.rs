//! Shared error taxonomy (spec §7).

use thiserror::Error;

/// Operation attempted on a worker already marked dead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("worker {worker_id} is dead")]
pub struct DeadWorkerError {
    pub worker_id: crate::WorkerId,
}

/// Operation forbidden because the worker is in drain/shutdown mode.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("worker {worker_id} is in shutdown mode")]
pub struct WorkerShutdownError {
    pub worker_id: crate::WorkerId,
}

/// An RPC to a worker failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("request to worker {worker_id} failed: {message}")]
pub struct WorkerError {
    pub worker_id: crate::WorkerId,
    pub message: String,
}

/// A peer (worker or client) sent a malformed response.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid response from {source}: {message}")]
pub struct ClusterApiValidationError {
    pub source: String,
    pub message: String,
}

/// An unknown build/subjob/worker id was referenced.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind} {id} not found")]
pub struct ItemNotFoundError {
    pub kind: &'static str,
    pub id: String,
}

impl ItemNotFoundError {
    pub fn new(kind: &'static str, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }
}

/// An illegal FSM transition was attempted.
///
/// Per spec §4.C, this error never surfaces to the caller that triggered
/// the transition — [`crate::BuildFsm::trigger`] catches it internally
/// and converts it into a `FAIL` event instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("illegal transition: {event:?} is not valid from state {from:?}")]
pub struct FsmTransitionError {
    pub from: crate::BuildState,
    pub event: crate::BuildEvent,
}
