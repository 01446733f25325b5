//! clusterrunner-worker: the manager-side proxy for one remote worker
//! process (spec §4.B).

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod error;
pub mod transport;
pub mod worker;

pub use error::{MarkIdleError, StartSubjobError, WorkerCapacityError};
pub use transport::{HttpWorkerTransport, LivenessBody, WorkerTransport};
pub use worker::Worker;

#[cfg(any(test, feature = "test-support"))]
pub use transport::fake::{Call as FakeTransportCall, FakeWorkerTransport};
