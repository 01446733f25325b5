//! clusterrunner-core: shared data model and concurrency primitives for
//! the ClusterRunner manager.
//!
//! This crate holds the pieces every other crate in the workspace needs
//! a copy of: ids, the `Build` finite state machine, the atom/subjob
//! data model, the error taxonomy, and the two small thread-safe
//! primitives (`Counter`, `OrderedSetQueue`) the scheduler and allocator
//! are built on. It intentionally owns no I/O.

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod macros;

pub mod clock;
pub mod counter;
pub mod error;
pub mod fsm;
pub mod ids;
pub mod ordered_set_queue;
pub mod subjob;

pub use clock::{Clock, FakeClock, SystemClock};
pub use counter::Counter;
pub use error::{
    ClusterApiValidationError, DeadWorkerError, FsmTransitionError, ItemNotFoundError,
    WorkerError, WorkerShutdownError,
};
pub use fsm::{BuildEvent, BuildFsm, BuildState};
pub use ids::{AtomId, BuildId, SubjobId, WorkerId};
pub use ordered_set_queue::{OrderedSetQueue, SharedOrderedSetQueue};
pub use subjob::{Atom, AtomState, BuildResult, Subjob};
