//! clusterrunner-manager: the HTTP-facing coordinator tying the
//! scheduler, store, and worker registry together (spec §4, §6).
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod client;
pub mod config;
pub mod error;
pub mod eventlog;
pub mod routes;
pub mod signer;
pub mod state;

pub use client::Client;
pub use config::ManagerConfig;
pub use error::ApiError;
pub use state::AppState;
