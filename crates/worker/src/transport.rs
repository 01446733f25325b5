//! The manager→worker RPC surface (spec §6), abstracted behind a trait
//! so `Worker` is testable without a real HTTP server — mirrors the
//! adapter-trait-plus-fake pattern used elsewhere in this workspace's
//! teacher for infrastructure seams.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use clusterrunner_core::{BuildId, Subjob};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A transport-level failure, carrying no worker id of its own —
/// `Worker` attaches its own id when converting this into a
/// `clusterrunner_core::WorkerError`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Body of the liveness probe response. `session_id` lets the manager
/// detect that the process on the other end of `url` restarted (and so
/// is a different worker instance despite being reachable).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LivenessBody {
    pub is_alive: bool,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupRequest<'a> {
    pub executor_start_index: u32,
    pub worker_param_overrides: &'a HashMap<String, String>,
}

#[async_trait]
pub trait WorkerTransport: Send + Sync + 'static {
    async fn setup(
        &self,
        url: &str,
        session_id: &str,
        build_id: BuildId,
        executor_start_index: u32,
        overrides: &HashMap<String, String>,
    ) -> Result<(), TransportError>;

    async fn start_subjob(
        &self,
        url: &str,
        session_id: &str,
        build_id: BuildId,
        subjob: &Subjob,
    ) -> Result<(), TransportError>;

    async fn teardown(&self, url: &str, session_id: &str, build_id: BuildId) -> Result<(), TransportError>;

    async fn kill(&self, url: &str, session_id: &str) -> Result<(), TransportError>;

    /// Raw probe: returns `Err` on transport failure (timeout, connection
    /// refused, non-2xx) or a malformed body; `Worker::is_alive` is
    /// responsible for the session-id cross-check.
    async fn probe(&self, url: &str, session_id: &str) -> Result<LivenessBody, TransportError>;
}

/// Real transport: HTTP over `reqwest`, with a short default timeout so
/// an unresponsive worker cannot stall allocation (spec §5).
pub struct HttpWorkerTransport {
    client: reqwest::Client,
}

impl HttpWorkerTransport {
    pub fn new(probe_timeout: Duration) -> Self {
        let client = reqwest::Client::builder().timeout(probe_timeout).build().unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpWorkerTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

fn to_transport_err(e: reqwest::Error) -> TransportError {
    TransportError(e.to_string())
}

#[async_trait]
impl WorkerTransport for HttpWorkerTransport {
    async fn setup(
        &self,
        url: &str,
        session_id: &str,
        build_id: BuildId,
        executor_start_index: u32,
        overrides: &HashMap<String, String>,
    ) -> Result<(), TransportError> {
        let body = SetupRequest { executor_start_index, worker_param_overrides: overrides };
        self.client
            .post(format!("{url}/build/{build_id}/setup"))
            .header("Session-Id", session_id)
            .json(&body)
            .send()
            .await
            .map_err(to_transport_err)?
            .error_for_status()
            .map_err(to_transport_err)?;
        Ok(())
    }

    async fn start_subjob(
        &self,
        url: &str,
        session_id: &str,
        build_id: BuildId,
        subjob: &Subjob,
    ) -> Result<(), TransportError> {
        self.client
            .post(format!("{url}/build/{build_id}/subjob/{}", subjob.id))
            .header("Session-Id", session_id)
            .json(subjob)
            .send()
            .await
            .map_err(to_transport_err)?
            .error_for_status()
            .map_err(to_transport_err)?;
        Ok(())
    }

    async fn teardown(&self, url: &str, session_id: &str, build_id: BuildId) -> Result<(), TransportError> {
        self.client
            .post(format!("{url}/build/{build_id}/teardown"))
            .header("Session-Id", session_id)
            .send()
            .await
            .map_err(to_transport_err)?
            .error_for_status()
            .map_err(to_transport_err)?;
        Ok(())
    }

    async fn kill(&self, url: &str, session_id: &str) -> Result<(), TransportError> {
        self.client
            .post(format!("{url}/kill"))
            .header("Session-Id", session_id)
            .send()
            .await
            .map_err(to_transport_err)?;
        Ok(())
    }

    async fn probe(&self, url: &str, session_id: &str) -> Result<LivenessBody, TransportError> {
        let resp =
            self.client.get(url).header("Session-Id", session_id).send().await.map_err(to_transport_err)?;
        if !resp.status().is_success() {
            return Err(TransportError(format!("probe returned {}", resp.status())));
        }
        #[derive(Deserialize)]
        struct Envelope {
            worker: LivenessBody,
        }
        let envelope: Envelope = resp
            .json()
            .await
            .map_err(|e| TransportError(format!("malformed probe body: {e}")))?;
        Ok(envelope.worker)
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Setup { build_id: BuildId, executor_start_index: u32 },
        StartSubjob { build_id: BuildId, subjob_id: u32 },
        Teardown { build_id: BuildId },
        Kill,
        Probe,
    }

    /// A transport double that records calls and returns
    /// programmable results, letting tests drive dead-worker and
    /// shutdown-mode scenarios deterministically.
    #[derive(Clone)]
    pub struct FakeWorkerTransport {
        calls: Arc<Mutex<Vec<Call>>>,
        probe_response: Arc<Mutex<Result<LivenessBody, String>>>,
        fail_rpcs: Arc<Mutex<bool>>,
    }

    impl FakeWorkerTransport {
        pub fn new(session_id: impl Into<String>) -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                probe_response: Arc::new(Mutex::new(Ok(LivenessBody {
                    is_alive: true,
                    session_id: session_id.into(),
                }))),
                fail_rpcs: Arc::new(Mutex::new(false)),
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        pub fn set_probe_response(&self, response: Result<LivenessBody, String>) {
            *self.probe_response.lock() = response;
        }

        pub fn set_fail_rpcs(&self, fail: bool) {
            *self.fail_rpcs.lock() = fail;
        }

        fn maybe_fail(&self) -> Result<(), TransportError> {
            if *self.fail_rpcs.lock() {
                Err(TransportError("fake transport configured to fail".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl WorkerTransport for FakeWorkerTransport {
        async fn setup(
            &self,
            _url: &str,
            _session_id: &str,
            build_id: BuildId,
            executor_start_index: u32,
            _overrides: &HashMap<String, String>,
        ) -> Result<(), TransportError> {
            self.maybe_fail()?;
            self.calls.lock().push(Call::Setup { build_id, executor_start_index });
            Ok(())
        }

        async fn start_subjob(
            &self,
            _url: &str,
            _session_id: &str,
            build_id: BuildId,
            subjob: &Subjob,
        ) -> Result<(), TransportError> {
            self.maybe_fail()?;
            self.calls.lock().push(Call::StartSubjob { build_id, subjob_id: subjob.id });
            Ok(())
        }

        async fn teardown(&self, _url: &str, _session_id: &str, build_id: BuildId) -> Result<(), TransportError> {
            self.maybe_fail()?;
            self.calls.lock().push(Call::Teardown { build_id });
            Ok(())
        }

        async fn kill(&self, _url: &str, _session_id: &str) -> Result<(), TransportError> {
            self.maybe_fail()?;
            self.calls.lock().push(Call::Kill);
            Ok(())
        }

        async fn probe(&self, _url: &str, _session_id: &str) -> Result<LivenessBody, TransportError> {
            self.calls.lock().push(Call::Probe);
            self.probe_response.lock().clone().map_err(TransportError)
        }
    }
}
