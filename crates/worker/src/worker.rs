//! Manager-side proxy for one remote worker (spec §4.B).

use std::collections::HashMap;
use std::sync::Arc;

use clusterrunner_core::{BuildId, DeadWorkerError, Subjob, WorkerError, WorkerId, WorkerShutdownError};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::error::{MarkIdleError, StartSubjobError, WorkerCapacityError};
use crate::transport::WorkerTransport;

struct State {
    executors_in_use: u32,
    current_build_id: Option<BuildId>,
    is_alive: bool,
    is_in_shutdown_mode: bool,
}

/// Tracks one remote worker: liveness, executor accounting, the
/// shutdown-drain flag, and the RPC surface to the real process.
///
/// All mutable state lives behind a single `parking_lot::Mutex`; no
/// method holds it across an `.await` (locks are taken, read/mutated,
/// and dropped before any RPC is issued).
pub struct Worker<T: WorkerTransport> {
    id: WorkerId,
    url: String,
    num_executors: u32,
    session_id: String,
    transport: Arc<T>,
    /// Bounds fire-and-forget subjob dispatch to `num_executors`
    /// concurrent in-flight POSTs per worker (spec §9 redesign note:
    /// replaces the source's throwaway-thread-per-dispatch).
    dispatch_semaphore: Arc<Semaphore>,
    state: Mutex<State>,
}

impl<T: WorkerTransport> PartialEq for Worker<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T: WorkerTransport> Eq for Worker<T> {}

impl<T: WorkerTransport> std::hash::Hash for Worker<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T: WorkerTransport> Worker<T> {
    pub fn new(id: WorkerId, url: impl Into<String>, num_executors: u32, session_id: impl Into<String>, transport: T) -> Arc<Self> {
        Arc::new(Self {
            id,
            url: url.into(),
            num_executors,
            session_id: session_id.into(),
            transport: Arc::new(transport),
            dispatch_semaphore: Arc::new(Semaphore::new(num_executors.max(1) as usize)),
            state: Mutex::new(State {
                executors_in_use: 0,
                current_build_id: None,
                is_alive: true,
                is_in_shutdown_mode: false,
            }),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn num_executors(&self) -> u32 {
        self.num_executors
    }

    pub fn executors_in_use(&self) -> u32 {
        self.state.lock().executors_in_use
    }

    pub fn current_build_id(&self) -> Option<BuildId> {
        self.state.lock().current_build_id
    }

    pub fn is_alive_cached(&self) -> bool {
        self.state.lock().is_alive
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().is_in_shutdown_mode
    }

    /// Exposes the underlying transport for assertions in tests that
    /// drive a `Worker<FakeWorkerTransport>` from outside this crate.
    #[cfg(any(test, feature = "test-support"))]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Record `current_build_id` *before* the setup RPC returns, so a
    /// worker-initiated completion callback racing the RPC response
    /// finds the id already set (spec §4.B).
    pub async fn setup(
        &self,
        build_id: BuildId,
        executor_start_index: u32,
        overrides: &HashMap<String, String>,
    ) -> Result<(), WorkerError> {
        self.state.lock().current_build_id = Some(build_id);
        self.transport
            .setup(&self.url, &self.session_id, build_id, executor_start_index, overrides)
            .await
            .map_err(|e| WorkerError { worker_id: self.id, message: e.0 })
    }

    /// Dispatch `subjob` to this worker. Checked synchronously against
    /// liveness/shutdown state; the RPC itself is fire-and-forget on a
    /// background task so a slow worker never blocks the scheduler.
    pub async fn start_subjob(self: &Arc<Self>, subjob: Subjob) -> Result<(), StartSubjobError> {
        let (build_id, session_id, url) = {
            let state = self.state.lock();
            if !state.is_alive {
                return Err(DeadWorkerError { worker_id: self.id }.into());
            }
            if state.is_in_shutdown_mode {
                return Err(WorkerShutdownError { worker_id: self.id }.into());
            }
            let build_id = state.current_build_id.unwrap_or_else(|| {
                tracing::error!(worker_id = %self.id, "start_subjob called before setup; this is a scheduler bug");
                BuildId::from_raw(0)
            });
            (build_id, self.session_id.clone(), self.url.clone())
        };

        let transport = Arc::clone(&self.transport);
        let semaphore = Arc::clone(&self.dispatch_semaphore);
        let worker_id = self.id;
        let subjob_id = subjob.id;
        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else { return };
            if let Err(e) = transport.start_subjob(&url, &session_id, build_id, &subjob).await {
                tracing::warn!(%worker_id, subjob_id, error = %e, "fire-and-forget subjob dispatch failed");
            }
        });
        Ok(())
    }

    /// Teardown must not raise on a disconnected worker (spec §4.B):
    /// a dead worker just gets a notice log.
    pub async fn teardown(&self) {
        let (alive, build_id, session_id, url) = {
            let state = self.state.lock();
            (state.is_alive, state.current_build_id, self.session_id.clone(), self.url.clone())
        };
        if !alive {
            tracing::info!(worker_id = %self.id, "worker already dead, skipping teardown RPC");
            return;
        }
        let Some(build_id) = build_id else {
            tracing::debug!(worker_id = %self.id, "teardown called with no current build, skipping RPC");
            return;
        };
        if let Err(e) = self.transport.teardown(&url, &session_id, build_id).await {
            tracing::warn!(worker_id = %self.id, error = %e, "teardown RPC failed");
        }
    }

    pub fn claim_executor(&self) -> Result<(), WorkerCapacityError> {
        let mut state = self.state.lock();
        if state.executors_in_use >= self.num_executors {
            return Err(WorkerCapacityError::NoFreeExecutor {
                worker_id: self.id,
                in_use: state.executors_in_use,
                capacity: self.num_executors,
            });
        }
        state.executors_in_use += 1;
        Ok(())
    }

    pub fn free_executor(&self) -> Result<(), WorkerCapacityError> {
        let mut state = self.state.lock();
        if state.executors_in_use == 0 {
            return Err(WorkerCapacityError::NoExecutorToFree { worker_id: self.id });
        }
        state.executors_in_use -= 1;
        Ok(())
    }

    /// Marks the worker idle. If it is draining, kills it instead and
    /// fails with `WorkerShutdownError` so the allocator does not
    /// requeue it (spec §4.B, §4.G `add_idle_worker`).
    pub async fn mark_as_idle(self: &Arc<Self>) -> Result<(), MarkIdleError> {
        let should_kill = {
            let mut state = self.state.lock();
            if state.executors_in_use != 0 {
                return Err(WorkerCapacityError::NotIdle { worker_id: self.id, in_use: state.executors_in_use }
                    .into());
            }
            state.current_build_id = None;
            state.is_in_shutdown_mode
        };
        if should_kill {
            self.kill().await;
            return Err(WorkerShutdownError { worker_id: self.id }.into());
        }
        Ok(())
    }

    /// Sets the drain flag; a worker with no current build is killed
    /// immediately rather than left idle-but-shutting-down.
    pub async fn set_shutdown_mode(self: &Arc<Self>) {
        let should_kill_now = {
            let mut state = self.state.lock();
            state.is_in_shutdown_mode = true;
            state.current_build_id.is_none()
        };
        if should_kill_now {
            self.kill().await;
        }
    }

    /// RPCs the worker to self-terminate and marks it dead regardless
    /// of whether the RPC itself succeeds (the worker is going away
    /// either way).
    pub async fn kill(&self) {
        if let Err(e) = self.transport.kill(&self.url, &self.session_id).await {
            tracing::warn!(worker_id = %self.id, error = %e, "kill RPC failed, worker may already be gone");
        }
        self.state.lock().is_alive = false;
    }

    /// Cached liveness: the value from the last probe, without
    /// performing a new one.
    pub fn is_alive(&self) -> bool {
        self.is_alive_cached()
    }

    /// Uncached liveness probe. The response must echo the session
    /// token recorded at registration; a mismatch means the worker
    /// process restarted underneath this proxy and must be treated as
    /// dead even though something answered (spec §3 Worker invariant
    /// 3, §4.B).
    pub async fn is_alive_uncached(&self) -> bool {
        let result = self.transport.probe(&self.url, &self.session_id).await;
        let alive = match result {
            Ok(body) if body.is_alive && body.session_id == self.session_id => true,
            Ok(_) | Err(_) => false,
        };
        self.state.lock().is_alive = alive;
        alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::{Call, FakeWorkerTransport};
    use crate::transport::LivenessBody;

    fn worker(session_id: &str) -> Arc<Worker<FakeWorkerTransport>> {
        Worker::new(WorkerId::from_raw(1), "http://worker", 2, session_id, FakeWorkerTransport::new(session_id))
    }

    #[tokio::test]
    async fn setup_records_build_id_before_rpc_completes() {
        let w = worker("sess-1");
        w.setup(BuildId::from_raw(5), 0, &HashMap::new()).await.unwrap();
        assert_eq!(w.current_build_id(), Some(BuildId::from_raw(5)));
    }

    #[tokio::test]
    async fn claim_past_capacity_fails() {
        let w = worker("sess-1");
        w.claim_executor().unwrap();
        w.claim_executor().unwrap();
        assert!(w.claim_executor().is_err());
    }

    #[tokio::test]
    async fn free_past_zero_fails() {
        let w = worker("sess-1");
        assert!(w.free_executor().is_err());
    }

    #[tokio::test]
    async fn mark_idle_with_executors_in_use_fails() {
        let w = worker("sess-1");
        w.claim_executor().unwrap();
        assert!(w.mark_as_idle().await.is_err());
    }

    #[tokio::test]
    async fn mark_idle_while_shutting_down_kills_and_fails() {
        let w = worker("sess-1");
        w.set_shutdown_mode().await; // no current build -> kills immediately
        assert!(!w.is_alive_cached());
    }

    #[tokio::test]
    async fn start_subjob_on_dead_worker_fails_without_dispatching() {
        let w = worker("sess-1");
        w.kill().await;
        let result = w.start_subjob(Subjob::new(0, vec![])).await;
        assert!(matches!(result, Err(StartSubjobError::Dead(_))));
    }

    #[tokio::test]
    async fn start_subjob_while_shutting_down_fails() {
        let w = worker("sess-1");
        w.setup(BuildId::from_raw(1), 0, &HashMap::new()).await.unwrap();
        w.claim_executor().unwrap();
        w.set_shutdown_mode().await; // has a current build, so not killed immediately
        assert!(w.is_alive_cached());
        let result = w.start_subjob(Subjob::new(0, vec![])).await;
        assert!(matches!(result, Err(StartSubjobError::Shutdown(_))));
    }

    #[tokio::test]
    async fn uncached_probe_marks_dead_on_session_mismatch() {
        let w = worker("sess-1");
        w.transport.set_probe_response(Ok(LivenessBody { is_alive: true, session_id: "different".into() }));
        assert!(!w.is_alive_uncached().await);
        assert!(!w.is_alive_cached());
    }

    #[tokio::test]
    async fn uncached_probe_marks_dead_on_transport_error() {
        let w = worker("sess-1");
        w.transport.set_probe_response(Err("boom".into()));
        assert!(!w.is_alive_uncached().await);
    }

    #[tokio::test]
    async fn uncached_probe_stays_alive_on_matching_session() {
        let w = worker("sess-1");
        assert!(w.is_alive_uncached().await);
        assert_eq!(w.transport.calls(), vec![Call::Probe]);
    }
}
