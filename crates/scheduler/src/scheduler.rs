//! `BuildScheduler`: per-build dispatch policy (spec §4.E).
//!
//! Owns the sequence spec §5 calls out as the one that must be
//! serialized: pop-from-unstarted, start-subjob-or-requeue,
//! mark-in-progress. `subjob_assignment_mutex` is a `tokio::sync::Mutex`
//! because it is held across the (fire-and-forget-dispatching, but
//! still `.await`-ing) call into `Worker::start_subjob`.

use std::collections::HashMap;
use std::sync::Arc;

use clusterrunner_core::{BuildEvent, BuildId, Clock, WorkerId};
use clusterrunner_worker::{StartSubjobError, Worker, WorkerTransport};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::build::Build;

/// One per build. Non-owning references to the `Build` and to whatever
/// `Worker`s it has claimed; the scheduler pool owns the `BuildScheduler`
/// itself.
pub struct BuildScheduler<C: Clock, T: WorkerTransport> {
    build: Arc<Build<C>>,
    allocated_workers: AsyncMutex<HashMap<WorkerId, (Arc<Worker<T>>, u32)>>,
    subjob_assignment_mutex: AsyncMutex<()>,
    needs_more_workers_tx: mpsc::UnboundedSender<BuildId>,
}

impl<C: Clock, T: WorkerTransport> BuildScheduler<C, T> {
    pub fn new(build: Arc<Build<C>>, needs_more_workers_tx: mpsc::UnboundedSender<BuildId>) -> Arc<Self> {
        Arc::new(Self {
            build,
            allocated_workers: AsyncMutex::new(HashMap::new()),
            subjob_assignment_mutex: AsyncMutex::new(()),
            needs_more_workers_tx,
        })
    }

    pub fn build(&self) -> &Arc<Build<C>> {
        &self.build
    }

    pub fn needs_more_workers(&self) -> bool {
        self.build.needs_more_workers()
    }

    /// Claims `worker` for this build: RPCs setup, records the
    /// allocation, then immediately starts feeding it subjobs (spec
    /// §4.D `allocate_worker` + `begin_subjob_executions_on_worker`).
    pub async fn allocate_worker(&self, worker: Arc<Worker<T>>) -> Result<(), clusterrunner_core::WorkerError> {
        let executor_start_index = self.build.executors_allocated();
        let overrides = HashMap::new();
        worker.setup(self.build.id(), executor_start_index, &overrides).await?;

        let grant = worker.num_executors().min(self.build.max_executors_per_worker());
        self.build.add_executors_allocated(grant);
        self.allocated_workers.lock().await.insert(worker.id(), (Arc::clone(&worker), grant));

        self.begin_subjob_executions_on_worker(worker).await;
        Ok(())
    }

    async fn begin_subjob_executions_on_worker(&self, worker: Arc<Worker<T>>) {
        let headroom = self.build.max_executors().saturating_sub(self.build.executors_in_use());
        let slots = worker.num_executors().min(self.build.max_executors_per_worker()).min(headroom);
        for _ in 0..slots {
            if worker.claim_executor().is_err() {
                break;
            }
            self.build.add_executors_in_use(1);
            self.execute_next_subjob_or_free_executor(Arc::clone(&worker)).await;
        }
    }

    /// The serialized sequence from spec §4.D/§5: pop a subjob (or
    /// free the executor if there isn't one), dispatch it, and requeue
    /// on a `WorkerShutdownError` so a peer scheduler never observes a
    /// transiently empty queue and tears itself down, stranding the
    /// build.
    pub async fn execute_next_subjob_or_free_executor(&self, worker: Arc<Worker<T>>) {
        let _guard = self.subjob_assignment_mutex.lock().await;

        // The dispatcher MUST NOT dispatch further subjobs once
        // canceled (spec §4.D cancellation contract).
        if self.build.is_canceled() {
            self.free_and_maybe_teardown(worker).await;
            return;
        }

        match self.build.try_claim_unstarted() {
            None => {
                self.free_and_maybe_teardown(worker).await;
            }
            Some(subjob_id) => {
                let Some(subjob) = self.build.subjob(subjob_id) else {
                    tracing::error!(subjob_id, "claimed unstarted id with no matching subjob record");
                    return;
                };
                let is_first = self.build.mark_first_dispatch();
                match worker.start_subjob(subjob).await {
                    Ok(()) => {
                        if is_first {
                            self.build.fsm().trigger(BuildEvent::StartBuilding);
                        }
                    }
                    Err(StartSubjobError::Shutdown(_)) => {
                        tracing::warn!(
                            subjob_id,
                            worker_id = %worker.id(),
                            "worker entered shutdown mode mid-dispatch, requeuing subjob to the back of unstarted"
                        );
                        self.build.requeue_unstarted(subjob_id);
                        self.free_and_maybe_teardown(worker).await;
                    }
                    Err(e) => {
                        tracing::warn!(subjob_id, worker_id = %worker.id(), error = %e, "subjob dispatch failed, requeuing");
                        self.build.requeue_unstarted(subjob_id);
                        self.free_and_maybe_teardown(worker).await;
                    }
                }
            }
        }
    }

    /// Frees one executor on `worker`; if that drains it to zero,
    /// removes it from this build's allocation, tears it down, and
    /// (if it was the last allocated worker and more are still needed)
    /// re-registers the build with the scheduler pool via the
    /// `needs_more_workers` channel — no back-reference to the pool
    /// required (spec §9 redesign note).
    async fn free_and_maybe_teardown(&self, worker: Arc<Worker<T>>) {
        if worker.free_executor().is_err() {
            return;
        }
        self.build.sub_executors_in_use(1);

        if worker.executors_in_use() != 0 {
            return;
        }

        let grant = {
            let mut allocated = self.allocated_workers.lock().await;
            allocated.remove(&worker.id()).map(|(_, grant)| grant)
        };
        let Some(grant) = grant else { return };
        self.build.sub_executors_allocated(grant);
        worker.teardown().await;

        let now_empty = self.allocated_workers.lock().await.is_empty();
        if now_empty && self.build.needs_more_workers() {
            let _ = self.needs_more_workers_tx.send(self.build.id());
        }
    }

    /// Tears down every worker still allocated to this build (used on
    /// cancellation and on terminal FSM entry).
    pub async fn teardown_all(&self) {
        let workers: Vec<_> = self.allocated_workers.lock().await.drain().map(|(_, (w, _))| w).collect();
        for worker in workers {
            worker.teardown().await;
        }
    }

    pub async fn allocated_worker_count(&self) -> usize {
        self.allocated_workers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterrunner_core::{BuildId, FakeClock};
    use clusterrunner_project::ShellJobProjectType;
    use clusterrunner_worker::{FakeTransportCall, FakeWorkerTransport, Worker};

    const SAMPLE: &str = r#"
        [job]
        name = "demo"
        max_executors = 4
        max_executors_per_worker = 2

        [[subjobs]]
        atoms = ["echo one"]

        [[subjobs]]
        atoms = ["echo two"]
    "#;

    fn prepared_build() -> Arc<Build<FakeClock>> {
        let build = Build::new(BuildId::from_raw(1), serde_json::json!({}), "/tmp".into(), FakeClock::new());
        let project = ShellJobProjectType::from_toml_str(SAMPLE, "<test>", "/tmp").unwrap();
        build.prepare(&project).unwrap();
        build
    }

    fn scheduler_with_channel(
        build: Arc<Build<FakeClock>>,
    ) -> (Arc<BuildScheduler<FakeClock, FakeWorkerTransport>>, mpsc::UnboundedReceiver<BuildId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BuildScheduler::new(build, tx), rx)
    }

    fn fake_worker(num_executors: u32) -> Arc<Worker<FakeWorkerTransport>> {
        Worker::new(WorkerId::from_raw(7), "http://worker", num_executors, "sess-1", FakeWorkerTransport::new("sess-1"))
    }

    #[tokio::test]
    async fn allocate_worker_dispatches_subjobs_up_to_its_capacity() {
        let build = prepared_build();
        let (scheduler, _rx) = scheduler_with_channel(Arc::clone(&build));
        let worker = fake_worker(2);

        scheduler.allocate_worker(Arc::clone(&worker)).await.unwrap();

        let calls = worker.transport().calls();
        let subjob_dispatches = calls.iter().filter(|c| matches!(c, FakeTransportCall::StartSubjob { .. })).count();
        assert_eq!(subjob_dispatches, 2);
        assert_eq!(scheduler.allocated_worker_count().await, 1);
    }

    #[tokio::test]
    async fn canceled_build_frees_executor_without_dispatching() {
        let build = prepared_build();
        build.cancel();
        let (scheduler, _rx) = scheduler_with_channel(Arc::clone(&build));
        let worker = fake_worker(1);
        worker.claim_executor().unwrap();

        build.add_executors_in_use(1);
        scheduler.execute_next_subjob_or_free_executor(Arc::clone(&worker)).await;

        assert_eq!(worker.executors_in_use(), 0);
        assert!(worker
            .transport()
            .calls()
            .iter()
            .all(|c| !matches!(c, FakeTransportCall::StartSubjob { .. })));
    }

    #[tokio::test]
    async fn last_worker_draining_to_zero_reports_needs_more_workers_if_unstarted_remain() {
        let build = prepared_build();
        let (scheduler, mut rx) = scheduler_with_channel(Arc::clone(&build));
        let worker = fake_worker(1);

        // Consume the only executor directly so freeing it below drains
        // this worker to zero without having started a subjob.
        worker.claim_executor().unwrap();
        scheduler.allocated_workers.lock().await.insert(worker.id(), (Arc::clone(&worker), 1));
        build.add_executors_allocated(1);

        scheduler.free_and_maybe_teardown(Arc::clone(&worker)).await;

        assert_eq!(scheduler.allocated_worker_count().await, 0);
        assert_eq!(rx.recv().await, Some(build.id()));
    }

    #[tokio::test]
    async fn teardown_all_clears_every_allocated_worker() {
        let build = prepared_build();
        let (scheduler, _rx) = scheduler_with_channel(Arc::clone(&build));
        let worker = fake_worker(2);
        scheduler.allocate_worker(Arc::clone(&worker)).await.unwrap();

        scheduler.teardown_all().await;

        assert_eq!(scheduler.allocated_worker_count().await, 0);
        assert!(worker.transport().calls().iter().any(|c| matches!(c, FakeTransportCall::Teardown { .. })));
    }
}
