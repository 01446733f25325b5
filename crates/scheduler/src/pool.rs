//! `BuildSchedulerPool`: registry of schedulers + the queue of builds
//! waiting for workers (spec §4.F).

use std::collections::HashMap;
use std::sync::Arc;

use clusterrunner_core::{BuildId, Clock};
use clusterrunner_worker::WorkerTransport;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::build::Build;
use crate::scheduler::BuildScheduler;

pub struct BuildSchedulerPool<C: Clock, T: WorkerTransport> {
    schedulers: AsyncMutex<HashMap<BuildId, Arc<BuildScheduler<C, T>>>>,
    waiting_tx: mpsc::UnboundedSender<BuildId>,
    waiting_rx: AsyncMutex<mpsc::UnboundedReceiver<BuildId>>,
}

impl<C: Clock, T: WorkerTransport> BuildSchedulerPool<C, T> {
    pub fn new() -> Arc<Self> {
        let (waiting_tx, waiting_rx) = mpsc::unbounded_channel();
        Arc::new(Self { schedulers: AsyncMutex::new(HashMap::new()), waiting_tx, waiting_rx: AsyncMutex::new(waiting_rx) })
    }

    /// Thread-safe lazy factory: one scheduler per build id, created
    /// under the registry lock (spec §4.F, §5 `Pool.scheduler_creation_mutex`).
    pub async fn get(&self, build: &Arc<Build<C>>) -> Arc<BuildScheduler<C, T>> {
        let mut schedulers = self.schedulers.lock().await;
        schedulers
            .entry(build.id())
            .or_insert_with(|| BuildScheduler::new(Arc::clone(build), self.waiting_tx.clone()))
            .clone()
    }

    pub async fn remove(&self, build_id: BuildId) {
        self.schedulers.lock().await.remove(&build_id);
    }

    /// Ids of every build with a live scheduler, for `GET /queue` (spec
    /// §6). Includes builds mid-dispatch, not just ones still waiting
    /// for workers.
    pub async fn active_build_ids(&self) -> Vec<BuildId> {
        self.schedulers.lock().await.keys().copied().collect()
    }

    /// Enqueue a prepared build's scheduler as waiting for workers.
    pub fn add_build_waiting_for_workers(&self, build_id: BuildId) {
        let _ = self.waiting_tx.send(build_id);
    }

    /// Blocks until a scheduler whose build still exists is available.
    /// Ids for builds that finished/were removed between enqueue and
    /// here are silently skipped.
    pub async fn next_prepared_build_scheduler(&self) -> Arc<BuildScheduler<C, T>> {
        loop {
            let mut rx = self.waiting_rx.lock().await;
            let Some(build_id) = rx.recv().await else {
                drop(rx);
                // Channel closed (pool dropped its sender side too);
                // this only happens at shutdown, park forever rather
                // than busy loop.
                std::future::pending::<()>().await;
                unreachable!();
            };
            drop(rx);
            let schedulers = self.schedulers.lock().await;
            if let Some(sched) = schedulers.get(&build_id) {
                return Arc::clone(sched);
            }
        }
    }
}

impl<C: Clock, T: WorkerTransport> Default for BuildSchedulerPool<C, T> {
    fn default() -> Self {
        unreachable!("use BuildSchedulerPool::new(), which returns an Arc")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterrunner_core::FakeClock;
    use clusterrunner_worker::FakeWorkerTransport;

    fn build() -> Arc<Build<FakeClock>> {
        Build::new(BuildId::from_raw(1), serde_json::json!({}), "/tmp".into(), FakeClock::new())
    }

    #[tokio::test]
    async fn get_is_idempotent_per_build_id() {
        let pool: Arc<BuildSchedulerPool<FakeClock, FakeWorkerTransport>> = BuildSchedulerPool::new();
        let build = build();
        let a = pool.get(&build).await;
        let b = pool.get(&build).await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn waiting_build_resolves_to_its_scheduler() {
        let pool: Arc<BuildSchedulerPool<FakeClock, FakeWorkerTransport>> = BuildSchedulerPool::new();
        let build = build();
        let scheduler = pool.get(&build).await;
        pool.add_build_waiting_for_workers(build.id());
        let resolved = pool.next_prepared_build_scheduler().await;
        assert!(Arc::ptr_eq(&scheduler, &resolved));
    }

    #[tokio::test]
    async fn removed_build_id_is_skipped_in_favor_of_the_next_one() {
        let pool: Arc<BuildSchedulerPool<FakeClock, FakeWorkerTransport>> = BuildSchedulerPool::new();
        let stale = build();
        let _stale_scheduler = pool.get(&stale).await;
        pool.add_build_waiting_for_workers(stale.id());
        pool.remove(stale.id()).await;

        let live = Build::new(BuildId::from_raw(2), serde_json::json!({}), "/tmp".into(), FakeClock::new());
        let live_scheduler = pool.get(&live).await;
        pool.add_build_waiting_for_workers(live.id());

        let resolved = pool.next_prepared_build_scheduler().await;
        assert!(Arc::ptr_eq(&live_scheduler, &resolved));
    }
}
