//! `WorkerAllocator`: matches idle workers to builds waiting for more
//! of them (spec §4.G).

use std::sync::Arc;

use clusterrunner_core::{Clock, OrderedSetQueue, SharedOrderedSetQueue};
use clusterrunner_worker::{Worker, WorkerTransport};

use crate::pool::BuildSchedulerPool;

/// Owns the idle-worker queue and the background loop that drains it
/// against whichever build is currently at the front of the pool's
/// waiting queue.
pub struct WorkerAllocator<C: Clock, T: WorkerTransport> {
    idle_workers: SharedOrderedSetQueue<Arc<Worker<T>>>,
    pool: Arc<BuildSchedulerPool<C, T>>,
}

impl<C: Clock, T: WorkerTransport> WorkerAllocator<C, T> {
    pub fn new(pool: Arc<BuildSchedulerPool<C, T>>) -> Arc<Self> {
        Arc::new(Self { idle_workers: Arc::new(OrderedSetQueue::new()), pool })
    }

    /// Adds a worker to the idle queue, first RPCing it to clear any
    /// prior build state. A worker that turns out to be draining
    /// doesn't get re-added — it was already killed by `mark_as_idle`
    /// (spec §4.B `add_idle_worker`).
    pub async fn add_idle_worker(&self, worker: Arc<Worker<T>>) {
        match worker.mark_as_idle().await {
            Ok(()) => self.idle_workers.put(worker),
            Err(_) => {
                tracing::debug!(worker_id = %worker.id(), "worker shutting down, not requeued as idle");
            }
        }
    }

    /// Runs forever, pairing idle workers with builds that still need
    /// them. Intended to be spawned once as a background task per spec
    /// §4.G's documented pseudocode:
    ///
    /// ```text
    /// loop:
    ///     scheduler = pool.next_prepared_build_scheduler()
    ///     while scheduler.needs_more_workers():
    ///         worker = idle_workers.get()
    ///         if worker is dead or shutting down: drop it, continue
    ///         if scheduler.needs_more_workers() still true: scheduler.allocate_worker(worker)
    ///         else: add_idle_worker(worker)
    /// ```
    pub async fn run(self: Arc<Self>) {
        loop {
            let scheduler = self.pool.next_prepared_build_scheduler().await;
            while scheduler.needs_more_workers() {
                let worker = self.idle_workers.get().await;
                if worker.is_shutdown() || !worker.is_alive_uncached().await {
                    tracing::debug!(worker_id = %worker.id(), "dropping dead/shutting-down worker from idle queue");
                    continue;
                }
                // `needs_more_workers` may have flipped false between the
                // loop guard and here (another allocation satisfied it
                // first); recheck before committing this worker so it goes
                // back to the idle queue instead of being allocated for
                // nothing.
                if !scheduler.needs_more_workers() {
                    self.add_idle_worker(worker).await;
                    continue;
                }
                // Still a known benign race per spec §4.G: the build may
                // finish between this check and the call below, wasting
                // one setup RPC.
                if let Err(e) = scheduler.allocate_worker(Arc::clone(&worker)).await {
                    tracing::warn!(worker_id = %worker.id(), error = %e, "allocate_worker failed, returning worker to idle queue");
                    self.idle_workers.put(worker);
                }
            }
        }
    }

    pub fn idle_worker_count(&self) -> usize {
        self.idle_workers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterrunner_core::{BuildId, FakeClock, WorkerId};
    use clusterrunner_project::ShellJobProjectType;
    use clusterrunner_worker::FakeWorkerTransport;

    use crate::build::Build;

    const SAMPLE: &str = r#"
        [job]
        name = "demo"
        max_executors = 4
        max_executors_per_worker = 2

        [[subjobs]]
        atoms = ["echo one"]
    "#;

    fn fake_worker(id: u64, num_executors: u32) -> Arc<Worker<FakeWorkerTransport>> {
        Worker::new(WorkerId::from_raw(id), "http://worker", num_executors, "sess", FakeWorkerTransport::new("sess"))
    }

    #[tokio::test]
    async fn add_idle_worker_queues_a_live_worker() {
        let pool: Arc<BuildSchedulerPool<FakeClock, FakeWorkerTransport>> = BuildSchedulerPool::new();
        let allocator = WorkerAllocator::new(pool);
        allocator.add_idle_worker(fake_worker(1, 2)).await;
        assert_eq!(allocator.idle_worker_count(), 1);
    }

    #[tokio::test]
    async fn add_idle_worker_skips_a_draining_worker() {
        let pool: Arc<BuildSchedulerPool<FakeClock, FakeWorkerTransport>> = BuildSchedulerPool::new();
        let allocator = WorkerAllocator::new(pool);
        let worker = fake_worker(1, 2);
        worker.set_shutdown_mode().await;
        allocator.add_idle_worker(worker).await;
        assert_eq!(allocator.idle_worker_count(), 0);
    }

    #[tokio::test]
    async fn run_allocates_an_idle_worker_to_a_waiting_build() {
        let pool: Arc<BuildSchedulerPool<FakeClock, FakeWorkerTransport>> = BuildSchedulerPool::new();
        let allocator = WorkerAllocator::new(Arc::clone(&pool));

        let build = prepared_build();
        let scheduler = pool.get(&build).await;
        pool.add_build_waiting_for_workers(build.id());

        let run_handle = tokio::spawn(Arc::clone(&allocator).run());
        allocator.add_idle_worker(fake_worker(3, 2)).await;

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while scheduler.allocated_worker_count().await == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("allocator should have allocated the idle worker");

        run_handle.abort();
    }

    fn prepared_build() -> Arc<Build<FakeClock>> {
        let build = Build::new(BuildId::from_raw(1), serde_json::json!({}), "/tmp".into(), FakeClock::new());
        let project = ShellJobProjectType::from_toml_str(SAMPLE, "<test>", "/tmp").unwrap();
        build.prepare(&project).unwrap();
        build
    }
}
