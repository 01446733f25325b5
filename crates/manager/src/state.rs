//! `AppState`: the handler-shared collaborators, threaded through axum
//! via `State` extraction the way the teacher's `daemon::listener`
//! handlers share a connection pool and registries.

use std::collections::HashMap;
use std::sync::Arc;

use clusterrunner_core::{BuildId, Clock, Counter, WorkerId};
use clusterrunner_scheduler::{BuildSchedulerPool, WorkerAllocator};
use clusterrunner_store::BuildStore;
use clusterrunner_worker::{Worker, WorkerTransport};
use parking_lot::Mutex;

use crate::config::ManagerConfig;
use crate::eventlog::EventLog;
use crate::signer::HmacSigner;

pub struct AppState<C: Clock + Default, T: WorkerTransport> {
    pub config: ManagerConfig,
    pub clock: C,
    pub build_id_source: Counter,
    pub worker_id_source: Counter,
    pub store: BuildStore<C>,
    pub scheduler_pool: Arc<BuildSchedulerPool<C, T>>,
    pub allocator: Arc<WorkerAllocator<C, T>>,
    pub workers: Mutex<HashMap<WorkerId, Arc<Worker<T>>>>,
    pub signer: HmacSigner,
    pub eventlog: Arc<EventLog>,
}

impl<C: Clock + Default, T: WorkerTransport> AppState<C, T> {
    pub fn new(config: ManagerConfig, clock: C, store: BuildStore<C>) -> Result<Self, std::io::Error> {
        let eventlog = Arc::new(EventLog::new(config.eventlog_file.clone())?);
        let signer = HmacSigner::new(config.secret.clone());
        let scheduler_pool = BuildSchedulerPool::new();
        let allocator = WorkerAllocator::new(Arc::clone(&scheduler_pool));
        Ok(Self {
            config,
            clock,
            build_id_source: Counter::new(),
            worker_id_source: Counter::new(),
            store,
            scheduler_pool,
            allocator,
            workers: Mutex::new(HashMap::new()),
            signer,
            eventlog,
        })
    }

    pub fn next_build_id(&self) -> BuildId {
        BuildId::from_raw(self.build_id_source.increment())
    }

    pub fn next_worker_id(&self) -> WorkerId {
        WorkerId::from_raw(self.worker_id_source.increment())
    }

    pub fn worker(&self, id: WorkerId) -> Option<Arc<Worker<T>>> {
        self.workers.lock().get(&id).cloned()
    }

    pub fn all_workers(&self) -> Vec<Arc<Worker<T>>> {
        self.workers.lock().values().cloned().collect()
    }
}
