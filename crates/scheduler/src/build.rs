//! The `Build` aggregate (spec §3, §4.D).
//!
//! Holds the subjob set, the FSM, and the low-level primitives
//! (`try_claim_unstarted`, `requeue_unstarted`, `mark_subjob_complete`,
//! ...) that `BuildScheduler` composes under its own
//! `subjob_assignment_mutex`. Splitting it this way keeps `Build` free
//! of any dependency on `Worker`/the scheduler pool, while the mutex
//! discipline documented in spec §5 lives where the worker RPCs are
//! actually issued.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use clusterrunner_core::{Atom, AtomId, BuildEvent, BuildFsm, BuildId, BuildResult, BuildState, Clock, Subjob, SubjobId};
use clusterrunner_project::{JobConfig, ProjectType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::artifact::BuildArtifact;
use crate::error::BuildError;

struct SubjobRecord {
    subjob: Subjob,
}

/// A compact, API-facing view of a build (spec §6 `GET /build/{id}`,
/// §8 round-trip property — identical to a freshly loaded copy modulo
/// the generated results directory).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildApiRepresentation {
    pub build_id: u64,
    pub status: BuildState,
    pub result: Option<BuildResult>,
    pub num_atoms: usize,
    pub num_subjobs: usize,
    pub failed_atoms: Vec<String>,
    pub error_message: Option<String>,
}

/// Aggregate of subjobs + FSM + artifact for one build execution.
pub struct Build<C: Clock> {
    id: BuildId,
    build_request: serde_json::Value,
    results_dir: PathBuf,
    job_name: Mutex<String>,
    max_executors: AtomicU32,
    max_executors_per_worker: AtomicU32,
    timing_file_path: Mutex<Option<PathBuf>>,

    all_subjobs: Mutex<HashMap<SubjobId, SubjobRecord>>,
    unstarted: Mutex<VecDeque<SubjobId>>,
    finished: Mutex<VecDeque<SubjobId>>,
    capacity: AtomicU32,

    fsm: Arc<BuildFsm<C>>,
    prepared: AtomicBool,
    first_dispatch_done: AtomicBool,
    completion_lock: Mutex<()>,

    executors_allocated: AtomicU32,
    executors_in_use: AtomicU32,
    teardowns_finished: AtomicBool,

    build_artifact: Mutex<Option<BuildArtifact>>,
    error_message: Mutex<Option<String>>,
}

impl<C: Clock> Build<C> {
    pub fn new(id: BuildId, build_request: serde_json::Value, results_dir: PathBuf, clock: C) -> Arc<Self> {
        Arc::new(Self {
            id,
            build_request,
            results_dir,
            job_name: Mutex::new(String::new()),
            max_executors: AtomicU32::new(u32::MAX),
            max_executors_per_worker: AtomicU32::new(u32::MAX),
            timing_file_path: Mutex::new(None),
            all_subjobs: Mutex::new(HashMap::new()),
            unstarted: Mutex::new(VecDeque::new()),
            finished: Mutex::new(VecDeque::new()),
            capacity: AtomicU32::new(0),
            fsm: BuildFsm::new(clock),
            prepared: AtomicBool::new(false),
            first_dispatch_done: AtomicBool::new(false),
            completion_lock: Mutex::new(()),
            executors_allocated: AtomicU32::new(0),
            executors_in_use: AtomicU32::new(0),
            teardowns_finished: AtomicBool::new(false),
            build_artifact: Mutex::new(None),
            error_message: Mutex::new(None),
        })
    }

    pub fn id(&self) -> BuildId {
        self.id
    }

    pub fn build_request(&self) -> &serde_json::Value {
        &self.build_request
    }

    pub fn results_dir(&self) -> &PathBuf {
        &self.results_dir
    }

    pub fn fsm(&self) -> &Arc<BuildFsm<C>> {
        &self.fsm
    }

    /// Single-shot: a second call always fails (spec §4.D invariant 7,
    /// §8 property 9).
    pub fn prepare(&self, project_type: &dyn ProjectType) -> Result<(), BuildError> {
        if self.prepared.swap(true, Ordering::SeqCst) {
            return Err(BuildError::AlreadyPrepared(self.id));
        }
        self.fsm.trigger(BuildEvent::StartPrepare);

        let subjobs = project_type.atomize();
        let config: &JobConfig = project_type.job_config();
        *self.job_name.lock() = config.name.clone();
        self.max_executors.store(config.max_executors, Ordering::SeqCst);
        self.max_executors_per_worker.store(config.max_executors_per_worker, Ordering::SeqCst);
        *self.timing_file_path.lock() = Some(project_type.timing_file_path(&config.name));

        self.capacity.store(subjobs.len() as u32, Ordering::SeqCst);
        let mut all = self.all_subjobs.lock();
        let mut unstarted = self.unstarted.lock();
        for subjob in subjobs {
            unstarted.push_back(subjob.id);
            all.insert(subjob.id, SubjobRecord { subjob });
        }
        drop(all);
        drop(unstarted);

        self.fsm.trigger(BuildEvent::FinishPrepare);
        Ok(())
    }

    /// Rehydrate a build from a store row on cache miss. Bypasses
    /// `prepare()` entirely — the subjob set, queue split, and FSM
    /// state are all already decided by what was persisted.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: BuildId,
        build_request: serde_json::Value,
        results_dir: PathBuf,
        clock: C,
        job_name: String,
        max_executors: u32,
        max_executors_per_worker: u32,
        timing_file_path: Option<PathBuf>,
        subjobs: Vec<Subjob>,
        unstarted_ids: Vec<SubjobId>,
        finished_ids: Vec<SubjobId>,
        state: BuildState,
        error_message: Option<String>,
        build_artifact: Option<BuildArtifact>,
    ) -> Arc<Self> {
        let capacity = subjobs.len() as u32;
        let mut all = HashMap::new();
        for subjob in subjobs {
            all.insert(subjob.id, SubjobRecord { subjob });
        }
        let teardowns_finished = matches!(state, BuildState::Finished);
        Arc::new(Self {
            id,
            build_request,
            results_dir,
            job_name: Mutex::new(job_name),
            max_executors: AtomicU32::new(max_executors),
            max_executors_per_worker: AtomicU32::new(max_executors_per_worker),
            timing_file_path: Mutex::new(timing_file_path),
            all_subjobs: Mutex::new(all),
            unstarted: Mutex::new(unstarted_ids.into()),
            finished: Mutex::new(finished_ids.into()),
            capacity: AtomicU32::new(capacity),
            fsm: BuildFsm::new_with_state(clock, state, error_message.clone()),
            prepared: AtomicBool::new(true),
            first_dispatch_done: AtomicBool::new(!matches!(state, BuildState::Queued | BuildState::Preparing)),
            completion_lock: Mutex::new(()),
            executors_allocated: AtomicU32::new(0),
            executors_in_use: AtomicU32::new(0),
            teardowns_finished: AtomicBool::new(teardowns_finished),
            build_artifact: Mutex::new(build_artifact),
            error_message: Mutex::new(error_message),
        })
    }

    pub fn total_subjobs(&self) -> usize {
        self.capacity.load(Ordering::SeqCst) as usize
    }

    pub fn max_executors(&self) -> u32 {
        self.max_executors.load(Ordering::SeqCst)
    }

    pub fn max_executors_per_worker(&self) -> u32 {
        self.max_executors_per_worker.load(Ordering::SeqCst)
    }

    pub fn executors_allocated(&self) -> u32 {
        self.executors_allocated.load(Ordering::SeqCst)
    }

    pub fn executors_in_use(&self) -> u32 {
        self.executors_in_use.load(Ordering::SeqCst)
    }

    pub fn add_executors_allocated(&self, n: u32) {
        self.executors_allocated.fetch_add(n, Ordering::SeqCst);
    }

    pub fn sub_executors_allocated(&self, n: u32) {
        self.executors_allocated.fetch_sub(n, Ordering::SeqCst);
    }

    pub fn add_executors_in_use(&self, n: u32) {
        self.executors_in_use.fetch_add(n, Ordering::SeqCst);
    }

    pub fn sub_executors_in_use(&self, n: u32) {
        self.executors_in_use.fetch_sub(n, Ordering::SeqCst);
    }

    /// `needs_more_workers()` per spec §4.D.
    pub fn needs_more_workers(&self) -> bool {
        if self.fsm.state() == BuildState::Canceled || self.fsm.state() == BuildState::Error {
            return false;
        }
        let allocated = self.executors_allocated();
        allocated < self.max_executors()
            && !self.unstarted.lock().is_empty()
            && allocated < self.total_subjobs() as u32
    }

    /// Pop one subjob id from `unstarted`, non-blocking.
    pub fn try_claim_unstarted(&self) -> Option<SubjobId> {
        self.unstarted.lock().pop_front()
    }

    /// Push a subjob id back onto the *back* of `unstarted` — the
    /// documented reordering deviation from a `WorkerShutdownError`
    /// requeue (spec §4.D, §5, original issue #226).
    pub fn requeue_unstarted(&self, id: SubjobId) {
        self.unstarted.lock().push_back(id);
    }

    pub fn subjob(&self, id: SubjobId) -> Option<Subjob> {
        self.all_subjobs.lock().get(&id).map(|r| r.subjob.clone())
    }

    /// Returns `true` exactly once, the first time any subjob is
    /// dispatched — the caller uses this to fire `START_BUILDING`.
    pub fn mark_first_dispatch(&self) -> bool {
        !self.first_dispatch_done.swap(true, Ordering::SeqCst)
    }

    /// Record a subjob as completed with its atom results. Returns
    /// `true` iff this completion made `finished` full (spec §4.D
    /// `mark_subjob_complete`).
    pub fn mark_subjob_complete(&self, id: SubjobId, atoms: Vec<Atom>) -> bool {
        if let Some(record) = self.all_subjobs.lock().get_mut(&id) {
            record.subjob.atoms = atoms;
        }
        let _guard = self.completion_lock.lock();
        let mut finished = self.finished.lock();
        finished.push_back(id);
        finished.len() as u32 >= self.capacity.load(Ordering::SeqCst)
    }

    pub fn is_finished_full(&self) -> bool {
        let _guard = self.completion_lock.lock();
        self.finished.lock().len() as u32 >= self.capacity.load(Ordering::SeqCst)
    }

    pub fn finish(&self) -> Result<(), BuildError> {
        if !self.is_finished_full() {
            return Err(BuildError::NotYetComplete(self.id));
        }
        self.teardowns_finished.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn teardowns_finished(&self) -> bool {
        self.teardowns_finished.load(Ordering::SeqCst)
    }

    pub fn mark_failed(&self, reason: impl Into<String>) {
        *self.error_message.lock() = Some(reason.into());
        self.fsm.trigger(BuildEvent::Fail);
    }

    pub fn cancel(&self) {
        self.fsm.trigger(BuildEvent::Cancel);
    }

    pub fn is_canceled(&self) -> bool {
        self.fsm.state() == BuildState::Canceled
    }

    pub fn error_message(&self) -> Option<String> {
        self.error_message.lock().clone().or_else(|| self.fsm.error_message())
    }

    pub fn build_artifact(&self) -> Option<BuildArtifact> {
        self.build_artifact.lock().clone()
    }

    pub fn set_build_artifact(&self, artifact: BuildArtifact) {
        *self.build_artifact.lock() = Some(artifact);
    }

    pub fn timing_file_path(&self) -> Option<PathBuf> {
        self.timing_file_path.lock().clone()
    }

    pub fn job_name(&self) -> String {
        self.job_name.lock().clone()
    }

    /// Snapshot of every subjob and its atoms, for persistence. Does
    /// not reflect the unstarted/finished split — callers needing that
    /// use `unstarted_ids()`/`finished_ids()` alongside this.
    pub fn all_subjobs_snapshot(&self) -> Vec<Subjob> {
        self.all_subjobs.lock().values().map(|r| r.subjob.clone()).collect()
    }

    pub fn unstarted_ids(&self) -> Vec<SubjobId> {
        self.unstarted.lock().iter().copied().collect()
    }

    pub fn finished_ids(&self) -> Vec<SubjobId> {
        self.finished.lock().iter().copied().collect()
    }

    pub fn all_atom_commands(&self) -> Vec<(SubjobId, AtomId, String)> {
        self.all_subjobs
            .lock()
            .values()
            .flat_map(|r| r.subjob.atoms.iter().map(|a| (r.subjob.id, a.id, a.command.clone())).collect::<Vec<_>>())
            .collect()
    }

    pub fn api_representation(&self) -> BuildApiRepresentation {
        let all = self.all_subjobs.lock();
        let num_subjobs = all.len();
        let num_atoms = all.values().map(|r| r.subjob.atoms.len()).sum();
        let failed_atoms: Vec<String> = all
            .values()
            .flat_map(|r| {
                r.subjob
                    .failed_atoms()
                    .map(|a| format!("artifact_{}_{}", r.subjob.id, a.id))
                    .collect::<Vec<_>>()
            })
            .collect();
        drop(all);

        let state = self.fsm.state();
        let result = match state {
            BuildState::Finished => {
                Some(if failed_atoms.is_empty() { BuildResult::NoFailures } else { BuildResult::Failure })
            }
            _ => None,
        };

        BuildApiRepresentation {
            build_id: self.id.get(),
            status: state,
            result,
            num_atoms,
            num_subjobs,
            failed_atoms,
            error_message: self.error_message(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterrunner_core::FakeClock;
    use clusterrunner_project::ShellJobProjectType;

    fn project(toml: &str) -> ShellJobProjectType {
        ShellJobProjectType::from_toml_str(toml, "<test>", "/tmp").unwrap()
    }

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

    #[test]
    fn prepare_sizes_queues_to_subjob_count() {
        let build = Build::new(BuildId::from_raw(1), serde_json::json!({}), "/tmp".into(), FakeClock::new());
        build.prepare(&project(SAMPLE)).unwrap();
        assert_eq!(build.total_subjobs(), 2);
        assert_eq!(build.fsm().state(), BuildState::Prepared);
    }

    #[test]
    fn second_prepare_call_fails() {
        let build = Build::new(BuildId::from_raw(1), serde_json::json!({}), "/tmp".into(), FakeClock::new());
        build.prepare(&project(SAMPLE)).unwrap();
        assert!(matches!(build.prepare(&project(SAMPLE)), Err(BuildError::AlreadyPrepared(_))));
    }

    #[test]
    fn unstarted_and_finished_never_overlap() {
        let build = Build::new(BuildId::from_raw(1), serde_json::json!({}), "/tmp".into(), FakeClock::new());
        build.prepare(&project(SAMPLE)).unwrap();
        let id = build.try_claim_unstarted().unwrap();
        assert!(!build.unstarted.lock().contains(&id));
        let full = build.mark_subjob_complete(id, vec![]);
        assert!(!full);
        assert!(build.finished.lock().contains(&id));
    }

    #[test]
    fn finished_full_exactly_when_all_subjobs_complete() {
        let build = Build::new(BuildId::from_raw(1), serde_json::json!({}), "/tmp".into(), FakeClock::new());
        build.prepare(&project(SAMPLE)).unwrap();
        let a = build.try_claim_unstarted().unwrap();
        let b = build.try_claim_unstarted().unwrap();
        assert!(!build.mark_subjob_complete(a, vec![]));
        assert!(build.mark_subjob_complete(b, vec![]));
        assert!(build.is_finished_full());
    }

    #[test]
    fn finish_before_all_subjobs_complete_fails() {
        let build = Build::new(BuildId::from_raw(1), serde_json::json!({}), "/tmp".into(), FakeClock::new());
        build.prepare(&project(SAMPLE)).unwrap();
        assert!(matches!(build.finish(), Err(BuildError::NotYetComplete(_))));
    }

    #[test]
    fn mark_failed_sets_error_message_and_fsm_state() {
        let build = Build::new(BuildId::from_raw(1), serde_json::json!({}), "/tmp".into(), FakeClock::new());
        build.mark_failed("boom");
        assert_eq!(build.fsm().state(), BuildState::Error);
        assert_eq!(build.error_message().as_deref(), Some("boom"));
    }

    #[test]
    fn first_dispatch_reported_exactly_once() {
        let build = Build::new(BuildId::from_raw(1), serde_json::json!({}), "/tmp".into(), FakeClock::new());
        assert!(build.mark_first_dispatch());
        assert!(!build.mark_first_dispatch());
    }
}
