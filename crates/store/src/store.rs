//! `BuildStore`: the authoritative record of all builds (spec §4.H).
//!
//! Insertion-ordered in-memory cache backed by a relational store. Ids
//! are already monotonically assigned by the time a `Build` reaches
//! `add()` (via the shared `Counter`, at construction), so a
//! `BTreeMap<BuildId, _>` gives the same ordering the source gets from
//! an autoincrement primary key without this crate needing to assign
//! ids itself.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clusterrunner_core::{Atom, AtomId, AtomState, BuildId, BuildState, Clock, Subjob, SubjobId};
use clusterrunner_scheduler::{Build, BuildArtifact};
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::error::StoreError;
use crate::schema::SCHEMA;

pub struct BuildStore<C: Clock + Default> {
    pool: SqlitePool,
    cache: Mutex<BTreeMap<BuildId, Arc<Build<C>>>>,
}

impl<C: Clock + Default> BuildStore<C> {
    /// Opens (creating if absent) a SQLite database at `database_url`
    /// and applies the schema.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .unwrap_or_else(|_| SqliteConnectOptions::new().filename(database_url))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool, cache: Mutex::new(BTreeMap::new()) })
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, cache: Mutex::new(BTreeMap::new()) }
    }

    /// Persists `build` and places it in the cache. The source assigns
    /// the build id here via autoincrement; this workspace hands ids
    /// out from the shared `Counter` at `Build` construction instead
    /// (see DESIGN.md), so `add` only needs to persist and cache.
    pub async fn add(&self, build: Arc<Build<C>>) -> Result<(), StoreError> {
        self.persist(&build).await?;
        self.cache.lock().insert(build.id(), build);
        Ok(())
    }

    /// Cache lookup; on miss, attempts to rehydrate from the relational
    /// store and caches the result.
    pub async fn get(&self, id: BuildId) -> Result<Option<Arc<Build<C>>>, StoreError> {
        if let Some(build) = self.cache.lock().get(&id).cloned() {
            return Ok(Some(build));
        }
        match self.load(id).await? {
            Some(build) => {
                self.cache.lock().insert(id, Arc::clone(&build));
                Ok(Some(build))
            }
            None => Ok(None),
        }
    }

    /// Builds with ids in `(start, end]`, served from the cache.
    pub fn get_range(&self, start: BuildId, end: BuildId) -> Vec<Arc<Build<C>>> {
        self.cache
            .lock()
            .range((std::ops::Bound::Excluded(start), std::ops::Bound::Included(end)))
            .map(|(_, b)| Arc::clone(b))
            .collect()
    }

    /// Marks every cached, not-yet-finished build as failed and
    /// persists the change. Invoked during process shutdown.
    pub async fn clean_up(&self) -> Result<(), StoreError> {
        let unfinished: Vec<Arc<Build<C>>> =
            self.cache.lock().values().filter(|b| b.fsm().state() != BuildState::Finished).cloned().collect();
        for build in unfinished {
            build.mark_failed("Manager shutdown before completion");
            self.persist(&build).await?;
        }
        Ok(())
    }

    pub async fn count_all_builds(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM builds").fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    async fn persist(&self, build: &Build<C>) -> Result<(), StoreError> {
        let build_request_json = serde_json::to_string(build.build_request())?;
        let artifact = build.build_artifact();
        let archive_path = artifact.as_ref().map(|a| a.archive_path().display().to_string());

        sqlx::query(
            "INSERT INTO builds (id, job_name, state, error_message, build_request_json, results_dir,
                archive_path, max_executors, max_executors_per_worker, timing_file_path)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                job_name = excluded.job_name,
                state = excluded.state,
                error_message = excluded.error_message,
                archive_path = excluded.archive_path",
        )
        .bind(build.id().get() as i64)
        .bind(build.job_name())
        .bind(build.fsm().state().to_string())
        .bind(build.error_message())
        .bind(build_request_json)
        .bind(build.results_dir().display().to_string())
        .bind(archive_path)
        .bind(build.max_executors() as i64)
        .bind(build.max_executors_per_worker() as i64)
        .bind(build.timing_file_path().map(|p| p.display().to_string()))
        .execute(&self.pool)
        .await?;

        let finished: std::collections::HashSet<SubjobId> = build.finished_ids().into_iter().collect();
        for subjob in build.all_subjobs_snapshot() {
            sqlx::query(
                "INSERT INTO subjobs (build_id, subjob_id, finished) VALUES (?, ?, ?)
                 ON CONFLICT(build_id, subjob_id) DO UPDATE SET finished = excluded.finished",
            )
            .bind(build.id().get() as i64)
            .bind(subjob.id as i64)
            .bind(finished.contains(&subjob.id))
            .execute(&self.pool)
            .await?;

            for atom in &subjob.atoms {
                sqlx::query(
                    "INSERT INTO atoms (build_id, subjob_id, atom_id, command, expected_time_ms,
                        actual_time_ms, exit_code, state)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(build_id, subjob_id, atom_id) DO UPDATE SET
                        actual_time_ms = excluded.actual_time_ms,
                        exit_code = excluded.exit_code,
                        state = excluded.state",
                )
                .bind(build.id().get() as i64)
                .bind(subjob.id as i64)
                .bind(atom.id as i64)
                .bind(&atom.command)
                .bind(atom.expected_time_ms.map(|v| v as i64))
                .bind(atom.actual_time_ms.map(|v| v as i64))
                .bind(atom.exit_code.map(|v| v as i64))
                .bind(atom_state_str(atom.state))
                .execute(&self.pool)
                .await?;

                if atom.failed() {
                    sqlx::query(
                        "INSERT INTO failed_subjobs_atom_pairs (build_id, subjob_id, atom_id) VALUES (?, ?, ?)",
                    )
                    .bind(build.id().get() as i64)
                    .bind(subjob.id as i64)
                    .bind(atom.id as i64)
                    .execute(&self.pool)
                    .await?;
                }
            }
        }

        if let Some(artifact) = &artifact {
            for dir in artifact.failed_artifact_directories() {
                sqlx::query("INSERT INTO failed_artifact_directories (build_id, directory) VALUES (?, ?)")
                    .bind(build.id().get() as i64)
                    .bind(dir.display().to_string())
                    .execute(&self.pool)
                    .await?;
            }
        }

        Ok(())
    }

    async fn load(&self, id: BuildId) -> Result<Option<Arc<Build<C>>>, StoreError> {
        let Some(row) = sqlx::query("SELECT * FROM builds WHERE id = ?")
            .bind(id.get() as i64)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let job_name: String = row.try_get("job_name")?;
        let state_str: String = row.try_get("state")?;
        let error_message: Option<String> = row.try_get("error_message")?;
        let build_request_json: String = row.try_get("build_request_json")?;
        let results_dir: String = row.try_get("results_dir")?;
        let archive_path: Option<String> = row.try_get("archive_path")?;
        let max_executors: i64 = row.try_get("max_executors")?;
        let max_executors_per_worker: i64 = row.try_get("max_executors_per_worker")?;
        let timing_file_path: Option<String> = row.try_get("timing_file_path")?;

        let subjob_rows = sqlx::query("SELECT subjob_id, finished FROM subjobs WHERE build_id = ?")
            .bind(id.get() as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut subjobs = Vec::new();
        let mut unstarted_ids = Vec::new();
        let mut finished_ids = Vec::new();
        for subjob_row in subjob_rows {
            let subjob_id: i64 = subjob_row.try_get("subjob_id")?;
            let finished: bool = subjob_row.try_get("finished")?;
            let subjob_id = subjob_id as SubjobId;

            let atom_rows = sqlx::query(
                "SELECT atom_id, command, expected_time_ms, actual_time_ms, exit_code, state
                 FROM atoms WHERE build_id = ? AND subjob_id = ? ORDER BY atom_id",
            )
            .bind(id.get() as i64)
            .bind(subjob_id as i64)
            .fetch_all(&self.pool)
            .await?;

            let mut atoms = Vec::new();
            for atom_row in atom_rows {
                let atom_id: i64 = atom_row.try_get("atom_id")?;
                let command: String = atom_row.try_get("command")?;
                let expected_time_ms: Option<i64> = atom_row.try_get("expected_time_ms")?;
                let actual_time_ms: Option<i64> = atom_row.try_get("actual_time_ms")?;
                let exit_code: Option<i64> = atom_row.try_get("exit_code")?;
                let state: String = atom_row.try_get("state")?;
                atoms.push(Atom {
                    id: atom_id as AtomId,
                    command,
                    expected_time_ms: expected_time_ms.map(|v| v as u64),
                    actual_time_ms: actual_time_ms.map(|v| v as u64),
                    exit_code: exit_code.map(|v| v as i32),
                    state: atom_state_from_str(&state),
                });
            }

            subjobs.push(Subjob::new(subjob_id, atoms));
            if finished {
                finished_ids.push(subjob_id);
            } else {
                unstarted_ids.push(subjob_id);
            }
        }

        let failed_pairs: Vec<(SubjobId, AtomId)> = sqlx::query(
            "SELECT subjob_id, atom_id FROM failed_subjobs_atom_pairs WHERE build_id = ?",
        )
        .bind(id.get() as i64)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| {
            let sj: i64 = r.try_get("subjob_id").unwrap_or_default();
            let a: i64 = r.try_get("atom_id").unwrap_or_default();
            (sj as SubjobId, a as AtomId)
        })
        .collect();

        let build_artifact = archive_path.as_ref().map(|path| {
            BuildArtifact::from_parts(PathBuf::from(&results_dir), PathBuf::from(path), failed_pairs.clone())
        });

        let build_request = serde_json::from_str(&build_request_json)?;
        let state = build_state_from_str(&state_str);

        let build = Build::restore(
            id,
            build_request,
            PathBuf::from(results_dir),
            C::default(),
            job_name,
            max_executors as u32,
            max_executors_per_worker as u32,
            timing_file_path.map(PathBuf::from),
            subjobs,
            unstarted_ids,
            finished_ids,
            state,
            error_message,
            build_artifact,
        );
        Ok(Some(build))
    }
}

fn atom_state_str(state: AtomState) -> &'static str {
    match state {
        AtomState::NotStarted => "NOT_STARTED",
        AtomState::Running => "RUNNING",
        AtomState::Finished => "FINISHED",
    }
}

fn atom_state_from_str(s: &str) -> AtomState {
    match s {
        "RUNNING" => AtomState::Running,
        "FINISHED" => AtomState::Finished,
        _ => AtomState::NotStarted,
    }
}

fn build_state_from_str(s: &str) -> BuildState {
    match s {
        "PREPARING" => BuildState::Preparing,
        "PREPARED" => BuildState::Prepared,
        "BUILDING" => BuildState::Building,
        "FINISHED" => BuildState::Finished,
        "ERROR" => BuildState::Error,
        "CANCELED" => BuildState::Canceled,
        _ => BuildState::Queued,
    }
}
