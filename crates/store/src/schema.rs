//! SQLite schema (spec §6 "Persisted state").
//!
//! Applied with a single multi-statement `execute` rather than
//! `sqlx::migrate!`, since the latter needs a `migrations/` directory
//! resolved at compile time against a real database — this keeps the
//! schema self-contained in the crate that owns it.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS builds (
    id                  INTEGER PRIMARY KEY,
    job_name            TEXT NOT NULL,
    state               TEXT NOT NULL,
    error_message       TEXT,
    build_request_json  TEXT NOT NULL,
    results_dir         TEXT NOT NULL,
    archive_path        TEXT,
    max_executors       INTEGER NOT NULL,
    max_executors_per_worker INTEGER NOT NULL,
    timing_file_path    TEXT
);

CREATE TABLE IF NOT EXISTS subjobs (
    build_id    INTEGER NOT NULL REFERENCES builds(id),
    subjob_id   INTEGER NOT NULL,
    finished    INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (build_id, subjob_id)
);

CREATE TABLE IF NOT EXISTS atoms (
    build_id        INTEGER NOT NULL,
    subjob_id       INTEGER NOT NULL,
    atom_id         INTEGER NOT NULL,
    command         TEXT NOT NULL,
    expected_time_ms INTEGER,
    actual_time_ms  INTEGER,
    exit_code       INTEGER,
    state           TEXT NOT NULL,
    PRIMARY KEY (build_id, subjob_id, atom_id),
    FOREIGN KEY (build_id, subjob_id) REFERENCES subjobs(build_id, subjob_id)
);

CREATE TABLE IF NOT EXISTS failed_artifact_directories (
    build_id    INTEGER NOT NULL REFERENCES builds(id),
    directory   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS failed_subjobs_atom_pairs (
    build_id    INTEGER NOT NULL REFERENCES builds(id),
    subjob_id   INTEGER NOT NULL,
    atom_id     INTEGER NOT NULL
);
"#;
