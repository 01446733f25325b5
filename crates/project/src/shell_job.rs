//! `ShellJobProjectType`: the built-in stand-in for the full
//! YAML-config-plus-atomizer pipeline (spec §4.L).
//!
//! Reads a small TOML description:
//!
//! ```toml
//! [job]
//! name = "demo"
//! max_executors = 4
//! max_executors_per_worker = 2
//!
//! [[subjobs]]
//! atoms = ["echo one", "echo two"]
//!
//! [[subjobs]]
//! atoms = ["echo three"]
//! ```
//!
//! directly into `Vec<Subjob>`. Deliberately not a generalized config
//! language: one job section, a flat list of subjobs, each a flat list
//! of atom command strings.

use std::path::{Path, PathBuf};

use clusterrunner_core::{Atom, Subjob};
use serde::Deserialize;

use crate::error::ProjectTypeError;
use crate::job_config::{JobConfig, WorkerParamOverrides};
use crate::project_type::{default_timing_file_path, ProjectType};

#[derive(Debug, Deserialize)]
struct RawDescription {
    job: RawJob,
    #[serde(default)]
    subjobs: Vec<RawSubjob>,
}

#[derive(Debug, Deserialize)]
struct RawJob {
    name: String,
    #[serde(default = "default_max_executors")]
    max_executors: u32,
    #[serde(default = "default_max_executors")]
    max_executors_per_worker: u32,
    #[serde(default)]
    worker_param_overrides: WorkerParamOverrides,
}

fn default_max_executors() -> u32 {
    u32::MAX
}

#[derive(Debug, Deserialize)]
struct RawSubjob {
    atoms: Vec<String>,
}

pub struct ShellJobProjectType {
    config: JobConfig,
    subjobs: Vec<Subjob>,
    timing_dir: PathBuf,
    worker_param_overrides: WorkerParamOverrides,
}

impl ShellJobProjectType {
    /// Parse a TOML job description from disk.
    pub fn from_file(path: &Path, timing_dir: impl Into<PathBuf>) -> Result<Self, ProjectTypeError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ProjectTypeError::Read { path: path.display().to_string(), source })?;
        Self::from_toml_str(&contents, path.display().to_string(), timing_dir)
    }

    pub fn from_toml_str(
        contents: &str,
        path_for_errors: impl Into<String>,
        timing_dir: impl Into<PathBuf>,
    ) -> Result<Self, ProjectTypeError> {
        let path_for_errors = path_for_errors.into();
        let raw: RawDescription = toml::from_str(contents)
            .map_err(|source| ProjectTypeError::Parse { path: path_for_errors, source })?;

        let mut next_atom_id = 0u32;
        let subjobs = raw
            .subjobs
            .into_iter()
            .enumerate()
            .map(|(subjob_id, raw_subjob)| {
                let atoms = raw_subjob
                    .atoms
                    .into_iter()
                    .map(|command| {
                        let atom = Atom::new(next_atom_id, command);
                        next_atom_id += 1;
                        atom
                    })
                    .collect();
                Subjob::new(subjob_id as u32, atoms)
            })
            .collect();

        Ok(Self {
            config: JobConfig {
                name: raw.job.name,
                max_executors: raw.job.max_executors,
                max_executors_per_worker: raw.job.max_executors_per_worker,
            },
            subjobs,
            timing_dir: timing_dir.into(),
            worker_param_overrides: raw.job.worker_param_overrides,
        })
    }
}

impl ProjectType for ShellJobProjectType {
    fn job_config(&self) -> &JobConfig {
        &self.config
    }

    fn timing_file_path(&self, job_name: &str) -> PathBuf {
        default_timing_file_path(&self.timing_dir, job_name)
    }

    fn worker_param_overrides(&self) -> WorkerParamOverrides {
        self.worker_param_overrides.clone()
    }

    fn atomize(&self) -> Vec<Subjob> {
        self.subjobs.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [job]
        name = "demo"
        max_executors = 4
        max_executors_per_worker = 2

        [[subjobs]]
        atoms = ["echo one", "echo two"]

        [[subjobs]]
        atoms = ["echo three"]
    "#;

    #[test]
    fn parses_job_and_subjobs() {
        let project = ShellJobProjectType::from_toml_str(SAMPLE, "<test>", "/tmp").unwrap();
        assert_eq!(project.job_config().name, "demo");
        assert_eq!(project.job_config().max_executors, 4);
        let subjobs = project.atomize();
        assert_eq!(subjobs.len(), 2);
        assert_eq!(subjobs[0].atoms.len(), 2);
        assert_eq!(subjobs[1].atoms[0].command, "echo three");
    }

    #[test]
    fn atom_ids_are_unique_across_subjobs() {
        let project = ShellJobProjectType::from_toml_str(SAMPLE, "<test>", "/tmp").unwrap();
        let ids: Vec<u32> = project.atomize().iter().flat_map(|sj| sj.atoms.iter().map(|a| a.id)).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn missing_job_section_fails_to_parse() {
        let err = ShellJobProjectType::from_toml_str("[[subjobs]]\natoms = []\n", "<test>", "/tmp");
        assert!(err.is_err());
    }
}
