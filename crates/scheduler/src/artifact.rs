//! `BuildArtifact`: the post-build aggregate (spec §3 SUPPLEMENT,
//! §4.D `mark_subjob_complete`/post-build task).
//!
//! Grounded in the responsibilities `build.py`'s
//! `_create_build_artifact`/`_read_subjob_timings_from_results` imply:
//! a results directory full of `artifact_{subjob}_{atom}/` output,
//! optionally a `failures.txt`, a timing file, and a zip archive of
//! the whole directory.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use clusterrunner_core::{AtomId, SubjobId};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::error::ArtifactError;

#[derive(Debug, Clone)]
pub struct BuildArtifact {
    results_dir: PathBuf,
    archive_path: PathBuf,
    failed_commands: Vec<(SubjobId, AtomId)>,
}

impl BuildArtifact {
    pub fn failed_commands(&self) -> &[(SubjobId, AtomId)] {
        &self.failed_commands
    }

    pub fn failed_artifact_directories(&self) -> Vec<PathBuf> {
        self.failed_commands
            .iter()
            .map(|(sj, atom)| self.results_dir.join(format!("artifact_{sj}_{atom}")))
            .collect()
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Reconstruct a handle to an artifact already written to disk, for
    /// rehydrating a finished build loaded back from the store.
    pub fn from_parts(results_dir: PathBuf, archive_path: PathBuf, failed_commands: Vec<(SubjobId, AtomId)>) -> Self {
        Self { results_dir, archive_path, failed_commands }
    }

    /// Build the artifact: write `failures.txt` (if there were any
    /// failures), write the timing file, then zip the whole results
    /// directory. This is what `POSTBUILD_TASKS_COMPLETE` is gated on
    /// (spec §9 open-question resolution 2) — the FSM only advances
    /// once the archive file actually exists on disk.
    pub fn create(
        results_dir: PathBuf,
        failed_commands: Vec<(SubjobId, AtomId)>,
        timing_file_path: Option<&Path>,
        timing_json: &str,
    ) -> Result<Self, ArtifactError> {
        std::fs::create_dir_all(&results_dir)
            .map_err(|source| ArtifactError::CreateDir { path: results_dir.display().to_string(), source })?;

        if !failed_commands.is_empty() {
            let failures_path = results_dir.join("failures.txt");
            let mut file = File::create(&failures_path)
                .map_err(|source| ArtifactError::Write { path: failures_path.display().to_string(), source })?;
            for (sj, atom) in &failed_commands {
                writeln!(file, "artifact_{sj}_{atom}")
                    .map_err(|source| ArtifactError::Write { path: failures_path.display().to_string(), source })?;
            }
        }

        if let Some(timing_path) = timing_file_path {
            if let Some(parent) = timing_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|source| ArtifactError::CreateDir { path: parent.display().to_string(), source })?;
            }
            std::fs::write(timing_path, timing_json)
                .map_err(|source| ArtifactError::Write { path: timing_path.display().to_string(), source })?;
        }

        let archive_path = results_dir.join("artifacts.zip");
        Self::zip_directory(&results_dir, &archive_path)?;

        Ok(Self { results_dir, archive_path, failed_commands })
    }

    fn zip_directory(dir: &Path, archive_path: &Path) -> Result<(), ArtifactError> {
        let file = File::create(archive_path)
            .map_err(|source| ArtifactError::Write { path: archive_path.display().to_string(), source })?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        let mut entries: Vec<PathBuf> = Vec::new();
        collect_entries(dir, dir, &mut entries);

        for entry in entries {
            let full_path = dir.join(&entry);
            let name = entry.to_string_lossy().replace('\\', "/");
            if full_path.is_dir() {
                zip.add_directory(format!("{name}/"), options)
                    .map_err(|source| ArtifactError::Zip { path: archive_path.display().to_string(), source })?;
            } else {
                zip.start_file(name, options)
                    .map_err(|source| ArtifactError::Zip { path: archive_path.display().to_string(), source })?;
                let bytes = std::fs::read(&full_path)
                    .map_err(|source| ArtifactError::Write { path: full_path.display().to_string(), source })?;
                zip.write_all(&bytes)
                    .map_err(|source| ArtifactError::Write { path: full_path.display().to_string(), source })?;
            }
        }

        zip.finish().map_err(|source| ArtifactError::Zip { path: archive_path.display().to_string(), source })?;
        Ok(())
    }
}

fn collect_entries(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(read_dir) = std::fs::read_dir(dir) else { return };
    for entry in read_dir.flatten() {
        let path = entry.path();
        if path == root.join("artifacts.zip") {
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else { continue };
        out.push(relative.to_path_buf());
        if path.is_dir() {
            collect_entries(root, &path, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    #[test]
    fn archive_contains_failures_txt_when_a_subjob_fails() {
        let dir = tempfile::tempdir().unwrap();
        let subjob_dir = dir.path().join("artifact_3_0");
        std::fs::create_dir_all(&subjob_dir).unwrap();
        std::fs::write(subjob_dir.join("result.txt"), "boom").unwrap();

        let artifact = BuildArtifact::create(dir.path().to_path_buf(), vec![(3, 0)], None, "{}").unwrap();
        assert_eq!(artifact.failed_commands(), &[(3, 0)]);

        let zip_file = File::open(artifact.archive_path()).unwrap();
        let mut archive = zip::ZipArchive::new(zip_file).unwrap();
        let mut names: Vec<String> = (0..archive.len()).map(|i| archive.by_index(i).unwrap().name().to_string()).collect();
        names.sort();
        assert!(names.iter().any(|n| n == "failures.txt"));

        let mut failures = String::new();
        archive.by_name("failures.txt").unwrap().read_to_string(&mut failures).unwrap();
        assert!(failures.contains("artifact_3_0"));
    }

    #[test]
    fn archive_omits_failures_txt_when_clean() {
        let dir = tempfile::tempdir().unwrap();
        let subjob_dir = dir.path().join("artifact_0_0");
        std::fs::create_dir_all(&subjob_dir).unwrap();
        std::fs::write(subjob_dir.join("result.txt"), "ok").unwrap();

        let artifact = BuildArtifact::create(dir.path().to_path_buf(), vec![], None, "{}").unwrap();
        let zip_file = File::open(artifact.archive_path()).unwrap();
        let mut archive = zip::ZipArchive::new(zip_file).unwrap();
        assert!(archive.by_name("failures.txt").is_err());
    }
}
