//! Subjob / atom data model (spec §3, §GLOSSARY).
//!
//! An atom is one shell command; a subjob is an ordered list of atoms
//! dispatched together to a single worker executor. These types carry
//! no behavior beyond bookkeeping — dispatch, timing, and completion
//! are driven by `Build`/`BuildScheduler` in `clusterrunner-scheduler`.

use serde::{Deserialize, Serialize};

use crate::ids::{AtomId, SubjobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtomState {
    NotStarted,
    Running,
    Finished,
}

crate::simple_display!(AtomState {
    NotStarted => "NOT_STARTED",
    Running => "RUNNING",
    Finished => "FINISHED",
});

/// One atomic shell command within a subjob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Atom {
    pub id: AtomId,
    pub command: String,
    pub expected_time_ms: Option<u64>,
    pub actual_time_ms: Option<u64>,
    pub exit_code: Option<i32>,
    pub state: AtomState,
}

impl Atom {
    pub fn new(id: AtomId, command: impl Into<String>) -> Self {
        Self {
            id,
            command: command.into(),
            expected_time_ms: None,
            actual_time_ms: None,
            exit_code: None,
            state: AtomState::NotStarted,
        }
    }

    pub fn failed(&self) -> bool {
        matches!(self.exit_code, Some(code) if code != 0)
    }
}

/// An ordered list of atoms, the unit of dispatch to a worker executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subjob {
    pub id: SubjobId,
    pub atoms: Vec<Atom>,
}

impl Subjob {
    pub fn new(id: SubjobId, atoms: Vec<Atom>) -> Self {
        Self { id, atoms }
    }

    pub fn failed_atoms(&self) -> impl Iterator<Item = &Atom> {
        self.atoms.iter().filter(|a| a.failed())
    }
}

/// Pass/fail summary surfaced once a build reaches `FINISHED` (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildResult {
    NoFailures,
    Failure,
}

crate::simple_display!(BuildResult {
    NoFailures => "NO_FAILURES",
    Failure => "FAILURE",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atom_failed_requires_nonzero_exit_code() {
        let mut atom = Atom::new(0, "echo hi");
        assert!(!atom.failed());
        atom.exit_code = Some(0);
        assert!(!atom.failed());
        atom.exit_code = Some(1);
        assert!(atom.failed());
    }

    #[test]
    fn subjob_reports_only_failed_atoms() {
        let mut ok = Atom::new(0, "true");
        ok.exit_code = Some(0);
        let mut bad = Atom::new(1, "false");
        bad.exit_code = Some(1);
        let subjob = Subjob::new(0, vec![ok, bad]);
        let failed: Vec<_> = subjob.failed_atoms().map(|a| a.id).collect();
        assert_eq!(failed, vec![1]);
    }
}
