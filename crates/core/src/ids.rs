//! Id types for builds, workers, subjobs, and atoms.
//!
//! Build and worker ids are process-lifetime-unique monotonically
//! increasing integers handed out by a [`Counter`](crate::Counter), per
//! `spec` §3 invariant 1 and §8 property 1. Subjob and atom ids are only
//! unique within their owning build and are plain `u32`s assigned by the
//! (out-of-scope) atomizer.

crate::define_int_id! {
    /// Unique, monotonically increasing identifier for a [`Build`](crate::Build).
    pub struct BuildId;
}

crate::define_int_id! {
    /// Unique, monotonically increasing identifier for a worker.
    pub struct WorkerId;
}

/// Id of a subjob, unique within its owning build (not globally).
pub type SubjobId = u32;

/// Id of an atom, unique within its owning subjob.
pub type AtomId = u32;
