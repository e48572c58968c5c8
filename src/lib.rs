//! Post-mortem tooling for a garbage-collected VM written in C.
//!
//! Two halves share this crate. The [`census`] walks a thread's heap in a
//! memory image and reports what it finds there; [`roots`] statically
//! checks C procedures for objects left unrooted across calls that may
//! collect.

pub mod census;
pub mod layout;
pub mod memory;
pub mod roots;
pub mod snapshot;

pub use snapshot::{load_snapshot, save_snapshot, Snapshot, SnapshotError};
