//! The rooting checker: static checks over the control-flow graphs of C
//! procedures that call into the VM's garbage collector.
//!
//! Procedures come from the text dump format in [`dump`]. [`checker`] holds
//! the checks and the deduplicating [`Checker`] that runs them.

pub mod cfg;
pub mod checker;
pub mod config;
pub mod dump;
pub mod paths;
pub mod throw_free;

pub use self::checker::{Checker, Finding, WarningSet};
pub use self::config::RootingConfig;
