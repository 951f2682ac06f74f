//! vigil-lib: core engine for the vigil continuous build monitor.
//!
//! The engine periodically realizes build targets, captures every external
//! command's output in a section-structured log file, and reports what
//! changed between consecutive attempts:
//! - `supervisor`: runs one external command under timeouts, resource
//!   limits and an escalating process-group termination sequence
//! - `logfile`: append-only, section-indexed log store
//! - `diff`: noise-filtered change detection between two attempt logs
//! - `scheduler`: expands targets into concrete builds, runs each one in
//!   an isolated child process and prunes old attempts
//!
//! Process groups, signals and `fork(2)` make this a Unix crate.

pub mod build;
pub mod config;
pub mod diff;
pub mod error;
pub mod hooks;
pub mod lock;
pub mod logfile;
pub mod scheduler;
pub mod status;
pub mod supervisor;
pub mod target;
pub mod timestamp;
pub mod vcs;
