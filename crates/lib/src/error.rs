//! Cross-module view of the error taxonomy.
//!
//! Each module owns its error enum; this module re-exports the ones
//! callers commonly match on so downstream code has a single import
//! path.

pub use crate::build::AttemptError;
pub use crate::lock::LockError;
pub use crate::logfile::LogFileError;
pub use crate::scheduler::SchedulerError;
pub use crate::status::StatusError;
pub use crate::supervisor::{OptionsError, SupervisorError};
pub use crate::target::TargetError;
pub use crate::timestamp::TimestampError;
pub use crate::vcs::VcsError;
