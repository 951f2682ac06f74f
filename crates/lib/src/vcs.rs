//! Version-control adapter seam.
//!
//! The engine never talks to a repository itself. A build callback asks
//! its [`crate::build::Build`] handle to check out a location, and the
//! handle delegates to whatever adapter the caller registered. Concrete
//! protocol implementations live outside this crate.

use std::io;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VcsError {
  #[error("checkout of {location:?} failed: {message}")]
  CheckoutFailed { location: String, message: String },
  #[error("i/o error: {0}")]
  Io(#[from] io::Error),
}

/// Checkout/update protocol for one source-control system.
///
/// `checkout_or_update` materializes `location` into `workdir` (creating
/// or refreshing it) and returns revision-change summary lines in the
/// metadata vocabulary the diff engine collects (`CHG`/`ADD`/`DEL`/
/// `COMMIT` prefixes, "changed from X to Y").
pub trait VcsAdapter: Send + Sync {
  fn name(&self) -> &str;

  fn checkout_or_update(&self, location: &str, workdir: &Path) -> Result<Vec<String>, VcsError>;
}
