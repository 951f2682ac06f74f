//! Build target definitions.

use std::fmt;

use thiserror::Error;

use crate::build::{AttemptError, Build};
use crate::supervisor::RunOptions;

#[derive(Debug, Error)]
pub enum TargetError {
  #[error("invalid target name {0:?}: names are non-empty and alphanumeric")]
  InvalidName(String),
}

/// Invoked with the per-attempt [`Build`] handle; drives every external
/// command of one attempt.
pub type BuildCallback = Box<dyn Fn(&mut Build) -> Result<(), AttemptError> + Send + Sync>;

/// Immutable definition of one thing to build.
///
/// A target has a name, zero or more suffix dimensions (each a list of
/// alternative tokens, where `None` means "this alternative contributes
/// nothing to the identity"), dependencies on other targets by name,
/// default run options and the build callback. Constructed once at
/// configuration time and never mutated afterwards.
pub struct Target {
  name: String,
  suffix_dimensions: Vec<Vec<Option<String>>>,
  dependencies: Vec<String>,
  options: RunOptions,
  callback: BuildCallback,
}

impl Target {
  pub fn new(name: &str, callback: BuildCallback) -> Result<Self, TargetError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
      return Err(TargetError::InvalidName(name.to_string()));
    }
    Ok(Target {
      name: name.to_string(),
      suffix_dimensions: Vec::new(),
      dependencies: Vec::new(),
      options: RunOptions::new(),
      callback,
    })
  }

  /// Adds a suffix dimension. Dimensions multiply: each concrete build
  /// picks one alternative from every dimension.
  pub fn dimension(mut self, alternatives: Vec<Option<String>>) -> Self {
    self.suffix_dimensions.push(alternatives);
    self
  }

  /// Declares a dependency on another target by name. Dependency builds
  /// of the current pass that succeeded are composed into this target's
  /// identities.
  pub fn depends_on(mut self, name: &str) -> Self {
    self.dependencies.push(name.to_string());
    self
  }

  pub fn with_options(mut self, options: RunOptions) -> Self {
    self.options = options;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn suffix_dimensions(&self) -> &[Vec<Option<String>>] {
    &self.suffix_dimensions
  }

  pub fn dependencies(&self) -> &[String] {
    &self.dependencies
  }

  pub fn options(&self) -> &RunOptions {
    &self.options
  }

  pub fn callback(&self) -> &BuildCallback {
    &self.callback
  }
}

impl fmt::Debug for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Target")
      .field("name", &self.name)
      .field("suffix_dimensions", &self.suffix_dimensions)
      .field("dependencies", &self.dependencies)
      .finish()
  }
}
