//! Per-target registries with a shared default.
//!
//! Title hooks, diff rule chains and failure patterns are all "look up by
//! target name, fall back to the default" maps. They are owned by
//! [`crate::config::EngineConfig`] and passed by reference; nothing here
//! is process-global.

use std::collections::HashMap;

/// Map from target name to `T`, with a default used for unregistered
/// targets. Registration appends; entries are never removed.
#[derive(Debug)]
pub struct Registry<T> {
  default: T,
  by_target: HashMap<String, T>,
}

impl<T> Registry<T> {
  pub fn new(default: T) -> Self {
    Registry {
      default,
      by_target: HashMap::new(),
    }
  }

  pub fn register(&mut self, target: &str, value: T) {
    self.by_target.insert(target.to_string(), value);
  }

  /// The entry for `target`, or the shared default.
  pub fn get(&self, target: &str) -> &T {
    self.by_target.get(target).unwrap_or(&self.default)
  }

  pub fn default_entry(&self) -> &T {
    &self.default
  }

  pub fn has_specific(&self, target: &str) -> bool {
    self.by_target.contains_key(target)
  }
}

/// Produces the one-line summary for a successful build from its log.
/// `None` defers to the next candidate (a specific hook falling back to
/// the default).
pub type TitleHook = Box<dyn Fn(&crate::logfile::LogFile) -> Option<String> + Send + Sync>;
