//! Engine configuration: build root, retention, registries.
//!
//! One `EngineConfig` is constructed at startup and passed by reference
//! into the scheduler and the status/diff surfaces. The hook registries
//! live here; there is no process-global state.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::diff::rules::{self, RuleSpec};
use crate::hooks::{Registry, TitleHook};
use crate::status;
use crate::supervisor::RunOptions;

/// Prior attempts kept per build after a new attempt completes.
pub const DEFAULT_NUM_OLDBUILDS: usize = 3;

pub struct EngineConfig {
  /// Directory holding one subdirectory per build identity.
  pub build_root: PathBuf,
  /// Prior attempts retained per build; the current attempt never
  /// counts against this.
  pub num_oldbuilds: usize,
  /// Base run options; target options overlay these.
  pub default_options: RunOptions,
  pub title_hooks: Registry<TitleHook>,
  pub diff_rules: Registry<Vec<RuleSpec>>,
  /// Patterns tried in order against a failed attempt's log to derive
  /// the failure reason; first capture (or whole match) wins.
  pub failure_patterns: Registry<Vec<Regex>>,
}

impl EngineConfig {
  pub fn new(build_root: &Path) -> Self {
    EngineConfig {
      build_root: build_root.to_path_buf(),
      num_oldbuilds: DEFAULT_NUM_OLDBUILDS,
      default_options: RunOptions::new(),
      title_hooks: Registry::new(Box::new(status::default_title_hook)),
      diff_rules: Registry::new(rules::default_rules()),
      failure_patterns: Registry::new(default_failure_patterns()),
    }
  }

  pub fn build_dir(&self, identity: &str) -> PathBuf {
    self.build_root.join(identity)
  }
}

/// Per-user default build root for callers that do not name one.
pub fn default_root() -> PathBuf {
  dirs::state_dir()
    .or_else(dirs::data_local_dir)
    .map(|dir| dir.join("vigil"))
    .unwrap_or_else(|| PathBuf::from("vigil-builds"))
}

fn default_failure_patterns() -> Vec<Regex> {
  [
    r"(?im)^(.*\b(?:fatal|panic)\b.*)$",
    r"(?im)^(.*\berror\b.*)$",
    r"(?im)^(.*\bfailed\b.*)$",
  ]
  .iter()
  .map(|p| Regex::new(p).expect("builtin failure pattern is valid"))
  .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults() {
    let config = EngineConfig::new(Path::new("/tmp/builds"));
    assert_eq!(config.num_oldbuilds, DEFAULT_NUM_OLDBUILDS);
    assert_eq!(config.build_dir("ruby-o3"), Path::new("/tmp/builds/ruby-o3"));
    assert!(!config.diff_rules.default_entry().is_empty());
  }

  #[test]
  fn failure_patterns_prefer_fatal_over_generic() {
    let patterns = default_failure_patterns();
    let log = "make: entering\nsegfault error in gc.c\nfatal: cannot continue\n";
    let first = patterns
      .iter()
      .find_map(|p| p.captures(log))
      .and_then(|c| c.get(1))
      .map(|m| m.as_str());
    assert_eq!(first, Some("fatal: cannot continue"));
  }
}
