//! Supervision constraints for one external command.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptionsError {
  #[error("unknown option key: {0:?}")]
  UnknownKey(String),
  #[error("invalid value {value:?} for option {key:?}")]
  InvalidValue { key: String, value: String },
}

/// Resource limits applied to the child after fork, before exec.
///
/// `None` leaves the inherited limit untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
  pub cpu_seconds: Option<u64>,
  pub stack_bytes: Option<u64>,
  pub data_bytes: Option<u64>,
  pub address_space_bytes: Option<u64>,
  /// `Some(false)` disables core dumps; `Some(true)` allows unlimited.
  pub core_dumps: Option<bool>,
}

impl ResourceLimits {
  pub fn is_empty(&self) -> bool {
    *self == ResourceLimits::default()
  }
}

/// Constraints for a supervised run. The recognized option set is closed;
/// open-ended inputs go through [`RunOptions::apply_raw`] which validates
/// the `ENV:` and `rlimit_` families explicitly.
#[derive(Debug, Clone)]
pub struct RunOptions {
  /// Relative timeout, measured from spawn.
  pub timeout: Option<Duration>,
  /// Absolute deadline; wins over `timeout` when both yield a limit and
  /// the deadline is earlier.
  pub deadline: Option<SystemTime>,
  /// No output growth for this long counts as hung.
  pub output_interval: Option<Duration>,
  /// How long a signaled group may linger before the next escalation
  /// step.
  pub kill_grace: Duration,
  /// Working directory for the child; inherited when unset.
  pub cwd: Option<PathBuf>,
  /// Environment overrides for the child.
  pub env: BTreeMap<String, String>,
  pub limits: ResourceLimits,
  /// Commands tried in order when the primary executable is not found.
  pub fallbacks: Vec<String>,
}

pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

impl Default for RunOptions {
  fn default() -> Self {
    RunOptions {
      timeout: None,
      deadline: None,
      output_interval: None,
      kill_grace: DEFAULT_KILL_GRACE,
      cwd: None,
      env: BTreeMap::new(),
      limits: ResourceLimits::default(),
      fallbacks: Vec::new(),
    }
  }
}

impl RunOptions {
  pub fn new() -> Self {
    RunOptions::default()
  }

  /// Applies one raw `key = value` pair from a target definition.
  ///
  /// Recognized keys: `timeout`, `output_interval`, `kill_grace`
  /// (seconds), `ENV:<NAME>` and the `rlimit_cpu` / `rlimit_stack` /
  /// `rlimit_data` / `rlimit_as` / `rlimit_core` family.
  pub fn apply_raw(&mut self, key: &str, value: &str) -> Result<(), OptionsError> {
    if let Some(name) = key.strip_prefix("ENV:") {
      if name.is_empty() {
        return Err(OptionsError::UnknownKey(key.to_string()));
      }
      self.env.insert(name.to_string(), value.to_string());
      return Ok(());
    }
    if let Some(limit) = key.strip_prefix("rlimit_") {
      return self.apply_rlimit(key, limit, value);
    }
    let seconds = |key: &str, value: &str| {
      value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| OptionsError::InvalidValue {
          key: key.to_string(),
          value: value.to_string(),
        })
    };
    match key {
      "timeout" => self.timeout = Some(seconds(key, value)?),
      "output_interval" => self.output_interval = Some(seconds(key, value)?),
      "kill_grace" => self.kill_grace = seconds(key, value)?,
      _ => return Err(OptionsError::UnknownKey(key.to_string())),
    }
    Ok(())
  }

  fn apply_rlimit(&mut self, key: &str, limit: &str, value: &str) -> Result<(), OptionsError> {
    let invalid = || OptionsError::InvalidValue {
      key: key.to_string(),
      value: value.to_string(),
    };
    if limit == "core" {
      self.limits.core_dumps = Some(match value {
        "0" | "false" => false,
        "unlimited" | "true" => true,
        _ => return Err(invalid()),
      });
      return Ok(());
    }
    let n = value.parse::<u64>().map_err(|_| invalid())?;
    match limit {
      "cpu" => self.limits.cpu_seconds = Some(n),
      "stack" => self.limits.stack_bytes = Some(n),
      "data" => self.limits.data_bytes = Some(n),
      "as" => self.limits.address_space_bytes = Some(n),
      _ => return Err(OptionsError::UnknownKey(key.to_string())),
    }
    Ok(())
  }

  /// These options with `base` filling any field left unset here.
  pub fn overlaid_on(&self, base: &RunOptions) -> RunOptions {
    let mut merged = base.clone();
    if self.timeout.is_some() {
      merged.timeout = self.timeout;
    }
    if self.deadline.is_some() {
      merged.deadline = self.deadline;
    }
    if self.output_interval.is_some() {
      merged.output_interval = self.output_interval;
    }
    if self.cwd.is_some() {
      merged.cwd = self.cwd.clone();
    }
    if self.kill_grace != DEFAULT_KILL_GRACE {
      merged.kill_grace = self.kill_grace;
    }
    for (k, v) in &self.env {
      merged.env.insert(k.clone(), v.clone());
    }
    let limits = &mut merged.limits;
    limits.cpu_seconds = self.limits.cpu_seconds.or(limits.cpu_seconds);
    limits.stack_bytes = self.limits.stack_bytes.or(limits.stack_bytes);
    limits.data_bytes = self.limits.data_bytes.or(limits.data_bytes);
    limits.address_space_bytes = self.limits.address_space_bytes.or(limits.address_space_bytes);
    limits.core_dumps = self.limits.core_dumps.or(limits.core_dumps);
    if !self.fallbacks.is_empty() {
      merged.fallbacks = self.fallbacks.clone();
    }
    merged
  }

  /// Effective absolute deadline, if any constraint imposes one.
  pub fn effective_deadline(&self, start: SystemTime) -> Option<SystemTime> {
    let from_timeout = self.timeout.map(|t| start + t);
    match (from_timeout, self.deadline) {
      (Some(a), Some(b)) => Some(a.min(b)),
      (a, b) => a.or(b),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn raw_keys_parse_into_typed_fields() {
    let mut opts = RunOptions::new();
    opts.apply_raw("timeout", "3600").unwrap();
    opts.apply_raw("output_interval", "600").unwrap();
    opts.apply_raw("ENV:LC_ALL", "C").unwrap();
    opts.apply_raw("rlimit_cpu", "14400").unwrap();
    opts.apply_raw("rlimit_core", "0").unwrap();

    assert_eq!(opts.timeout, Some(Duration::from_secs(3600)));
    assert_eq!(opts.output_interval, Some(Duration::from_secs(600)));
    assert_eq!(opts.env.get("LC_ALL").map(String::as_str), Some("C"));
    assert_eq!(opts.limits.cpu_seconds, Some(14400));
    assert_eq!(opts.limits.core_dumps, Some(false));
  }

  #[test]
  fn unknown_and_malformed_keys_are_rejected() {
    let mut opts = RunOptions::new();
    assert!(matches!(
      opts.apply_raw("section", "configure"),
      Err(OptionsError::UnknownKey(_))
    ));
    assert!(matches!(
      opts.apply_raw("rlimit_nproc", "10"),
      Err(OptionsError::UnknownKey(_))
    ));
    assert!(matches!(
      opts.apply_raw("timeout", "soon"),
      Err(OptionsError::InvalidValue { .. })
    ));
    assert!(matches!(
      opts.apply_raw("ENV:", "x"),
      Err(OptionsError::UnknownKey(_))
    ));
  }

  #[test]
  fn overlay_prefers_specific_over_base() {
    let mut base = RunOptions::new();
    base.apply_raw("timeout", "100").unwrap();
    base.apply_raw("ENV:CC", "gcc").unwrap();
    base.apply_raw("rlimit_cpu", "50").unwrap();

    let mut specific = RunOptions::new();
    specific.apply_raw("timeout", "200").unwrap();
    specific.apply_raw("ENV:CFLAGS", "-O2").unwrap();

    let merged = specific.overlaid_on(&base);
    assert_eq!(merged.timeout, Some(Duration::from_secs(200)));
    assert_eq!(merged.env.get("CC").map(String::as_str), Some("gcc"));
    assert_eq!(merged.env.get("CFLAGS").map(String::as_str), Some("-O2"));
    assert_eq!(merged.limits.cpu_seconds, Some(50));
  }

  #[test]
  fn earliest_constraint_wins_as_deadline() {
    let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
    let mut opts = RunOptions::new();
    assert_eq!(opts.effective_deadline(start), None);

    opts.timeout = Some(Duration::from_secs(60));
    opts.deadline = Some(start + Duration::from_secs(30));
    assert_eq!(
      opts.effective_deadline(start),
      Some(start + Duration::from_secs(30))
    );

    opts.deadline = Some(start + Duration::from_secs(300));
    assert_eq!(
      opts.effective_deadline(start),
      Some(start + Duration::from_secs(60))
    );
  }
}
