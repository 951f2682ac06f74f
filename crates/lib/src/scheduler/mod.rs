//! Target expansion and build execution.
//!
//! A scheduling pass walks the targets in registration order, expands
//! each into concrete builds (suffix cartesian product composed with the
//! successful dependency builds of the same pass) and runs every build
//! in a forked child process. The child reports back over a one-way
//! pipe; the parent reads the pipe to end-of-stream before reaping, then
//! prunes old attempts and diffs against the previous complete attempt.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, fork, pipe};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::build::Build;
use crate::config::EngineConfig;
use crate::diff::{self, DiffReport, LogSnapshot};
use crate::lock::{BuildLock, LockError};
use crate::logfile::LOG_FILENAME;
use crate::status::latest_complete_attempt;
use crate::target::Target;
use crate::timestamp::{self, AttemptName};

#[derive(Debug, Error)]
pub enum SchedulerError {
  #[error("attempt directory already exists: {0}")]
  DuplicateAttempt(PathBuf),

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error("pipe creation failed: {0}")]
  Pipe(#[source] nix::errno::Errno),

  #[error("fork failed: {0}")]
  Fork(#[source] nix::errno::Errno),

  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),
}

/// What one concrete build ended as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
  Succeeded { versions: Vec<String> },
  Failed { reason: String },
}

impl Outcome {
  pub fn is_success(&self) -> bool {
    matches!(self, Outcome::Succeeded { .. })
  }
}

/// One concrete build of a pass, with its change report when a prior
/// complete attempt existed.
#[derive(Debug)]
pub struct BuildRecord {
  pub identity: String,
  pub target_name: String,
  pub attempt: AttemptName,
  pub outcome: Outcome,
  pub diff: Option<DiffReport>,
}

/// Child -> parent completion payload, one JSON line over the pipe.
#[derive(Debug, Serialize, Deserialize)]
struct ChildReport {
  status: String,
  versions: Vec<String>,
  reason: Option<String>,
}

/// Cartesian expansion of suffix dimensions. `None` alternatives are
/// dropped from the resulting suffix list rather than kept as empties.
pub fn expand_suffixes(dimensions: &[Vec<Option<String>>]) -> Vec<Vec<String>> {
  let mut combos: Vec<Vec<String>> = vec![Vec::new()];
  for dimension in dimensions {
    let mut next = Vec::with_capacity(combos.len() * dimension.len());
    for combo in &combos {
      for alternative in dimension {
        let mut extended = combo.clone();
        if let Some(token) = alternative {
          extended.push(token.clone());
        }
        next.push(extended);
      }
    }
    combos = next;
  }
  combos
}

/// Identity grammar: `name(-suffix)*(_depIdentity)*`.
pub fn build_identity(name: &str, suffixes: &[String], dep_identities: &[String]) -> String {
  let mut identity = name.to_string();
  for suffix in suffixes {
    identity.push('-');
    identity.push_str(suffix);
  }
  for dep in dep_identities {
    identity.push('_');
    identity.push_str(dep);
  }
  identity
}

fn dep_combinations(per_dep: &[Vec<String>]) -> Vec<Vec<String>> {
  let mut combos: Vec<Vec<String>> = vec![Vec::new()];
  for identities in per_dep {
    let mut next = Vec::new();
    for combo in &combos {
      for identity in identities {
        let mut extended = combo.clone();
        extended.push(identity.clone());
        next.push(extended);
      }
    }
    combos = next;
  }
  combos
}

pub struct Scheduler<'a> {
  config: &'a EngineConfig,
  targets: Vec<Target>,
}

impl<'a> Scheduler<'a> {
  pub fn new(config: &'a EngineConfig) -> Self {
    Scheduler {
      config,
      targets: Vec::new(),
    }
  }

  pub fn add_target(&mut self, target: Target) {
    self.targets.push(target);
  }

  /// Runs one full pass over all targets, holding the build-root lock
  /// for its duration. `command` is recorded in the lock metadata.
  pub fn run_pass(&self, command: &str) -> Result<Vec<BuildRecord>, SchedulerError> {
    let _lock = BuildLock::acquire(&self.config.build_root, command)?;
    let mut records: Vec<BuildRecord> = Vec::new();

    for target in &self.targets {
      // A dependency with zero successes contributes zero combinations.
      let per_dep: Vec<Vec<String>> = target
        .dependencies()
        .iter()
        .map(|dep| {
          records
            .iter()
            .filter(|r| r.target_name == *dep && r.outcome.is_success())
            .map(|r| r.identity.clone())
            .collect()
        })
        .collect();
      if per_dep.iter().any(Vec::is_empty) {
        info!(target = target.name(), "skipping: dependency has no successful builds");
        continue;
      }

      for suffixes in expand_suffixes(target.suffix_dimensions()) {
        for deps in dep_combinations(&per_dep) {
          let identity = build_identity(target.name(), &suffixes, &deps);
          let record = self.run_one(target, &identity)?;
          records.push(record);
        }
      }
    }
    Ok(records)
  }

  /// Runs one concrete build in a forked child and post-processes the
  /// attempt in the parent.
  fn run_one(&self, target: &Target, identity: &str) -> Result<BuildRecord, SchedulerError> {
    let attempt = AttemptName::now();
    let build_dir = self.config.build_dir(identity);
    let attempt_dir = build_dir.join(attempt.as_str());
    if attempt_dir.exists() {
      return Err(SchedulerError::DuplicateAttempt(attempt_dir));
    }
    let previous = latest_complete_attempt(&build_dir);

    info!(identity, attempt = %attempt, "realizing build");
    let (read_fd, write_fd) = pipe().map_err(SchedulerError::Pipe)?;
    // SAFETY: the child only touches its own Build state and the pipe,
    // then leaves through _exit without unwinding into parent state.
    match unsafe { fork() }.map_err(SchedulerError::Fork)? {
      ForkResult::Child => {
        drop(read_fd);
        let code = child_main(target, identity, &build_dir, attempt.clone(), write_fd);
        unsafe { libc::_exit(code) }
      }
      ForkResult::Parent { child } => {
        drop(write_fd);
        // Drain before waiting, so a full pipe can never deadlock the
        // child against our synchronous wait.
        let mut payload = String::new();
        let mut reader = File::from(read_fd);
        let read_ok = reader.read_to_string(&mut payload).is_ok();
        let status = waitpid(child, None);

        let exited_cleanly = matches!(status, Ok(WaitStatus::Exited(_, 0)));
        let report = if read_ok {
          serde_json::from_str::<ChildReport>(payload.trim()).ok()
        } else {
          None
        };

        let outcome = match report {
          Some(report) if exited_cleanly => {
            if report.status == "ok" {
              Outcome::Succeeded {
                versions: report.versions,
              }
            } else {
              Outcome::Failed {
                reason: report.reason.unwrap_or_else(|| "unknown failure".to_string()),
              }
            }
          }
          // Abnormal child exit: record the failure; no change report.
          _ => {
            warn!(identity, ?status, "build child exited abnormally");
            Outcome::Failed {
              reason: "build process exited abnormally".to_string(),
            }
          }
        };

        self.prune_old_attempts(&build_dir, &attempt);
        let diff = if exited_cleanly {
          self.diff_against_previous(target.name(), &build_dir, previous.as_ref(), &attempt)
        } else {
          None
        };

        Ok(BuildRecord {
          identity: identity.to_string(),
          target_name: target.name().to_string(),
          attempt,
          outcome,
          diff,
        })
      }
    }
  }

  /// Deletes prior attempts beyond the retention count, oldest first.
  /// The current attempt never counts and is never deleted.
  fn prune_old_attempts(&self, build_dir: &Path, current: &AttemptName) {
    let mut prior = match timestamp::attempts_in(build_dir) {
      Ok(attempts) => attempts,
      Err(e) => {
        warn!(dir = %build_dir.display(), error = %e, "cannot enumerate attempts");
        return;
      }
    };
    prior.retain(|a| a != current);
    if prior.len() <= self.config.num_oldbuilds {
      return;
    }
    let excess = prior.len() - self.config.num_oldbuilds;
    for stale in &prior[..excess] {
      let dir = build_dir.join(stale.as_str());
      match std::fs::remove_dir_all(&dir) {
        Ok(()) => info!(dir = %dir.display(), "pruned old attempt"),
        Err(e) => warn!(dir = %dir.display(), error = %e, "failed to prune old attempt"),
      }
    }
  }

  fn diff_against_previous(
    &self,
    target_name: &str,
    build_dir: &Path,
    previous: Option<&AttemptName>,
    current: &AttemptName,
  ) -> Option<DiffReport> {
    let older = previous.and_then(|name| snapshot(build_dir, name));
    let newer = snapshot(build_dir, current)?;
    let rules = self.config.diff_rules.get(target_name);
    diff::diff(older.as_ref(), &newer, rules)
  }
}

fn child_main(
  target: &Target,
  identity: &str,
  build_dir: &Path,
  attempt: AttemptName,
  write_fd: OwnedFd,
) -> i32 {
  let mut pipe_out = File::from(write_fd);
  let report = match Build::begin(build_dir, identity, target.name(), attempt, target.options()) {
    Ok(mut build) => match (target.callback())(&mut build) {
      Ok(()) => {
        if let Err(e) = build.record_result() {
          warn!(identity, error = %e, "cannot record result section");
        }
        ChildReport {
          status: "ok".to_string(),
          versions: build.versions().to_vec(),
          reason: None,
        }
      }
      Err(e) => {
        if let Err(log_err) = build.record_failure(&e) {
          warn!(identity, error = %log_err, "cannot record failure section");
        }
        ChildReport {
          status: "failed".to_string(),
          versions: Vec::new(),
          reason: Some(e.reason()),
        }
      }
    },
    Err(e) => ChildReport {
      status: "failed".to_string(),
      versions: Vec::new(),
      reason: Some(e.reason()),
    },
  };
  match serde_json::to_string(&report) {
    Ok(line) => {
      let _ = writeln!(pipe_out, "{line}");
      let _ = pipe_out.flush();
      0
    }
    Err(_) => 1,
  }
}

fn snapshot(build_dir: &Path, name: &AttemptName) -> Option<LogSnapshot> {
  let path = build_dir.join(name.as_str()).join(LOG_FILENAME);
  let text = std::fs::read_to_string(&path).ok()?;
  Some(LogSnapshot::new(name.as_str(), text))
}
