//! Read-only status surfaces derived from the on-disk build tree.
//!
//! Everything here works offline from the logs alone: `list` and `title`
//! never need a live scheduler, and a build that failed yesterday still
//! reports its reason today.

use std::io;
use std::path::Path;

use thiserror::Error;

use crate::config::EngineConfig;
use crate::diff::{self, DiffReport, LogSnapshot};
use crate::logfile::{LOG_FILENAME, LogFile, LogFileError};
use crate::timestamp::{self, AttemptName};

#[derive(Debug, Error)]
pub enum StatusError {
  #[error("i/o error: {0}")]
  Io(#[from] io::Error),
  #[error(transparent)]
  Log(#[from] LogFileError),
}

/// Last known state of one build identity. "No attempts yet" is distinct
/// from "last attempt failed".
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuildStatus {
  NoAttempts,
  Failed { attempt: String, reason: String },
  Succeeded { attempt: String, title: String },
}

#[derive(Debug, serde::Serialize)]
pub struct BuildSummary {
  pub identity: String,
  pub attempts: usize,
  pub last: BuildStatus,
}

/// Target name of an identity: the leading run up to the first suffix or
/// dependency separator.
pub fn target_of(identity: &str) -> &str {
  match identity.find(['-', '_']) {
    Some(at) => &identity[..at],
    None => identity,
  }
}

/// Most recent attempt whose log is complete (contains a `result` or
/// `failure` section); incomplete attempts are skipped.
pub fn latest_complete_attempt(build_dir: &Path) -> Option<AttemptName> {
  let attempts = timestamp::attempts_in(build_dir).ok()?;
  attempts.into_iter().rev().find(|name| is_complete(build_dir, name))
}

fn is_complete(build_dir: &Path, name: &AttemptName) -> bool {
  let path = build_dir.join(name.as_str()).join(LOG_FILENAME);
  match LogFile::open_read(&path) {
    Ok(log) => log.section_names().any(|s| s == "result" || s == "failure"),
    Err(_) => false,
  }
}

/// Status of one identity, derived from its most recent complete attempt.
pub fn build_status(config: &EngineConfig, identity: &str) -> Result<BuildStatus, StatusError> {
  let build_dir = config.build_dir(identity);
  let Some(attempt) = latest_complete_attempt(&build_dir) else {
    return Ok(BuildStatus::NoAttempts);
  };
  let log = LogFile::open_read(build_dir.join(attempt.as_str()).join(LOG_FILENAME))?;

  if log.get_section("result")?.is_some() {
    let title = title_of(config, identity, &log);
    return Ok(BuildStatus::Succeeded {
      attempt: attempt.as_str().to_string(),
      title,
    });
  }

  let reason = failure_reason(config, identity, &log)?;
  Ok(BuildStatus::Failed {
    attempt: attempt.as_str().to_string(),
    reason,
  })
}

/// Title from the registry: a target-specific hook first, the shared
/// default as fallback when the specific one abstains.
fn title_of(config: &EngineConfig, identity: &str, log: &LogFile) -> String {
  let target = target_of(identity);
  let hook = config.title_hooks.get(target);
  let title = match hook(log) {
    Some(title) => Some(title),
    None if config.title_hooks.has_specific(target) => (config.title_hooks.default_entry())(log),
    None => None,
  };
  title.unwrap_or_else(|| identity.to_string())
}

/// Reads the version lines of the `result` section.
pub fn default_title_hook(log: &LogFile) -> Option<String> {
  let body = log.get_section("result").ok()??;
  let lines: Vec<&str> = body.lines().filter(|l| !l.trim().is_empty()).collect();
  if lines.is_empty() {
    return None;
  }
  Some(lines.join(", "))
}

/// The recorded failure reason, or the first failure-pattern match when
/// the attempt died without writing one.
fn failure_reason(
  config: &EngineConfig,
  identity: &str,
  log: &LogFile,
) -> Result<String, StatusError> {
  if let Some(body) = log.get_section("failure")? {
    if let Some(line) = body.lines().find(|l| !l.trim().is_empty()) {
      return Ok(line.to_string());
    }
  }
  let text = log.get_all_log()?;
  let patterns = config.failure_patterns.get(target_of(identity));
  let matched = patterns.iter().find_map(|p| {
    p.captures(&text)
      .map(|c| c.get(1).map_or_else(|| c[0].to_string(), |m| m.as_str().to_string()))
  });
  Ok(matched.unwrap_or_else(|| "failed (no reason recorded)".to_string()))
}

/// Every build identity under the root with attempt count and last
/// status, sorted by identity.
pub fn list_builds(config: &EngineConfig) -> Result<Vec<BuildSummary>, StatusError> {
  let mut summaries = Vec::new();
  let entries = match std::fs::read_dir(&config.build_root) {
    Ok(entries) => entries,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(summaries),
    Err(e) => return Err(e.into()),
  };
  for entry in entries.flatten() {
    if !entry.path().is_dir() {
      continue;
    }
    let Some(identity) = entry.file_name().to_str().map(str::to_string) else {
      continue;
    };
    let attempts = timestamp::attempts_in(&entry.path())?;
    if attempts.is_empty() {
      continue;
    }
    let last = build_status(config, &identity)?;
    summaries.push(BuildSummary {
      identity,
      attempts: attempts.len(),
      last,
    });
  }
  summaries.sort_by(|a, b| a.identity.cmp(&b.identity));
  Ok(summaries)
}

/// Diff between the two most recent complete attempts of an identity.
/// `None` when fewer than two exist.
pub fn latest_logdiff(
  config: &EngineConfig,
  identity: &str,
) -> Result<Option<DiffReport>, StatusError> {
  let build_dir = config.build_dir(identity);
  let attempts = match timestamp::attempts_in(&build_dir) {
    Ok(attempts) => attempts,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
    Err(e) => return Err(e.into()),
  };
  let complete: Vec<&AttemptName> = attempts
    .iter()
    .filter(|name| is_complete(&build_dir, name))
    .collect();
  let [.., older, newer] = complete.as_slice() else {
    return Ok(None);
  };
  let older = snapshot(&build_dir, older)?;
  let newer = snapshot(&build_dir, newer)?;
  let rules = config.diff_rules.get(target_of(identity));
  Ok(diff::diff(Some(&older), &newer, rules))
}

fn snapshot(build_dir: &Path, name: &AttemptName) -> Result<LogSnapshot, StatusError> {
  let text = std::fs::read_to_string(build_dir.join(name.as_str()).join(LOG_FILENAME))?;
  Ok(LogSnapshot::new(name.as_str(), text))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use tempfile::TempDir;

  fn write_attempt(root: &Path, identity: &str, attempt: &str, sections: &[(&str, &str)]) {
    let dir = root.join(identity).join(attempt);
    std::fs::create_dir_all(&dir).unwrap();
    let mut log = LogFile::open_write(dir.join(LOG_FILENAME)).unwrap();
    log.start_section("start").unwrap();
    let mut handle = log.append_handle().unwrap();
    writeln!(handle, "{identity} {attempt}").unwrap();
    for (name, body) in sections {
      log.start_section(name).unwrap();
      let mut handle = log.append_handle().unwrap();
      write!(handle, "{body}").unwrap();
    }
  }

  #[test]
  fn target_of_strips_suffixes_and_deps() {
    assert_eq!(target_of("ruby"), "ruby");
    assert_eq!(target_of("ruby-o3"), "ruby");
    assert_eq!(target_of("app_gcc-o3"), "app");
  }

  #[test]
  fn missing_identity_has_no_attempts() {
    let temp = TempDir::new().unwrap();
    let config = EngineConfig::new(temp.path());
    assert_eq!(
      build_status(&config, "ghost").unwrap(),
      BuildStatus::NoAttempts
    );
  }

  #[test]
  fn success_title_comes_from_the_result_section() {
    let temp = TempDir::new().unwrap();
    let config = EngineConfig::new(temp.path());
    write_attempt(
      temp.path(),
      "ruby",
      "20240101T000000Z",
      &[("result", "ruby 3.4.0dev\n")],
    );
    assert_eq!(
      build_status(&config, "ruby").unwrap(),
      BuildStatus::Succeeded {
        attempt: "20240101T000000Z".to_string(),
        title: "ruby 3.4.0dev".to_string(),
      }
    );
  }

  #[test]
  fn failure_reason_comes_from_the_failure_section() {
    let temp = TempDir::new().unwrap();
    let config = EngineConfig::new(temp.path());
    write_attempt(
      temp.path(),
      "ruby",
      "20240101T000000Z",
      &[("make", "cc1: error: bad flag\n"), ("failure", "make exited with status 2\n")],
    );
    assert_eq!(
      build_status(&config, "ruby").unwrap(),
      BuildStatus::Failed {
        attempt: "20240101T000000Z".to_string(),
        reason: "make exited with status 2".to_string(),
      }
    );
  }

  #[test]
  fn failure_patterns_fill_in_a_missing_reason() {
    let temp = TempDir::new().unwrap();
    let config = EngineConfig::new(temp.path());
    write_attempt(
      temp.path(),
      "ruby",
      "20240101T000000Z",
      &[("make", "gc.c:10: fatal: segmentation fault\n"), ("failure", "\n")],
    );
    let status = build_status(&config, "ruby").unwrap();
    match status {
      BuildStatus::Failed { reason, .. } => {
        assert_eq!(reason, "gc.c:10: fatal: segmentation fault");
      }
      other => panic!("unexpected status: {other:?}"),
    }
  }

  #[test]
  fn incomplete_attempts_are_skipped() {
    let temp = TempDir::new().unwrap();
    let config = EngineConfig::new(temp.path());
    write_attempt(
      temp.path(),
      "ruby",
      "20240101T000000Z",
      &[("result", "good one\n")],
    );
    // A newer attempt that died before writing result or failure.
    write_attempt(temp.path(), "ruby", "20240102T000000Z", &[("make", "...\n")]);
    assert_eq!(
      build_status(&config, "ruby").unwrap(),
      BuildStatus::Succeeded {
        attempt: "20240101T000000Z".to_string(),
        title: "good one".to_string(),
      }
    );
  }

  #[test]
  fn registered_title_hook_wins_over_default() {
    let temp = TempDir::new().unwrap();
    let mut config = EngineConfig::new(temp.path());
    config
      .title_hooks
      .register("ruby", Box::new(|_log| Some("custom title".to_string())));
    write_attempt(
      temp.path(),
      "ruby-o3",
      "20240101T000000Z",
      &[("result", "ignored\n")],
    );
    match build_status(&config, "ruby-o3").unwrap() {
      BuildStatus::Succeeded { title, .. } => assert_eq!(title, "custom title"),
      other => panic!("unexpected status: {other:?}"),
    }
  }

  #[test]
  fn abstaining_hook_falls_back_to_default() {
    let temp = TempDir::new().unwrap();
    let mut config = EngineConfig::new(temp.path());
    config.title_hooks.register("ruby", Box::new(|_log| None));
    write_attempt(
      temp.path(),
      "ruby",
      "20240101T000000Z",
      &[("result", "from result\n")],
    );
    match build_status(&config, "ruby").unwrap() {
      BuildStatus::Succeeded { title, .. } => assert_eq!(title, "from result"),
      other => panic!("unexpected status: {other:?}"),
    }
  }

  #[test]
  fn list_enumerates_identities_sorted() {
    let temp = TempDir::new().unwrap();
    let config = EngineConfig::new(temp.path());
    write_attempt(temp.path(), "zeta", "20240101T000000Z", &[("result", "z\n")]);
    write_attempt(temp.path(), "alpha", "20240101T000000Z", &[("result", "a\n")]);
    write_attempt(temp.path(), "alpha", "20240102T000000Z", &[("failure", "boom\n")]);

    let summaries = list_builds(&config).unwrap();
    let view: Vec<(&str, usize, bool)> = summaries
      .iter()
      .map(|s| {
        (
          s.identity.as_str(),
          s.attempts,
          matches!(s.last, BuildStatus::Succeeded { .. }),
        )
      })
      .collect();
    assert_eq!(view, vec![("alpha", 2, false), ("zeta", 1, true)]);
  }

  #[test]
  fn list_on_missing_root_is_empty() {
    let temp = TempDir::new().unwrap();
    let config = EngineConfig::new(&temp.path().join("nowhere"));
    assert!(list_builds(&config).unwrap().is_empty());
  }

  #[test]
  fn logdiff_compares_the_two_most_recent_complete_attempts() {
    let temp = TempDir::new().unwrap();
    let config = EngineConfig::new(temp.path());
    write_attempt(
      temp.path(),
      "t",
      "20240101T000000Z",
      &[("make", "payload one\n"), ("result", "t\n")],
    );
    write_attempt(
      temp.path(),
      "t",
      "20240102T000000Z",
      &[("make", "payload two\n"), ("result", "t\n")],
    );
    // Incomplete newer attempt must not shift the comparison window.
    write_attempt(temp.path(), "t", "20240103T000000Z", &[("make", "junk\n")]);

    let report = latest_logdiff(&config, "t").unwrap().unwrap();
    assert_eq!(report.older_id, "20240101T000000Z");
    assert_eq!(report.newer_id, "20240102T000000Z");
    assert!(report.text.contains("-payload one"));
    assert!(report.text.contains("+payload two"));
  }

  #[test]
  fn logdiff_needs_two_attempts() {
    let temp = TempDir::new().unwrap();
    let config = EngineConfig::new(temp.path());
    assert!(latest_logdiff(&config, "t").unwrap().is_none());
    write_attempt(temp.path(), "t", "20240101T000000Z", &[("result", "t\n")]);
    assert!(latest_logdiff(&config, "t").unwrap().is_none());
  }
}
