//! Attempt naming and the legacy timestamp ordering.
//!
//! Every attempt directory is named after the moment the attempt started:
//! `YYYYMMDDTHHMMSS` (legacy local time) or `YYYYMMDDTHHMMSSZ` (UTC).
//! New attempts always produce the UTC-marked form; the unmarked form is
//! only parsed so trees written by older deployments keep sorting the way
//! they always did: every local-time name sorts before every UTC-marked
//! name, and within each group the lexicographic order is the
//! chronological order.

use std::cmp::Ordering;
use std::fmt;
use std::io;
use std::path::Path;

use chrono::{NaiveDateTime, Utc};
use thiserror::Error;

const BODY_FORMAT: &str = "%Y%m%dT%H%M%S";

#[derive(Debug, Error)]
pub enum TimestampError {
  #[error("invalid attempt name: {0:?}")]
  Invalid(String),
}

/// Timestamp-derived name of one build attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttemptName {
  raw: String,
  utc_marked: bool,
}

impl AttemptName {
  /// Name for an attempt starting now (always UTC-marked).
  pub fn now() -> Self {
    AttemptName {
      raw: Utc::now().format("%Y%m%dT%H%M%SZ").to_string(),
      utc_marked: true,
    }
  }

  pub fn parse(s: &str) -> Result<Self, TimestampError> {
    let (body, utc_marked) = match s.strip_suffix('Z') {
      Some(body) => (body, true),
      None => (s, false),
    };
    if NaiveDateTime::parse_from_str(body, BODY_FORMAT).is_err() {
      return Err(TimestampError::Invalid(s.to_string()));
    }
    Ok(AttemptName {
      raw: s.to_string(),
      utc_marked,
    })
  }

  pub fn as_str(&self) -> &str {
    &self.raw
  }

  pub fn is_utc_marked(&self) -> bool {
    self.utc_marked
  }
}

impl fmt::Display for AttemptName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.raw)
  }
}

impl Ord for AttemptName {
  fn cmp(&self, other: &Self) -> Ordering {
    match (self.utc_marked, other.utc_marked) {
      (false, true) => Ordering::Less,
      (true, false) => Ordering::Greater,
      _ => self.raw.cmp(&other.raw),
    }
  }
}

impl PartialOrd for AttemptName {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

/// All attempt names under a build directory, sorted oldest first.
///
/// Entries that do not parse as attempt names are ignored.
pub fn attempts_in(dir: &Path) -> io::Result<Vec<AttemptName>> {
  let mut attempts = Vec::new();
  for entry in std::fs::read_dir(dir)?.flatten() {
    if !entry.path().is_dir() {
      continue;
    }
    if let Some(name) = entry.file_name().to_str()
      && let Ok(attempt) = AttemptName::parse(name)
    {
      attempts.push(attempt);
    }
  }
  attempts.sort();
  Ok(attempts)
}
