//! Change detection between two attempt logs.
//!
//! The diff is directional: for each side, a line counts as changed when
//! it does not occur anywhere on the other side (a membership test, not a
//! minimal edit script). Contiguous runs of changed lines become hunks
//! with a fixed window of surrounding context; runs whose windows would
//! overlap are merged. Each direction is emitted as its own block under a
//! `---` / `+++` header. This over-reports when lines are merely
//! reordered; that matches the historical reports this engine must stay
//! comparable with.

pub mod rules;

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::logfile;
use rules::{LineRewriter, RuleSpec};

/// Unchanged lines kept around each run of differing lines.
pub const CONTEXT_LINES: usize = 3;

/// One side of a comparison: an attempt id plus the raw log text.
#[derive(Debug, Clone)]
pub struct LogSnapshot {
  pub id: String,
  pub text: String,
}

impl LogSnapshot {
  pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
    LogSnapshot {
      id: id.into(),
      text: text.into(),
    }
  }
}

/// Result of comparing two snapshots. Exists even when nothing changed;
/// "no prior attempt" is represented by `diff` returning `None` instead.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DiffReport {
  pub older_id: String,
  pub newer_id: String,
  /// Rendered hunk blocks, one per direction; empty when identical.
  pub text: String,
  /// Newer-side sections ordered by first difference, then sections
  /// whose only changes are removals (including sections that
  /// disappeared entirely), ordered by first removed line.
  pub changed_sections: Vec<String>,
  /// Structured revision/version-change records, collected independently
  /// of the line diff.
  pub metadata_lines: Vec<String>,
}

impl DiffReport {
  pub fn has_changes(&self) -> bool {
    !self.text.is_empty() || !self.changed_sections.is_empty()
  }
}

struct Side {
  /// Lines after rule preprocessing.
  lines: Vec<String>,
  /// Enclosing section per line; `None` before the first separator.
  sections: Vec<Option<String>>,
  /// Section names in file order.
  section_names: Vec<String>,
}

/// Compares two snapshots. `None` older snapshot means "first attempt,
/// nothing to compare" and yields `None`.
pub fn diff(older: Option<&LogSnapshot>, newer: &LogSnapshot, rules: &[RuleSpec]) -> Option<DiffReport> {
  let older = older?;
  let old_side = preprocess(older, rules);
  let new_side = preprocess(newer, rules);

  let old_set: HashSet<&str> = old_side.lines.iter().map(String::as_str).collect();
  let new_set: HashSet<&str> = new_side.lines.iter().map(String::as_str).collect();

  let removed: Vec<bool> = old_side
    .lines
    .iter()
    .map(|line| !new_set.contains(line.as_str()))
    .collect();
  let added: Vec<bool> = new_side
    .lines
    .iter()
    .map(|line| !old_set.contains(line.as_str()))
    .collect();

  let mut text = String::new();
  if removed.iter().any(|&c| c) {
    let _ = writeln!(text, "--- {}", older.id);
    render_hunks(&mut text, &old_side.lines, &removed, '-');
  }
  if added.iter().any(|&c| c) {
    let _ = writeln!(text, "+++ {}", newer.id);
    render_hunks(&mut text, &new_side.lines, &added, '+');
  }

  let changed_sections = attribute_sections(&new_side, &added, &old_side, &removed);
  let metadata_lines = collect_metadata(&newer.text);

  Some(DiffReport {
    older_id: older.id.clone(),
    newer_id: newer.id.clone(),
    text,
    changed_sections,
    metadata_lines,
  })
}

fn preprocess(snapshot: &LogSnapshot, rules: &[RuleSpec]) -> Side {
  let mut rewriters: Vec<(&str, Box<dyn LineRewriter>)> =
    rules.iter().map(|r| (r.name(), r.instantiate())).collect();
  let mut side = Side {
    lines: Vec::new(),
    sections: Vec::new(),
    section_names: Vec::new(),
  };
  let mut mark: Option<&str> = None;
  let mut current: Option<String> = None;

  for (idx, raw) in snapshot.text.lines().enumerate() {
    let separator = match mark {
      None => logfile::detect_separator(raw).map(|(m, name)| {
        mark = Some(m);
        name
      }),
      Some(m) => logfile::parse_separator(raw, m),
    };
    if let Some(name) = separator {
      current = Some(name.to_string());
      side.section_names.push(name.to_string());
    }

    let mut line = raw.to_string();
    for (name, rewriter) in &mut rewriters {
      match rewriter.rewrite(&line) {
        Ok(rewritten) => line = rewritten,
        Err(e) => {
          // The offending rule is skipped for this line only.
          warn!(rule = %name, line = idx + 1, error = %e, "rewrite rule failed, skipping");
        }
      }
    }
    side.lines.push(line);
    side.sections.push(current.clone());
  }
  side
}

/// Inclusive line ranges covering each merged run of changed lines plus
/// its context window.
fn hunk_ranges(changed: &[bool]) -> Vec<(usize, usize)> {
  let mut runs: Vec<(usize, usize)> = Vec::new();
  let mut idx = 0;
  while idx < changed.len() {
    if changed[idx] {
      let start = idx;
      while idx < changed.len() && changed[idx] {
        idx += 1;
      }
      runs.push((start, idx - 1));
    } else {
      idx += 1;
    }
  }

  // Merge runs whose context windows would overlap.
  let mut merged: Vec<(usize, usize)> = Vec::new();
  for run in runs {
    match merged.last_mut() {
      Some(last) if run.0 - last.1 - 1 < 2 * CONTEXT_LINES => last.1 = run.1,
      _ => merged.push(run),
    }
  }

  merged
    .into_iter()
    .map(|(start, end)| {
      (
        start.saturating_sub(CONTEXT_LINES),
        (end + CONTEXT_LINES).min(changed.len() - 1),
      )
    })
    .collect()
}

fn render_hunks(out: &mut String, lines: &[String], changed: &[bool], sign: char) {
  for (start, end) in hunk_ranges(changed) {
    let _ = writeln!(out, "@@ {} @@", start + 1);
    for i in start..=end {
      let prefix = if changed[i] { sign } else { ' ' };
      let _ = writeln!(out, "{}{}", prefix, lines[i]);
    }
  }
}

fn attribute_sections(
  new_side: &Side,
  added: &[bool],
  old_side: &Side,
  removed: &[bool],
) -> Vec<String> {
  let mut sections: Vec<String> = Vec::new();

  // Newer-side sections in order of the first line where a difference
  // appears (`added` is scanned in line order).
  for (i, &changed) in added.iter().enumerate() {
    if changed
      && let Some(name) = &new_side.sections[i]
      && !sections.contains(name)
    {
      sections.push(name.clone());
    }
  }

  // Removal-only changes leave no mark on the newer side; those
  // sections are attributed from the old side. This also covers
  // sections that disappeared entirely, via their separator lines.
  for (i, &changed) in removed.iter().enumerate() {
    if changed
      && let Some(name) = &old_side.sections[i]
      && !sections.contains(name)
    {
      sections.push(name.clone());
    }
  }
  sections
}

/// Fixed vocabulary of change-record markers; see [`crate::vcs`] for the
/// producers.
fn metadata_patterns() -> &'static [Regex; 2] {
  static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
  PATTERNS.get_or_init(|| {
    [
      Regex::new(r"^(CHG|ADD|DEL|COMMIT)\b").expect("builtin metadata pattern is valid"),
      Regex::new(r"\bchanged from \S+ to \S+").expect("builtin metadata pattern is valid"),
    ]
  })
}

fn collect_metadata(text: &str) -> Vec<String> {
  let patterns = metadata_patterns();
  text
    .lines()
    .filter(|line| patterns.iter().any(|p| p.is_match(line)))
    .map(str::to_string)
    .collect()
}
