//! Line rewrite rules applied to each snapshot before diffing.
//!
//! Rules run in registration order, line by line. A rule is instantiated
//! once per snapshot, so a stateful rewriter can carry context across
//! lines of one snapshot (canonicalizing order-varying groups, say) but
//! never leaks state into the other snapshot.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("rule {rule} failed: {message}")]
pub struct RuleError {
  pub rule: String,
  pub message: String,
}

impl RuleError {
  pub fn new(rule: impl Into<String>, message: impl Into<String>) -> Self {
    RuleError {
      rule: rule.into(),
      message: message.into(),
    }
  }
}

/// A per-snapshot line rewriter. `rewrite` sees lines in file order.
pub trait LineRewriter {
  fn rewrite(&mut self, line: &str) -> Result<String, RuleError>;
}

/// Named rule specification; `instantiate` produces a fresh rewriter for
/// each snapshot.
#[derive(Clone)]
pub struct RuleSpec {
  name: String,
  make: Arc<dyn Fn() -> Box<dyn LineRewriter> + Send + Sync>,
}

impl RuleSpec {
  pub fn new(
    name: &str,
    make: impl Fn() -> Box<dyn LineRewriter> + Send + Sync + 'static,
  ) -> Self {
    RuleSpec {
      name: name.to_string(),
      make: Arc::new(make),
    }
  }

  /// Stateless pattern/replacement rule.
  pub fn pattern(name: &str, pattern: &str, replacement: &str) -> Result<Self, regex::Error> {
    let re = Regex::new(pattern)?;
    let replacement = replacement.to_string();
    Ok(Self::new(name, move || {
      Box::new(PatternRule {
        re: re.clone(),
        replacement: replacement.clone(),
      })
    }))
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn instantiate(&self) -> Box<dyn LineRewriter> {
    (self.make)()
  }
}

impl fmt::Debug for RuleSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RuleSpec").field("name", &self.name).finish()
  }
}

struct PatternRule {
  re: Regex,
  replacement: String,
}

impl LineRewriter for PatternRule {
  fn rewrite(&mut self, line: &str) -> Result<String, RuleError> {
    Ok(self.re.replace_all(line, self.replacement.as_str()).into_owned())
  }
}

/// Built-in noise rules: timestamps, elapsed times, pids, byte counters
/// and addresses never show up as differences between attempts.
pub fn default_rules() -> Vec<RuleSpec> {
  let specs = [
    (
      "timestamp",
      r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
      "<time>",
    ),
    ("attempt-name", r"\b\d{8}T\d{6}Z?\b", "<time>"),
    (
      "elapsed-label",
      r"(?i)\b(elapsed|real|user|sys)([ :=]+)\d+(?:\.\d+)?",
      "${1}${2}<elapsed>",
    ),
    ("duration", r"\b\d+(?:\.\d+)?(?:ms|us|s|sec|min)\b", "<elapsed>"),
    ("pid-label", r"(?i)\b(pid[ :=]+)\d+", "${1}<pid>"),
    ("bracket-pid", r"\[\d+\]", "[<pid>]"),
    (
      "byte-counter",
      r"(?i)\b\d+(?:\.\d+)?\s*(?:bytes?|[kmg]i?b)\b",
      "<bytes>",
    ),
    ("address", r"\b0x[0-9a-fA-F]+\b", "<addr>"),
  ];
  specs
    .iter()
    .map(|(name, pattern, replacement)| {
      RuleSpec::pattern(name, pattern, replacement).expect("builtin rule pattern is valid")
    })
    .collect()
}
