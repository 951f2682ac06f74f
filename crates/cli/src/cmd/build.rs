//! Build command implementation.
//!
//! Loads a TOML target definition file, expands it into `Target`s whose
//! callbacks run the declared command steps, takes the exclusive
//! build-root lock and performs one scheduling pass.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::debug;

use vigil_lib::scheduler::{Outcome, Scheduler};
use vigil_lib::supervisor::RunOptions;
use vigil_lib::target::{BuildCallback, Target};

use crate::output::{format_elapsed, print_failure, print_info, print_stat, print_success};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildConfig {
  #[serde(default)]
  num_oldbuilds: Option<usize>,
  #[serde(default)]
  target: Vec<TargetDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetDef {
  name: String,
  /// Suffix dimensions; an empty string is the absent alternative.
  #[serde(default)]
  dimensions: Vec<Vec<String>>,
  #[serde(default)]
  deps: Vec<String>,
  /// Raw run options (`timeout`, `ENV:*`, `rlimit_*`, ...).
  #[serde(default)]
  options: BTreeMap<String, String>,
  /// Version line recorded in the `result` section on success.
  #[serde(default)]
  version: Option<String>,
  #[serde(default)]
  step: Vec<StepDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepDef {
  section: String,
  command: String,
  #[serde(default)]
  args: Vec<String>,
  #[serde(default)]
  fallbacks: Vec<String>,
}

pub fn cmd_build(root: Option<&Path>, config_path: &Path) -> Result<()> {
  let text = std::fs::read_to_string(config_path)
    .with_context(|| format!("cannot read config file {}", config_path.display()))?;
  let parsed: BuildConfig = toml::from_str(&text)
    .with_context(|| format!("cannot parse config file {}", config_path.display()))?;
  if parsed.target.is_empty() {
    bail!("config file {} defines no targets", config_path.display());
  }

  debug!(targets = parsed.target.len(), config = %config_path.display(), "loaded target definitions");

  let mut engine = super::engine_config(root);
  if let Some(n) = parsed.num_oldbuilds {
    engine.num_oldbuilds = n;
  }

  let mut scheduler = Scheduler::new(&engine);
  for def in parsed.target {
    scheduler.add_target(into_target(def)?);
  }

  print_info(&format!("build root: {}", engine.build_root.display()));
  let started = Instant::now();
  let records = scheduler.run_pass("vigil build")?;

  let mut failures = 0usize;
  for record in &records {
    match &record.outcome {
      Outcome::Succeeded { versions } => {
        let detail = if versions.is_empty() {
          record.attempt.to_string()
        } else {
          format!("{} ({})", record.attempt, versions.join(", "))
        };
        print_success(&format!("{} {}", record.identity, detail));
      }
      Outcome::Failed { reason } => {
        failures += 1;
        print_failure(&format!("{} {}: {}", record.identity, record.attempt, reason));
      }
    }
    if let Some(diff) = &record.diff {
      if diff.has_changes() {
        print_stat("changed", &diff.changed_sections.join(", "));
      } else {
        print_stat("changed", "nothing");
      }
    }
  }

  print_info(&format!(
    "{} build(s), {} failed, {}",
    records.len(),
    failures,
    format_elapsed(started.elapsed())
  ));
  Ok(())
}

fn into_target(def: TargetDef) -> Result<Target> {
  let mut options = RunOptions::new();
  for (key, value) in &def.options {
    options
      .apply_raw(key, value)
      .with_context(|| format!("target {}: bad option", def.name))?;
  }

  let steps = def.step.clone();
  let version = def.version.clone();
  let callback: BuildCallback = Box::new(move |build| {
    for step in &steps {
      let mut step_opts = RunOptions::default();
      step_opts.fallbacks = step.fallbacks.clone();
      build.run_with(&step.section, &step.command, &step.args, &step_opts)?;
    }
    if let Some(version) = &version {
      build.add_version(version);
    }
    Ok(())
  });

  let mut target = Target::new(&def.name, callback)
    .with_context(|| format!("invalid target {:?}", def.name))?
    .with_options(options);
  for dimension in def.dimensions {
    let alternatives = dimension
      .into_iter()
      .map(|token| if token.is_empty() { None } else { Some(token) })
      .collect();
    target = target.dimension(alternatives);
  }
  for dep in &def.deps {
    target = target.depends_on(dep);
  }
  Ok(target)
}
