//! Title command implementation.
//!
//! One line per named build: "no attempts yet", the failure reason, or
//! the title hook's summary.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use vigil_lib::status::{self, BuildStatus};

use crate::output::{print_failure, print_info, print_json, print_success};

#[derive(Serialize)]
struct TitleLine<'a> {
  identity: &'a str,
  #[serde(flatten)]
  status: BuildStatus,
}

pub fn cmd_title(root: Option<&Path>, identities: &[String], json: bool) -> Result<()> {
  let engine = super::engine_config(root);

  if json {
    let lines = identities
      .iter()
      .map(|identity| {
        Ok(TitleLine {
          identity,
          status: status::build_status(&engine, identity)?,
        })
      })
      .collect::<Result<Vec<_>>>()?;
    return print_json(&lines);
  }

  for identity in identities {
    match status::build_status(&engine, identity)? {
      BuildStatus::NoAttempts => print_info(&format!("{identity}: no attempts yet")),
      BuildStatus::Failed { reason, .. } => {
        print_failure(&format!("{identity}: last attempt failed: {reason}"));
      }
      BuildStatus::Succeeded { title, .. } => print_success(&format!("{identity}: {title}")),
    }
  }
  Ok(())
}
