//! List command implementation.

use std::path::Path;

use anyhow::Result;

use vigil_lib::status::{self, BuildStatus};

use crate::output::{print_failure, print_info, print_json, print_success};

pub fn cmd_list(root: Option<&Path>, json: bool) -> Result<()> {
  let engine = super::engine_config(root);
  let summaries = status::list_builds(&engine)?;

  if json {
    return print_json(&summaries);
  }

  if summaries.is_empty() {
    print_info("no builds yet");
    return Ok(());
  }
  for summary in &summaries {
    let attempts = format!(
      "{} attempt{}",
      summary.attempts,
      if summary.attempts == 1 { "" } else { "s" }
    );
    match &summary.last {
      BuildStatus::Succeeded { title, .. } => {
        print_success(&format!("{} ({attempts}) {title}", summary.identity));
      }
      BuildStatus::Failed { reason, .. } => {
        print_failure(&format!(
          "{} ({attempts}) last attempt failed: {reason}",
          summary.identity
        ));
      }
      BuildStatus::NoAttempts => {
        print_info(&format!("{} no attempts yet", summary.identity));
      }
    }
  }
  Ok(())
}
