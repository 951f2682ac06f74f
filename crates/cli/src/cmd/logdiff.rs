//! Logdiff command implementation.
//!
//! Prints the change report between the two most recent complete
//! attempts of each named build. Metadata change lines come first; they
//! summarize revision changes the line diff would scatter across hunks.

use std::path::Path;

use anyhow::Result;

use vigil_lib::status;

use crate::output::{print_info, print_stat};

pub fn cmd_logdiff(root: Option<&Path>, identities: &[String]) -> Result<()> {
  let engine = super::engine_config(root);

  for identity in identities {
    let Some(report) = status::latest_logdiff(&engine, identity)? else {
      print_info(&format!("{identity}: fewer than two complete attempts"));
      continue;
    };
    print_info(&format!(
      "{identity}: {} -> {}",
      report.older_id, report.newer_id
    ));
    if !report.has_changes() {
      print_stat("changed", "nothing");
      continue;
    }
    if !report.changed_sections.is_empty() {
      print_stat("changed", &report.changed_sections.join(", "));
    }
    for line in &report.metadata_lines {
      println!("{line}");
    }
    print!("{}", report.text);
  }
  Ok(())
}
