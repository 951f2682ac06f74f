mod build;
mod list;
mod logdiff;
mod title;

pub use build::cmd_build;
pub use list::cmd_list;
pub use logdiff::cmd_logdiff;
pub use title::cmd_title;

use std::path::Path;

use vigil_lib::config::{self, EngineConfig};

fn engine_config(root: Option<&Path>) -> EngineConfig {
  match root {
    Some(root) => EngineConfig::new(root),
    None => EngineConfig::new(&config::default_root()),
  }
}
