use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;
mod output;

/// vigil - continuous build monitor
#[derive(Parser)]
#[command(name = "vigil")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Build root directory (default: the per-user state directory)
  #[arg(long, global = true)]
  root: Option<PathBuf>,

  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run one scheduling pass over the targets in a config file
  Build {
    /// Path to the target definition file
    #[arg(default_value = "vigil.toml")]
    config: PathBuf,
  },

  /// List known build identities with their last status
  List {
    /// Emit JSON instead of text
    #[arg(long)]
    json: bool,
  },

  /// Print the one-line status summary for named builds
  Title {
    /// Build identities
    #[arg(required = true)]
    identities: Vec<String>,

    /// Emit JSON instead of text
    #[arg(long)]
    json: bool,
  },

  /// Print the diff between the two most recent attempts of named builds
  Logdiff {
    /// Build identities
    #[arg(required = true)]
    identities: Vec<String>,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let filter = if cli.verbose {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
  } else {
    EnvFilter::from_default_env()
  };
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match cli.command {
    Commands::Build { config } => cmd::cmd_build(cli.root.as_deref(), &config),
    Commands::List { json } => cmd::cmd_list(cli.root.as_deref(), json),
    Commands::Title { identities, json } => cmd::cmd_title(cli.root.as_deref(), &identities, json),
    Commands::Logdiff { identities } => cmd::cmd_logdiff(cli.root.as_deref(), &identities),
  }
}
