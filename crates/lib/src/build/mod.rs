//! Per-attempt build handle.
//!
//! A `Build` is what a target's callback receives: it owns the attempt
//! directory, the open log file and the base run options, and turns
//! every external command into a log section with a supervised run.
//!
//! Attempt layout under `<root>/<identity>/<attempt>/`:
//! - `log`: the section-structured attempt log
//! - `bin/`: private directory prefixed onto the child's `PATH`
//! - `tmp/`: private scratch directory exported as `TMPDIR`

use std::io::Write;
use std::path::{Path, PathBuf};

use nix::sys::signal::Signal;
use thiserror::Error;
use tracing::{info, warn};

use crate::logfile::{LOG_FILENAME, LogFile, LogFileError};
use crate::supervisor::{self, ProcessResult, RunOptions};
use crate::timestamp::AttemptName;
use crate::vcs::{VcsAdapter, VcsError};

#[derive(Debug, Error)]
pub enum AttemptError {
  #[error("command in section {section:?} exited with status {status}")]
  CommandFailure { section: String, status: i32 },

  #[error("command in section {section:?} killed by {signal:?}")]
  CommandSignaled { section: String, signal: Signal },

  #[error("command in section {section:?} stopped by {signal:?}")]
  CommandStopped { section: String, signal: Signal },

  #[error("command in section {section:?} timed out")]
  TimeoutFailure {
    section: String,
    signal: Option<Signal>,
  },

  #[error("command not found: {command}")]
  CommandNotFound { command: String },

  #[error(transparent)]
  Vcs(#[from] VcsError),

  #[error(transparent)]
  Log(#[from] LogFileError),

  #[error(transparent)]
  Supervisor(#[from] supervisor::SupervisorError),

  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),
}

impl AttemptError {
  /// One-line reason recorded in the `failure` section.
  pub fn reason(&self) -> String {
    match self {
      AttemptError::CommandFailure { section, status } => {
        format!("{section} exited with status {status}")
      }
      AttemptError::CommandSignaled { section, signal } => {
        format!("{section} killed by {signal:?}")
      }
      AttemptError::CommandStopped { section, signal } => {
        format!("{section} stopped by {signal:?}")
      }
      AttemptError::TimeoutFailure { section, .. } => format!("{section} timed out"),
      AttemptError::CommandNotFound { command } => format!("command not found: {command}"),
      other => other.to_string(),
    }
  }
}

pub struct Build {
  identity: String,
  target_name: String,
  attempt: AttemptName,
  dir: PathBuf,
  log: LogFile,
  base_options: RunOptions,
  versions: Vec<String>,
}

impl Build {
  /// Creates the attempt directory tree and opens the log with a `start`
  /// section naming the build.
  ///
  /// Fails with `AlreadyExists` when the attempt directory is present,
  /// which the scheduler reports as a duplicate attempt.
  pub fn begin(
    build_dir: &Path,
    identity: &str,
    target_name: &str,
    attempt: AttemptName,
    target_options: &RunOptions,
  ) -> Result<Self, AttemptError> {
    let dir = build_dir.join(attempt.as_str());
    std::fs::create_dir_all(build_dir)?;
    std::fs::create_dir(&dir)?;
    let bin_dir = dir.join("bin");
    let tmp_dir = dir.join("tmp");
    std::fs::create_dir(&bin_dir)?;
    std::fs::create_dir(&tmp_dir)?;

    let mut base_options = target_options.clone();
    base_options.cwd = Some(dir.clone());
    let path = match std::env::var("PATH") {
      Ok(existing) => format!("{}:{existing}", bin_dir.display()),
      Err(_) => bin_dir.display().to_string(),
    };
    base_options.env.insert("PATH".to_string(), path);
    base_options
      .env
      .insert("TMPDIR".to_string(), tmp_dir.display().to_string());

    let mut log = LogFile::open_write(dir.join(LOG_FILENAME))?;
    log.start_section("start")?;
    let mut handle = log.append_handle()?;
    writeln!(handle, "{identity} {attempt}")?;

    info!(identity, attempt = %attempt, "starting build attempt");
    Ok(Build {
      identity: identity.to_string(),
      target_name: target_name.to_string(),
      attempt,
      dir,
      log,
      base_options,
      versions: Vec::new(),
    })
  }

  pub fn identity(&self) -> &str {
    &self.identity
  }

  pub fn target_name(&self) -> &str {
    &self.target_name
  }

  pub fn attempt(&self) -> &AttemptName {
    &self.attempt
  }

  /// The attempt directory; commands run with this as their working
  /// directory unless overridden.
  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn log(&mut self) -> &mut LogFile {
    &mut self.log
  }

  /// Starts a log section named `section` and runs `command args...`
  /// under the supervisor with output appended to the log. Non-zero
  /// exits, signals, timeouts and missing executables become errors.
  pub fn run(&mut self, section: &str, command: &str, args: &[String]) -> Result<(), AttemptError> {
    self.run_with(section, command, args, &RunOptions::default())
  }

  pub fn run_with(
    &mut self,
    section: &str,
    command: &str,
    args: &[String],
    opts: &RunOptions,
  ) -> Result<(), AttemptError> {
    let section = self.log.start_section(section)?;
    {
      let mut handle = self.log.append_handle()?;
      writeln!(handle, "+ {} {}", command, args.join(" "))?;
    }
    let effective = opts.overlaid_on(&self.base_options);
    let result = supervisor::run(command, args, self.log.path(), &effective)?;
    match result {
      ProcessResult::Exited(0) => Ok(()),
      ProcessResult::Exited(status) => Err(AttemptError::CommandFailure { section, status }),
      ProcessResult::Signaled(signal) => Err(AttemptError::CommandSignaled { section, signal }),
      ProcessResult::Stopped(signal) => Err(AttemptError::CommandStopped { section, signal }),
      ProcessResult::TimedOut { signal } => Err(AttemptError::TimeoutFailure { section, signal }),
      ProcessResult::NotFound => Err(AttemptError::CommandNotFound {
        command: command.to_string(),
      }),
    }
  }

  /// Checks out `location` into `<attempt>/<workdir>` through the
  /// adapter, recording its revision-change summary in a section named
  /// after the adapter.
  pub fn checkout(
    &mut self,
    adapter: &dyn VcsAdapter,
    location: &str,
    workdir: &str,
  ) -> Result<PathBuf, AttemptError> {
    self.log.start_section(adapter.name())?;
    let dest = self.dir.join(workdir);
    let summary = adapter.checkout_or_update(location, &dest)?;
    let mut handle = self.log.append_handle()?;
    writeln!(handle, "checkout {location} into {workdir}")?;
    for line in &summary {
      writeln!(handle, "{line}")?;
    }
    Ok(dest)
  }

  /// Declares a version identifier for this attempt, reported to the
  /// parent and written into the `result` section on success.
  pub fn add_version(&mut self, version: &str) {
    self.versions.push(version.to_string());
  }

  pub fn versions(&self) -> &[String] {
    &self.versions
  }

  /// Writes the `result` section; its body is what title hooks read.
  pub fn record_result(&mut self) -> Result<(), AttemptError> {
    self.log.start_section("result")?;
    let mut handle = self.log.append_handle()?;
    if self.versions.is_empty() {
      writeln!(handle, "{}", self.identity)?;
    } else {
      for version in &self.versions {
        writeln!(handle, "{version}")?;
      }
    }
    Ok(())
  }

  /// Writes the `failure` section with the error's reason line.
  pub fn record_failure(&mut self, error: &AttemptError) -> Result<(), AttemptError> {
    warn!(identity = %self.identity, error = %error, "build attempt failed");
    self.log.start_section("failure")?;
    let mut handle = self.log.append_handle()?;
    writeln!(handle, "{}", error.reason())?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn begin(temp: &TempDir) -> Build {
    Build::begin(
      &temp.path().join("ruby"),
      "ruby",
      "ruby",
      AttemptName::now(),
      &RunOptions::new(),
    )
    .unwrap()
  }

  fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn attempt_layout_is_created() {
    let temp = TempDir::new().unwrap();
    let build = begin(&temp);
    assert!(build.dir().join("bin").is_dir());
    assert!(build.dir().join("tmp").is_dir());
    assert!(build.dir().join("log").is_file());
    let text = std::fs::read_to_string(build.dir().join("log")).unwrap();
    assert!(text.starts_with("== start # "));
    assert!(text.contains(&format!("ruby {}", build.attempt())));
  }

  #[test]
  fn duplicate_attempt_directory_is_rejected() {
    let temp = TempDir::new().unwrap();
    let attempt = AttemptName::now();
    let dir = temp.path().join("ruby");
    Build::begin(&dir, "ruby", "ruby", attempt.clone(), &RunOptions::new()).unwrap();
    let err = Build::begin(&dir, "ruby", "ruby", attempt, &RunOptions::new());
    assert!(matches!(
      err,
      Err(AttemptError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists
    ));
  }

  #[test]
  fn run_captures_output_in_its_section() {
    let temp = TempDir::new().unwrap();
    let mut build = begin(&temp);
    build.run("version", "sh", &args(&["-c", "echo 4.2.1"])).unwrap();
    build.run("make", "sh", &args(&["-c", "echo compiling"])).unwrap();

    let log = build.log();
    assert_eq!(
      log.get_section("version").unwrap().unwrap(),
      "+ sh -c echo 4.2.1\n4.2.1\n"
    );
    assert_eq!(
      log.get_section("make").unwrap().unwrap(),
      "+ sh -c echo compiling\ncompiling\n"
    );
  }

  #[test]
  fn commands_run_inside_the_attempt_directory() {
    let temp = TempDir::new().unwrap();
    let mut build = begin(&temp);
    build.run("touch", "sh", &args(&["-c", "echo hi > marker"])).unwrap();
    assert!(build.dir().join("marker").is_file());
  }

  #[test]
  fn tmpdir_and_path_are_private() {
    let temp = TempDir::new().unwrap();
    let mut build = begin(&temp);
    build
      .run("env", "sh", &args(&["-c", "echo $TMPDIR; echo $PATH"]))
      .unwrap();
    let body = build.log().get_section("env").unwrap().unwrap();
    assert!(body.contains("/tmp\n"));
    let bin = build.dir().join("bin");
    assert!(body.contains(&format!("{}:", bin.display())));
  }

  #[test]
  fn nonzero_exit_maps_to_command_failure() {
    let temp = TempDir::new().unwrap();
    let mut build = begin(&temp);
    let err = build.run("make", "sh", &args(&["-c", "exit 2"])).unwrap_err();
    match err {
      AttemptError::CommandFailure { section, status } => {
        assert_eq!(section, "make");
        assert_eq!(status, 2);
      }
      other => panic!("unexpected error: {other:?}"),
    }
  }

  #[test]
  fn failure_section_carries_the_reason() {
    let temp = TempDir::new().unwrap();
    let mut build = begin(&temp);
    let err = build.run("make", "sh", &args(&["-c", "exit 2"])).unwrap_err();
    build.record_failure(&err).unwrap();
    assert_eq!(
      build.log().get_section("failure").unwrap().unwrap(),
      "make exited with status 2\n"
    );
  }

  #[test]
  fn result_section_lists_versions() {
    let temp = TempDir::new().unwrap();
    let mut build = begin(&temp);
    build.add_version("ruby 3.4.0dev (2026-08-24) [x86_64-linux]");
    build.record_result().unwrap();
    assert_eq!(
      build.log().get_section("result").unwrap().unwrap(),
      "ruby 3.4.0dev (2026-08-24) [x86_64-linux]\n"
    );
  }

  #[test]
  fn checkout_records_adapter_summary() {
    struct Fixed;
    impl VcsAdapter for Fixed {
      fn name(&self) -> &str {
        "svn"
      }
      fn checkout_or_update(&self, _location: &str, workdir: &Path) -> Result<Vec<String>, VcsError> {
        std::fs::create_dir_all(workdir)?;
        Ok(vec![
          "COMMIT r1024".to_string(),
          "CHG main.c 1.4 -> 1.5".to_string(),
        ])
      }
    }
    let temp = TempDir::new().unwrap();
    let mut build = begin(&temp);
    let dest = build.checkout(&Fixed, "svn://example/repo", "src").unwrap();
    assert!(dest.is_dir());
    let body = build.log().get_section("svn").unwrap().unwrap();
    assert!(body.contains("COMMIT r1024\n"));
    assert!(body.contains("CHG main.c 1.4 -> 1.5\n"));
  }
}
