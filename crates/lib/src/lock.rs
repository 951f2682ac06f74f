//! Build-root locking for mutual exclusion between scheduler passes.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const LOCK_FILENAME: &str = ".lock";

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub command: String,
  pub root: PathBuf,
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error(
    "build root is locked by another process: {command} (PID {pid}, started at Unix timestamp {started_at_unix})\n\
     If you're sure no other run is active, remove the lock file:\n  {lock_path}"
  )]
  Contention {
    command: String,
    pid: u32,
    started_at_unix: u64,
    lock_path: PathBuf,
  },

  #[error(
    "build root is locked (could not read lock metadata)\n\
     If you're sure no other run is active, remove the lock file:\n  {lock_path}"
  )]
  ContentionUnknown { lock_path: PathBuf },

  #[error("failed to create build root: {0}")]
  CreateDir(#[source] io::Error),

  #[error("failed to open lock file: {0}")]
  OpenFile(#[source] io::Error),

  #[error("failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("failed to acquire lock: {0}")]
  LockFailed(#[source] Errno),
}

/// Exclusive flock over `<root>/.lock`, held for the life of a scheduler
/// pass. Dropping releases the lock.
pub struct BuildLock {
  file: Flock<File>,
  lock_path: PathBuf,
}

impl BuildLock {
  pub fn acquire(root: &Path, command: &str) -> Result<Self, LockError> {
    let lock_path = root.join(LOCK_FILENAME);

    if !root.exists() {
      std::fs::create_dir_all(root).map_err(LockError::CreateDir)?;
    }

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(LockError::OpenFile)?;

    let mut file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
      Ok(locked) => locked,
      Err((_, Errno::EAGAIN)) => return Err(read_contention_error(&lock_path)),
      Err((_, e)) => return Err(LockError::LockFailed(e)),
    };

    write_metadata(&mut file, command, root)?;
    debug!(path = %lock_path.display(), "acquired build-root lock");

    Ok(BuildLock { file, lock_path })
  }

  /// Reads the metadata back through the held handle. Used by tests and
  /// diagnostics; holders do not need a second open.
  pub fn read_metadata(&self) -> io::Result<LockMetadata> {
    use std::io::{Seek, SeekFrom};

    let mut file: &File = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}

fn write_metadata(file: &mut File, command: &str, root: &Path) -> Result<(), LockError> {
  let metadata = LockMetadata {
    version: 1,
    pid: std::process::id(),
    started_at_unix: SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs(),
    command: command.to_string(),
    root: root.to_path_buf(),
  };

  file.set_len(0).map_err(LockError::WriteMetadata)?;
  let mut writer = io::BufWriter::new(file);
  serde_json::to_writer_pretty(&mut writer, &metadata)
    .map_err(|e| LockError::WriteMetadata(io::Error::other(e)))?;
  writer.flush().map_err(LockError::WriteMetadata)?;
  Ok(())
}

fn read_contention_error(lock_path: &Path) -> LockError {
  if let Ok(mut file) = File::open(lock_path) {
    let mut contents = String::new();
    if file.read_to_string(&mut contents).is_ok()
      && let Ok(metadata) = serde_json::from_str::<LockMetadata>(&contents)
    {
      return LockError::Contention {
        command: metadata.command,
        pid: metadata.pid,
        started_at_unix: metadata.started_at_unix,
        lock_path: lock_path.to_path_buf(),
      };
    }
  }
  LockError::ContentionUnknown {
    lock_path: lock_path.to_path_buf(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn acquire_creates_root_and_lock_file() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("builds");
    let lock = BuildLock::acquire(&root, "test").unwrap();
    assert!(root.is_dir());
    assert!(lock.lock_path().exists());
  }

  #[test]
  fn metadata_is_written() {
    let temp = TempDir::new().unwrap();
    let lock = BuildLock::acquire(temp.path(), "vigil build").unwrap();
    let metadata = lock.read_metadata().unwrap();
    assert_eq!(metadata.version, 1);
    assert_eq!(metadata.command, "vigil build");
    assert_eq!(metadata.pid, std::process::id());
    assert_eq!(metadata.root, temp.path());
  }

  #[test]
  fn second_acquire_reports_contention_with_metadata() {
    let temp = TempDir::new().unwrap();
    let _held = BuildLock::acquire(temp.path(), "holder").unwrap();
    let err = match BuildLock::acquire(temp.path(), "intruder") {
      Ok(_) => panic!("second exclusive acquire unexpectedly succeeded"),
      Err(e) => e,
    };
    match err {
      LockError::Contention { command, pid, .. } => {
        assert_eq!(command, "holder");
        assert_eq!(pid, std::process::id());
      }
      other => panic!("expected contention, got {other:?}"),
    }
  }

  #[test]
  fn released_on_drop() {
    let temp = TempDir::new().unwrap();
    {
      let _lock = BuildLock::acquire(temp.path(), "first").unwrap();
    }
    let again = BuildLock::acquire(temp.path(), "second").unwrap();
    assert!(again.lock_path().exists());
  }
}
