//! Section-structured build log files.
//!
//! A log file is a flat sequence of sections. Each section starts with a
//! separator line `<mark> <name> # <timestamp>`; everything up to the
//! next separator (or end of file) is the section body. The mark is fixed
//! per file by the first separator ever written; readers also accept the
//! historical `--` mark. Section names are unique within a file, with
//! collisions disambiguated by a ` (N)` suffix.
//!
//! Invariant: the in-memory offset index always matches the bytes on
//! disk. Appends (new sections, command output) only ever grow the file,
//! so earlier offsets stay valid; `modify_section` rewrites the file via
//! write-new-then-rename and shifts the offsets of later sections by the
//! byte delta in the same step.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::debug;

/// Canonical separator mark written to new files.
pub const DEFAULT_MARK: &str = "==";
/// Marks accepted when reading, newest first.
pub const KNOWN_MARKS: [&str; 2] = ["==", "--"];
/// File name of the attempt log inside an attempt directory.
pub const LOG_FILENAME: &str = "log";

#[derive(Debug, Error)]
pub enum LogFileError {
  #[error("log file opened read-only: {0}")]
  ReadOnly(PathBuf),

  #[error("section not found: {0:?}")]
  SectionNotFound(String),

  #[error("io error: {0}")]
  Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
struct Section {
  name: String,
  /// Byte offset of the separator line's first byte.
  offset: u64,
}

/// One attempt's log file with its section index.
#[derive(Debug)]
pub struct LogFile {
  path: PathBuf,
  writable: bool,
  mark: String,
  sections: Vec<Section>,
}

/// Parses a separator line (without its trailing newline) for the given
/// mark, returning the section name.
pub fn parse_separator<'a>(line: &'a str, mark: &str) -> Option<&'a str> {
  let rest = line.strip_prefix(mark)?.strip_prefix(' ')?;
  let at = rest.rfind(" # ")?;
  let name = &rest[..at];
  if name.is_empty() { None } else { Some(name) }
}

/// Tries every known mark, returning `(mark, name)` on the first match.
pub fn detect_separator(line: &str) -> Option<(&'static str, &str)> {
  KNOWN_MARKS
    .iter()
    .find_map(|mark| parse_separator(line, mark).map(|name| (*mark, name)))
}

impl LogFile {
  /// Opens for append, creating the file if absent, or resumes an
  /// existing file (re-scanning its mark and section index).
  pub fn open_write(path: impl Into<PathBuf>) -> Result<Self, LogFileError> {
    let path = path.into();
    OpenOptions::new()
      .append(true)
      .create(true)
      .open(&path)?;
    let mut log = LogFile {
      path,
      writable: true,
      mark: DEFAULT_MARK.to_string(),
      sections: Vec::new(),
    };
    log.scan()?;
    Ok(log)
  }

  /// Opens an existing file read-only.
  pub fn open_read(path: impl Into<PathBuf>) -> Result<Self, LogFileError> {
    let path = path.into();
    let mut log = LogFile {
      path,
      writable: false,
      mark: DEFAULT_MARK.to_string(),
      sections: Vec::new(),
    };
    log.scan()?;
    Ok(log)
  }

  /// One pass over the file: detect the mark from the first separator
  /// and rebuild the name -> offset index.
  fn scan(&mut self) -> Result<(), LogFileError> {
    let bytes = fs::read(&self.path)?;
    let text = String::from_utf8_lossy(&bytes);
    self.sections.clear();
    let mut mark: Option<&str> = None;
    let mut offset = 0u64;
    for line in text.split_inclusive('\n') {
      let trimmed = line.strip_suffix('\n').unwrap_or(line);
      match mark {
        None => {
          if let Some((m, name)) = detect_separator(trimmed) {
            mark = Some(m);
            self.sections.push(Section { name: name.to_string(), offset });
          }
        }
        Some(m) => {
          if let Some(name) = parse_separator(trimmed, m) {
            self.sections.push(Section { name: name.to_string(), offset });
          }
        }
      }
      offset += line.len() as u64;
    }
    if let Some(m) = mark {
      self.mark = m.to_string();
    }
    debug!(path = %self.path.display(), sections = self.sections.len(), mark = %self.mark, "scanned log file");
    Ok(())
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn mark(&self) -> &str {
    &self.mark
  }

  pub fn section_names(&self) -> impl Iterator<Item = &str> {
    self.sections.iter().map(|s| s.name.as_str())
  }

  /// Raw append handle for redirecting command output into the current
  /// section. Offsets stay valid because appends only grow the file.
  pub fn append_handle(&self) -> Result<File, LogFileError> {
    if !self.writable {
      return Err(LogFileError::ReadOnly(self.path.clone()));
    }
    Ok(OpenOptions::new().append(true).open(&self.path)?)
  }

  fn position(&self, name: &str) -> Option<usize> {
    self.sections.iter().position(|s| s.name == name)
  }

  fn unique_name(&self, base: &str) -> String {
    let existing: HashSet<&str> = self.sections.iter().map(|s| s.name.as_str()).collect();
    if !existing.contains(base) {
      return base.to_string();
    }
    let mut n = 2;
    loop {
      let candidate = format!("{base} ({n})");
      if !existing.contains(candidate.as_str()) {
        return candidate;
      }
      n += 1;
    }
  }

  /// Starts a new section, returning the final (possibly disambiguated)
  /// name. Everything the caller appends until the next `start_section`
  /// belongs to this section.
  pub fn start_section(&mut self, name: &str) -> Result<String, LogFileError> {
    if !self.writable {
      return Err(LogFileError::ReadOnly(self.path.clone()));
    }
    let final_name = self.unique_name(name);
    let mut file = OpenOptions::new().read(true).append(true).open(&self.path)?;
    let len = file.metadata()?.len();
    let mut offset = len;
    if len > 0 {
      file.seek(SeekFrom::Start(len - 1))?;
      let mut last = [0u8; 1];
      file.read_exact(&mut last)?;
      if last[0] != b'\n' {
        file.write_all(b"\n")?;
        offset += 1;
      }
    }
    let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    writeln!(file, "{} {} # {}", self.mark, final_name, stamp)?;
    file.flush()?;
    self.sections.push(Section { name: final_name.clone(), offset });
    debug!(section = %final_name, offset, "started log section");
    Ok(final_name)
  }

  /// Byte range of a section's body: just past the separator line up to
  /// the next separator (or end of file).
  fn body_range(&self, index: usize, bytes: &[u8]) -> (usize, usize) {
    let offset = self.sections[index].offset as usize;
    let body_start = match bytes[offset..].iter().position(|&b| b == b'\n') {
      Some(nl) => offset + nl + 1,
      None => bytes.len(),
    };
    let body_end = match self.sections.get(index + 1) {
      Some(next) => next.offset as usize,
      None => bytes.len(),
    };
    (body_start, body_end)
  }

  /// Verbatim text strictly between this section's separator and the
  /// next one; `None` for unknown names.
  pub fn get_section(&self, name: &str) -> Result<Option<String>, LogFileError> {
    let Some(index) = self.position(name) else {
      return Ok(None);
    };
    let bytes = fs::read(&self.path)?;
    let (start, end) = self.body_range(index, &bytes);
    Ok(Some(String::from_utf8_lossy(&bytes[start..end]).into_owned()))
  }

  pub fn get_all_log(&self) -> Result<String, LogFileError> {
    let bytes = fs::read(&self.path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
  }

  /// Atomically replaces the body of an existing section in place,
  /// preserving every byte outside it. Offsets of all later sections are
  /// shifted by the exact byte delta.
  pub fn modify_section(&mut self, name: &str, new_text: &str) -> Result<(), LogFileError> {
    if !self.writable {
      return Err(LogFileError::ReadOnly(self.path.clone()));
    }
    let index = self
      .position(name)
      .ok_or_else(|| LogFileError::SectionNotFound(name.to_string()))?;
    let bytes = fs::read(&self.path)?;
    let (start, end) = self.body_range(index, &bytes);

    let mut replacement = new_text.as_bytes().to_vec();
    if !replacement.is_empty() && !replacement.ends_with(b"\n") {
      // A body without a trailing newline would glue the next separator
      // onto its last line.
      replacement.push(b'\n');
    }
    let delta = replacement.len() as i64 - (end - start) as i64;

    let mut out = Vec::with_capacity(bytes.len().saturating_add_signed(delta as isize));
    out.extend_from_slice(&bytes[..start]);
    out.extend_from_slice(&replacement);
    out.extend_from_slice(&bytes[end..]);

    let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&out)?;
    tmp.as_file().sync_all()?;
    tmp
      .persist(&self.path)
      .map_err(|e| LogFileError::Io(e.error))?;

    for section in &mut self.sections[index + 1..] {
      section.offset = section.offset.saturating_add_signed(delta);
    }
    debug!(section = %name, delta, "rewrote log section");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn append(log: &LogFile, text: &str) {
    let mut handle = log.append_handle().unwrap();
    handle.write_all(text.as_bytes()).unwrap();
  }

  #[test]
  fn section_roundtrip() {
    let temp = TempDir::new().unwrap();
    let mut log = LogFile::open_write(temp.path().join("log")).unwrap();
    let name = log.start_section("configure").unwrap();
    assert_eq!(name, "configure");
    append(&log, "checking for gcc... yes\n");
    log.start_section("make").unwrap();
    append(&log, "CC main.c\n");

    assert_eq!(
      log.get_section("configure").unwrap().unwrap(),
      "checking for gcc... yes\n"
    );
    assert_eq!(log.get_section("make").unwrap().unwrap(), "CC main.c\n");
    assert_eq!(log.get_section("install").unwrap(), None);
  }

  #[test]
  fn colliding_names_get_numeric_suffixes() {
    let temp = TempDir::new().unwrap();
    let mut log = LogFile::open_write(temp.path().join("log")).unwrap();
    let mut names = Vec::new();
    for _ in 0..4 {
      names.push(log.start_section("test").unwrap());
    }
    assert_eq!(names, vec!["test", "test (2)", "test (3)", "test (4)"]);
  }

  #[test]
  fn separator_written_on_its_own_line() {
    // Command output rarely ends in a newline when a build is killed;
    // the next separator must still start a fresh line.
    let temp = TempDir::new().unwrap();
    let mut log = LogFile::open_write(temp.path().join("log")).unwrap();
    log.start_section("first").unwrap();
    append(&log, "no trailing newline");
    log.start_section("second").unwrap();

    assert_eq!(
      log.get_section("first").unwrap().unwrap(),
      "no trailing newline\n"
    );
    assert_eq!(log.get_section("second").unwrap().unwrap(), "");
  }

  #[test]
  fn resume_existing_file_keeps_index_and_collisions() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("log");
    {
      let mut log = LogFile::open_write(&path).unwrap();
      log.start_section("build").unwrap();
      append(&log, "round one\n");
    }
    let mut log = LogFile::open_write(&path).unwrap();
    let name = log.start_section("build").unwrap();
    assert_eq!(name, "build (2)");
    assert_eq!(log.get_section("build").unwrap().unwrap(), "round one\n");
  }

  #[test]
  fn legacy_mark_detected_and_reused() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("log");
    fs::write(&path, "-- old-section # 2015-04-01T00:00:00Z\nancient output\n").unwrap();

    let mut log = LogFile::open_write(&path).unwrap();
    assert_eq!(log.mark(), "--");
    assert_eq!(
      log.get_section("old-section").unwrap().unwrap(),
      "ancient output\n"
    );

    log.start_section("new-section").unwrap();
    let text = log.get_all_log().unwrap();
    assert!(text.contains("\n-- new-section # "));
  }

  #[test]
  fn modify_section_preserves_everything_else() {
    let temp = TempDir::new().unwrap();
    let mut log = LogFile::open_write(temp.path().join("log")).unwrap();
    log.start_section("a").unwrap();
    append(&log, "alpha body\n");
    log.start_section("b").unwrap();
    append(&log, "beta body line 1\nbeta body line 2\n");
    log.start_section("c").unwrap();
    append(&log, "gamma body\n");

    let before_a = log.get_section("a").unwrap().unwrap();
    let before_c = log.get_section("c").unwrap().unwrap();

    log.modify_section("b", "rewritten\n").unwrap();

    assert_eq!(log.get_section("b").unwrap().unwrap(), "rewritten\n");
    assert_eq!(log.get_section("a").unwrap().unwrap(), before_a);
    assert_eq!(log.get_section("c").unwrap().unwrap(), before_c);
  }

  #[test]
  fn modify_section_shifts_offsets_both_directions() {
    let temp = TempDir::new().unwrap();
    let mut log = LogFile::open_write(temp.path().join("log")).unwrap();
    log.start_section("head").unwrap();
    append(&log, "short\n");
    log.start_section("tail").unwrap();
    append(&log, "tail body\n");

    // Grow.
    log
      .modify_section("head", "a much longer body than before\n")
      .unwrap();
    assert_eq!(log.get_section("tail").unwrap().unwrap(), "tail body\n");

    // Shrink.
    log.modify_section("head", "x\n").unwrap();
    assert_eq!(log.get_section("tail").unwrap().unwrap(), "tail body\n");
    assert_eq!(log.get_section("head").unwrap().unwrap(), "x\n");
  }

  #[test]
  fn modify_unknown_section_fails() {
    let temp = TempDir::new().unwrap();
    let mut log = LogFile::open_write(temp.path().join("log")).unwrap();
    log.start_section("only").unwrap();
    let err = log.modify_section("missing", "text\n").unwrap_err();
    assert!(matches!(err, LogFileError::SectionNotFound(_)));
  }

  #[test]
  fn read_only_rejects_writes() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("log");
    {
      let mut log = LogFile::open_write(&path).unwrap();
      log.start_section("s").unwrap();
    }
    let mut log = LogFile::open_read(&path).unwrap();
    assert!(matches!(
      log.start_section("t"),
      Err(LogFileError::ReadOnly(_))
    ));
    assert!(matches!(
      log.modify_section("s", "x"),
      Err(LogFileError::ReadOnly(_))
    ));
  }

  #[test]
  fn separator_name_may_contain_spaces() {
    assert_eq!(
      parse_separator("== ruby (2) # 2024-01-01T00:00:00Z", "=="),
      Some("ruby (2)")
    );
    assert_eq!(parse_separator("== # 2024-01-01T00:00:00Z", "=="), None);
    assert_eq!(parse_separator("--- a/file.c", "--"), None);
  }
}
