//! Runs one external command under a deadline, resource limits and an
//! escalating process-group termination sequence.
//!
//! The child is placed in its own process group so the whole group,
//! including grandchildren, can be signaled as a unit. On deadline expiry
//! the group gets SIGINT, then SIGTERM, then SIGKILL; between steps the
//! group is probed with a zero signal over an increasing backoff until
//! the grace budget is spent. SIGINT/SIGTERM delivered to the supervisor
//! itself are forwarded to the active group.

pub mod options;

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Once;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant, SystemTime};

use nix::errno::Errno;
use nix::sys::resource::{Resource, setrlimit};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, killpg, sigaction};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use options::{OptionsError, ResourceLimits, RunOptions};

#[derive(Debug, Error)]
pub enum SupervisorError {
  #[error("i/o error: {0}")]
  Io(#[from] io::Error),
  #[error("system call failed: {0}")]
  Sys(#[from] Errno),
}

/// Terminal state of a supervised command. The failure shapes are
/// deliberately distinct: callers react differently to each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
  /// Normal exit with the given status code.
  Exited(i32),
  /// Terminated by a signal it did not survive.
  Signaled(Signal),
  /// Stopped by a signal (SIGSTOP, SIGTSTP, ...). The group is killed
  /// once the stop is observed; a suspended build never resumes.
  Stopped(Signal),
  /// Deadline or output-interval expiry; carries the escalation signal
  /// that finally ended the group, `None` when the group was already
  /// gone (or nothing was ever spawned).
  TimedOut { signal: Option<Signal> },
  /// Executable not found and every fallback exhausted.
  NotFound,
}

impl ProcessResult {
  pub fn success(&self) -> bool {
    matches!(self, ProcessResult::Exited(0))
  }
}

/// Poll interval of the wait loop.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// First probe delay after signaling; doubles each probe.
const PROBE_BASE: Duration = Duration::from_millis(100);

/// Runs `command args...` with stdout and stderr appended to the file at
/// `output`, under the constraints in `opts`.
///
/// When the executable is missing, each entry of `opts.fallbacks` is
/// substituted for the command name and the whole invocation retried.
pub fn run(
  command: &str,
  args: &[String],
  output: &Path,
  opts: &RunOptions,
) -> Result<ProcessResult, SupervisorError> {
  let start = SystemTime::now();
  let deadline = opts.effective_deadline(start);
  if let Some(deadline) = deadline
    && deadline <= start
  {
    debug!(command, "deadline already expired, not spawning");
    return Ok(ProcessResult::TimedOut { signal: None });
  }

  let mut candidates = vec![command.to_string()];
  candidates.extend(opts.fallbacks.iter().cloned());

  for (i, candidate) in candidates.iter().enumerate() {
    match spawn(candidate, args, output, opts) {
      Ok(child) => return supervise(child, output, deadline, opts),
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        if i + 1 < candidates.len() {
          warn!(command = %candidate, next = %candidates[i + 1], "command not found, trying fallback");
        }
      }
      Err(e) => return Err(e.into()),
    }
  }
  warn!(command, "command not found and fallbacks exhausted");
  Ok(ProcessResult::NotFound)
}

fn spawn(command: &str, args: &[String], output: &Path, opts: &RunOptions) -> io::Result<Child> {
  let log = OpenOptions::new().create(true).append(true).open(output)?;
  let stderr_log = log.try_clone()?;
  let limits = opts.limits.clone();

  let mut cmd = Command::new(command);
  cmd
    .args(args)
    .stdin(Stdio::null())
    .stdout(Stdio::from(log))
    .stderr(Stdio::from(stderr_log))
    .envs(&opts.env);
  if let Some(cwd) = &opts.cwd {
    cmd.current_dir(cwd);
  }
  unsafe {
    use std::os::unix::process::CommandExt;
    cmd.pre_exec(move || {
      // New group, so killpg reaches everything the command spawns.
      if libc::setpgid(0, 0) != 0 {
        return Err(io::Error::last_os_error());
      }
      apply_limits(&limits).map_err(io::Error::from)
    });
  }
  cmd.spawn()
}

fn apply_limits(limits: &ResourceLimits) -> Result<(), Errno> {
  if let Some(cpu) = limits.cpu_seconds {
    setrlimit(Resource::RLIMIT_CPU, cpu, cpu)?;
  }
  if let Some(stack) = limits.stack_bytes {
    setrlimit(Resource::RLIMIT_STACK, stack, stack)?;
  }
  if let Some(data) = limits.data_bytes {
    setrlimit(Resource::RLIMIT_DATA, data, data)?;
  }
  if let Some(space) = limits.address_space_bytes {
    setrlimit(Resource::RLIMIT_AS, space, space)?;
  }
  if let Some(core) = limits.core_dumps {
    let limit = if core { nix::sys::resource::RLIM_INFINITY } else { 0 };
    setrlimit(Resource::RLIMIT_CORE, limit, limit)?;
  }
  Ok(())
}

fn supervise(
  child: Child,
  output: &Path,
  deadline: Option<SystemTime>,
  opts: &RunOptions,
) -> Result<ProcessResult, SupervisorError> {
  // The child is its own group leader, so its pid doubles as the pgid.
  // All reaping goes through waitpid rather than the std Child handle:
  // WUNTRACED is needed to observe stops, and the termination probes
  // must be able to reap mid-escalation.
  let pgid = Pid::from_raw(child.id() as i32);
  install_forwarding_handler();
  ACTIVE_PGID.store(pgid.as_raw(), Ordering::SeqCst);
  let _guard = PgidGuard;

  let mut watch = opts.output_interval.map(|interval| OutputWatch::new(output, interval));

  loop {
    match waitpid(pgid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED))? {
      WaitStatus::StillAlive => {}
      WaitStatus::Exited(_, code) => {
        // Stragglers in the group do not outlive the command.
        let _ = killpg(pgid, Signal::SIGKILL);
        return Ok(ProcessResult::Exited(code));
      }
      WaitStatus::Signaled(_, signal, _) => {
        let _ = killpg(pgid, Signal::SIGKILL);
        return Ok(ProcessResult::Signaled(signal));
      }
      WaitStatus::Stopped(_, signal) => {
        warn!(pgid = pgid.as_raw(), ?signal, "command stopped, killing its group");
        let _ = killpg(pgid, Signal::SIGKILL);
        let _ = waitpid(pgid, None);
        return Ok(ProcessResult::Stopped(signal));
      }
      _ => {}
    }

    let expired = deadline.is_some_and(|d| SystemTime::now() >= d);
    let hung = watch.as_mut().is_some_and(|w| w.is_hung());
    if expired || hung {
      if hung {
        warn!(pgid = pgid.as_raw(), "no output within interval, treating as hung");
      } else {
        warn!(pgid = pgid.as_raw(), "deadline exceeded");
      }
      let signal = terminate_group(pgid, opts.kill_grace);
      // A probe usually reaped the child already; ECHILD here is fine.
      let _ = waitpid(pgid, None);
      return Ok(ProcessResult::TimedOut { signal });
    }

    std::thread::sleep(POLL_INTERVAL);
  }
}

/// Escalates SIGINT, SIGTERM, SIGKILL against the group, probing with a
/// zero signal between steps. Returns the signal that ended the group,
/// or `None` when it was already gone before the first send.
fn terminate_group(pgid: Pid, grace: Duration) -> Option<Signal> {
  for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGKILL] {
    match killpg(pgid, signal) {
      Ok(()) => info!(pgid = pgid.as_raw(), ?signal, "signaling process group"),
      Err(Errno::ESRCH) => {
        debug!(pgid = pgid.as_raw(), "process group already gone");
        return None;
      }
      Err(e) => {
        warn!(pgid = pgid.as_raw(), ?signal, error = %e, "killpg failed");
        continue;
      }
    }
    if wait_for_exit(pgid, grace) {
      return Some(signal);
    }
  }
  // SIGKILL cannot be caught; the group is as dead as it will get.
  Some(Signal::SIGKILL)
}

/// Probes the group over an increasing backoff within `grace`. True when
/// the group disappeared.
fn wait_for_exit(pgid: Pid, grace: Duration) -> bool {
  let mut delay = PROBE_BASE;
  let mut spent = Duration::ZERO;
  while spent < grace {
    std::thread::sleep(delay);
    spent += delay;
    delay *= 2;
    if !probe_group(pgid) {
      return true;
    }
  }
  !probe_group(pgid)
}

/// Zero-signal liveness probe. True while any member remains.
///
/// The direct child is reaped first: left as a zombie it would keep the
/// group addressable and the probe could never report it gone.
fn probe_group(pgid: Pid) -> bool {
  let _ = waitpid(pgid, Some(WaitPidFlag::WNOHANG));
  !matches!(killpg(pgid, None), Err(Errno::ESRCH))
}

/// Detects a hung command by watching the output file stop growing.
struct OutputWatch {
  path: PathBuf,
  interval: Duration,
  last_len: u64,
  last_growth: Instant,
}

impl OutputWatch {
  fn new(path: &Path, interval: Duration) -> Self {
    OutputWatch {
      path: path.to_path_buf(),
      interval,
      last_len: 0,
      last_growth: Instant::now(),
    }
  }

  fn is_hung(&mut self) -> bool {
    let len = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
    if len != self.last_len {
      self.last_len = len;
      self.last_growth = Instant::now();
    }
    self.last_growth.elapsed() >= self.interval
  }
}

static ACTIVE_PGID: AtomicI32 = AtomicI32::new(0);
static INSTALL_HANDLER: Once = Once::new();

struct PgidGuard;

impl Drop for PgidGuard {
  fn drop(&mut self) {
    ACTIVE_PGID.store(0, Ordering::SeqCst);
  }
}

extern "C" fn forward_signal(sig: libc::c_int) {
  let pgid = ACTIVE_PGID.load(Ordering::SeqCst);
  if pgid > 0 {
    unsafe {
      libc::kill(-pgid, sig);
    }
  }
}

/// SIGINT/SIGTERM received by the supervisor are passed on to the active
/// group so an operator interrupt stops the build, not just the monitor.
fn install_forwarding_handler() {
  INSTALL_HANDLER.call_once(|| {
    let action = SigAction::new(
      SigHandler::Handler(forward_signal),
      SaFlags::SA_RESTART,
      SigSet::empty(),
    );
    unsafe {
      if let Err(e) = sigaction(Signal::SIGINT, &action) {
        warn!(error = %e, "cannot install SIGINT forwarder");
      }
      if let Err(e) = sigaction(Signal::SIGTERM, &action) {
        warn!(error = %e, "cannot install SIGTERM forwarder");
      }
    }
  });
}
