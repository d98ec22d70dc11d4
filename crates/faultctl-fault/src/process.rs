//! Target process introspection and signalling.
//!
//! The timeout controller only needs two things from the OS: the
//! scheduling state of the target, and a way to send it `SIGCONT`.
//! [`ProcessControl`] captures that seam; [`Procfs`] is the Linux
//! implementation on top of `/proc/<pid>/stat` and `kill(2)`.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from reading or signalling the target.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The target no longer exists (stat file gone, or `ESRCH`).
    #[error("process {0} not found")]
    Gone(u32),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed stat line for process {pid}: {line:?}")]
    Malformed { pid: u32, line: String },

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Process scheduling state, the third field of `/proc/<pid>/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedState {
    Running,
    Sleeping,
    DiskSleep,
    /// Job-control stop (`SIGSTOP`), state `T`.
    Stopped,
    /// Stopped by a debugger, state `t`.
    TracingStop,
    Zombie,
    Dead,
    Idle,
    Other(char),
}

impl SchedState {
    pub fn from_code(code: char) -> Self {
        match code {
            'R' => SchedState::Running,
            'S' => SchedState::Sleeping,
            'D' => SchedState::DiskSleep,
            'T' => SchedState::Stopped,
            't' => SchedState::TracingStop,
            'Z' => SchedState::Zombie,
            'X' | 'x' => SchedState::Dead,
            'I' => SchedState::Idle,
            other => SchedState::Other(other),
        }
    }

    pub fn code(&self) -> char {
        match self {
            SchedState::Running => 'R',
            SchedState::Sleeping => 'S',
            SchedState::DiskSleep => 'D',
            SchedState::Stopped => 'T',
            SchedState::TracingStop => 't',
            SchedState::Zombie => 'Z',
            SchedState::Dead => 'X',
            SchedState::Idle => 'I',
            SchedState::Other(c) => *c,
        }
    }

    /// The state a probe handler's `SIGSTOP` puts the target in.
    ///
    /// Only job-control stops count: `SIGCONT` does not release a
    /// debugger stop.
    pub fn is_stopped(&self) -> bool {
        matches!(self, SchedState::Stopped)
    }

    /// The process has exited and can never be resumed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SchedState::Zombie | SchedState::Dead)
    }
}

impl fmt::Display for SchedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedState::Running => "running",
            SchedState::Sleeping => "sleeping",
            SchedState::DiskSleep => "disk-sleep",
            SchedState::Stopped => "stopped",
            SchedState::TracingStop => "tracing-stop",
            SchedState::Zombie => "zombie",
            SchedState::Dead => "dead",
            SchedState::Idle => "idle",
            SchedState::Other(_) => "other",
        };
        write!(f, "{name}({})", self.code())
    }
}

/// OS operations the timeout controller depends on.
pub trait ProcessControl {
    /// Current scheduling state of `pid`.  [`ProcessError::Gone`] once
    /// the process has disappeared.
    fn state(&mut self, pid: u32) -> Result<SchedState, ProcessError>;

    /// Send `SIGCONT` to `pid`.  [`ProcessError::Gone`] if it no longer
    /// exists.
    fn resume(&mut self, pid: u32) -> Result<(), ProcessError>;
}

/// Extract the state code from a `/proc/<pid>/stat` line.
///
/// The command name is wrapped in parentheses and may itself contain
/// spaces or parentheses, so the state is located after the last `)`.
pub fn parse_stat_state(pid: u32, line: &str) -> Result<SchedState, ProcessError> {
    line.rfind(')')
        .and_then(|end| line[end + 1..].split_whitespace().next())
        .and_then(|field| {
            let mut chars = field.chars();
            match (chars.next(), chars.next()) {
                (Some(code), None) => Some(SchedState::from_code(code)),
                _ => None,
            }
        })
        .ok_or_else(|| ProcessError::Malformed {
            pid,
            line: line.to_string(),
        })
}

/// `/proc` + `kill(2)` implementation of [`ProcessControl`].
#[derive(Debug, Clone)]
pub struct Procfs {
    root: PathBuf,
}

impl Procfs {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read stat files below `root` instead of `/proc`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stat_path(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string()).join("stat")
    }

    /// Whether `pid` currently has a stat file.
    pub fn exists(&self, pid: u32) -> bool {
        self.stat_path(pid).exists()
    }
}

impl Default for Procfs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessControl for Procfs {
    fn state(&mut self, pid: u32) -> Result<SchedState, ProcessError> {
        let path = self.stat_path(pid);
        let line = match std::fs::read_to_string(&path) {
            Ok(line) => line,
            // ESRCH shows up when the process exits between open and read.
            Err(e) if e.kind() == io::ErrorKind::NotFound || e.raw_os_error() == Some(libc::ESRCH) => {
                return Err(ProcessError::Gone(pid))
            }
            Err(source) => return Err(ProcessError::Read { path, source }),
        };
        parse_stat_state(pid, &line)
    }

    fn resume(&mut self, pid: u32) -> Result<(), ProcessError> {
        send_signal(pid, libc::SIGCONT)
    }
}

/// Deliver `signal` to `pid`.
pub fn send_signal(pid: u32, signal: libc::c_int) -> Result<(), ProcessError> {
    let raw = libc::pid_t::try_from(pid).map_err(|_| ProcessError::Gone(pid))?;
    if unsafe { libc::kill(raw, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Err(ProcessError::Gone(pid))
    } else {
        Err(ProcessError::Signal { pid, source: err })
    }
}

/// Whether `pid` names a live process (signal 0 probe).
///
/// A process we may not signal (`EPERM`) still exists.  Pid 0 is never
/// a valid target.
pub fn is_alive(pid: u32) -> bool {
    pid != 0 && !matches!(send_signal(pid, 0), Err(ProcessError::Gone(_)))
}
