//! Platform-neutral view of a live OS process.
//!
//! The monitor loop only talks to [`ProcessControl`]; the Linux binding lives
//! in [`procfs`].

pub mod procfs;

use std::path::{Path, PathBuf};

/// Identity of one process instance.
///
/// The pid alone is not enough once the kernel starts recycling pids, so the
/// start time (in clock ticks since boot) is carried alongside it. Two ids are
/// the same instance only if both fields match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId {
    pid: u32,
    start_ticks: u64,
}

impl ProcessId {
    pub fn new(pid: u32, start_ticks: u64) -> Self {
        Self { pid, start_ticks }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn start_ticks(&self) -> u64 {
        self.start_ticks
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.pid)
    }
}

/// Operations the monitor needs over running processes.
///
/// Every call may block briefly on the OS. None of them time out.
pub trait ProcessControl: Send {
    /// First running process named `name`, or `None`. When several match, the
    /// one with the lowest pid wins.
    fn find_by_name(&mut self, name: &str) -> Result<Option<ProcessId>, ProcessError>;

    /// Current resident set size in bytes. Always a fresh read.
    fn resident_memory_bytes(&mut self, id: ProcessId) -> Result<u64, ProcessError>;

    fn has_exited(&mut self, id: ProcessId) -> bool;

    /// Request immediate termination. Does not wait.
    fn kill(&mut self, id: ProcessId) -> Result<(), ProcessError>;

    /// Block until the process is fully gone.
    fn wait_for_exit(&mut self, id: ProcessId) -> Result<(), ProcessError>;

    /// Launch a new instance from `path` with no arguments.
    fn spawn(&mut self, path: &Path) -> Result<ProcessId, ProcessError>;
}

/// Pick the candidate with the lowest pid.
pub fn lowest_pid(candidates: impl IntoIterator<Item = ProcessId>) -> Option<ProcessId> {
    candidates.into_iter().min_by_key(|id| id.pid())
}

/// Errors from process operations.
#[derive(Debug)]
pub enum ProcessError {
    /// The process no longer exists (or its pid now belongs to someone else).
    Gone { pid: u32 },
    /// Launching a new instance failed.
    LaunchFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Sending a signal failed for a reason other than the process being gone.
    Signal { pid: u32, source: nix::Error },
    /// Reading process information failed.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Gone { pid } => write!(f, "process {} has exited", pid),
            ProcessError::LaunchFailed { path, source } => {
                write!(f, "failed to launch {}: {}", path.display(), source)
            }
            ProcessError::Signal { pid, source } => {
                write!(f, "failed to signal process {}: {}", pid, source)
            }
            ProcessError::Io { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Gone { .. } => None,
            ProcessError::LaunchFailed { source, .. } => Some(source),
            ProcessError::Signal { source, .. } => Some(source),
            ProcessError::Io { source, .. } => Some(source),
        }
    }
}
