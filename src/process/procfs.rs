//! Linux binding of [`ProcessControl`] over `/proc` and signals.
use super::{lowest_pid, ProcessControl, ProcessError, ProcessId};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

const PROC_ROOT: &str = "/proc";

/// The kernel truncates `comm` to this many bytes.
const COMM_LEN: usize = 15;

/// How often `wait_for_exit` re-checks a process the watchdog did not spawn.
const EXIT_POLL: Duration = Duration::from_millis(50);

/// Fields of `/proc/<pid>/stat` the watchdog cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatLine {
    state: char,
    start_ticks: u64,
}

impl StatLine {
    /// Zombie or dead: the pid still shows up but the process is finished.
    fn is_finished(&self) -> bool {
        matches!(self.state, 'Z' | 'X' | 'x')
    }
}

/// Parse the state and start time out of a `stat` line.
///
/// `comm` sits in parentheses and may itself contain spaces or parentheses,
/// so fields are counted from the last `)`.
fn parse_stat(content: &str) -> Option<StatLine> {
    let close = content.rfind(')')?;
    let fields: Vec<&str> = content[close + 1..].split_whitespace().collect();
    // field 3 (state) is index 0 here, field 22 (starttime) is index 19
    let state = fields.first()?.chars().next()?;
    let start_ticks = fields.get(19)?.parse().ok()?;
    Some(StatLine { state, start_ticks })
}

/// Start time of `pid` under a procfs root, if it is alive and not a zombie.
pub fn live_start_ticks(proc_root: &Path, pid: u32) -> Option<u64> {
    let content = std::fs::read_to_string(proc_root.join(pid.to_string()).join("stat")).ok()?;
    parse_stat(&content)
        .filter(|stat| !stat.is_finished())
        .map(|stat| stat.start_ticks)
}

/// Extract `VmRSS` from `/proc/<pid>/status`, in bytes.
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let mut parts = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = parts.next()?.parse().ok()?;
    match parts.next() {
        Some("kB") | None => Some(value * 1024),
        Some(_) => None,
    }
}

/// Does a process with this `comm` (and lazily fetched `argv[0]`) match `name`?
fn name_matches(name: &str, comm: &str, argv0: impl FnOnce() -> Option<String>) -> bool {
    if name.len() <= COMM_LEN {
        return comm == name;
    }
    if comm.as_bytes() != &name.as_bytes()[..COMM_LEN] {
        return false;
    }
    argv0()
        .as_deref()
        .and_then(|arg| Path::new(arg).file_name())
        .is_some_and(|base| base == name)
}

/// `/proc`-backed process table.
///
/// Children launched through [`ProcessControl::spawn`] are kept so they can be
/// reaped; otherwise every restarted instance that later exits would linger as
/// a zombie for the watchdog's lifetime.
pub struct ProcfsProcesses {
    root: PathBuf,
    own_pid: u32,
    children: Vec<(ProcessId, Child)>,
}

impl ProcfsProcesses {
    pub fn new() -> Self {
        Self::with_root(PROC_ROOT)
    }

    /// Read process information from another procfs mount (tests use a
    /// plain directory tree).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            own_pid: std::process::id(),
            children: Vec::new(),
        }
    }

    fn proc_file(&self, pid: u32, file: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(file)
    }

    fn read_stat(&self, pid: u32) -> Option<StatLine> {
        let content = std::fs::read_to_string(self.proc_file(pid, "stat")).ok()?;
        parse_stat(&content)
    }

    fn read_argv0(&self, pid: u32) -> Option<String> {
        let raw = std::fs::read(self.proc_file(pid, "cmdline")).ok()?;
        let first = raw.split(|b| *b == 0).next()?;
        Some(String::from_utf8_lossy(first).into_owned())
    }

    /// Identity of a live pid, or `None` if it is gone or finished.
    pub fn identify(&self, pid: u32) -> Option<ProcessId> {
        live_start_ticks(&self.root, pid).map(|start_ticks| ProcessId::new(pid, start_ticks))
    }

    /// Collect exit statuses of spawned children that have finished.
    fn reap_children(&mut self) {
        self.children.retain_mut(|(id, child)| match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid = id.pid(), %status, "reaped spawned instance");
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(pid = id.pid(), error = %e, "failed to poll spawned instance");
                true
            }
        });
    }
}

impl Default for ProcfsProcesses {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessControl for ProcfsProcesses {
    fn find_by_name(&mut self, name: &str) -> Result<Option<ProcessId>, ProcessError> {
        self.reap_children();

        let entries = std::fs::read_dir(&self.root).map_err(|e| ProcessError::Io {
            path: self.root.clone(),
            source: e,
        })?;

        let mut candidates = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            if pid == self.own_pid {
                continue;
            }
            // The process may vanish between readdir and here; just skip it.
            let Ok(comm) = std::fs::read_to_string(self.proc_file(pid, "comm")) else {
                continue;
            };
            if !name_matches(name, comm.trim_end_matches('\n'), || self.read_argv0(pid)) {
                continue;
            }
            if let Some(id) = self.identify(pid) {
                candidates.push(id);
            }
        }

        let found = lowest_pid(candidates.iter().copied());
        if candidates.len() > 1 {
            tracing::debug!(
                count = candidates.len(),
                chosen = ?found.map(|id| id.pid()),
                "multiple processes match, using lowest pid"
            );
        }
        Ok(found)
    }

    fn resident_memory_bytes(&mut self, id: ProcessId) -> Result<u64, ProcessError> {
        let path = self.proc_file(id.pid(), "status");
        let status = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e)
                if e.kind() == std::io::ErrorKind::NotFound
                    || e.raw_os_error() == Some(Errno::ESRCH as i32) =>
            {
                return Err(ProcessError::Gone { pid: id.pid() });
            }
            Err(e) => return Err(ProcessError::Io { path, source: e }),
        };
        // Zombies and kernel threads have no VmRSS line.
        parse_vm_rss(&status).ok_or(ProcessError::Gone { pid: id.pid() })
    }

    fn has_exited(&mut self, id: ProcessId) -> bool {
        if let Some(pos) = self.children.iter().position(|(cid, _)| cid.pid() == id.pid()) {
            match self.children[pos].1.try_wait() {
                Ok(Some(_)) => {
                    self.children.remove(pos);
                    return true;
                }
                Ok(None) => return false,
                Err(_) => {}
            }
        }
        match self.read_stat(id.pid()) {
            Some(stat) => stat.start_ticks != id.start_ticks() || stat.is_finished(),
            None => true,
        }
    }

    fn kill(&mut self, id: ProcessId) -> Result<(), ProcessError> {
        if self.has_exited(id) {
            // Never signal a pid that may already belong to another process.
            return Ok(());
        }
        let raw = i32::try_from(id.pid()).map_err(|_| ProcessError::Gone { pid: id.pid() })?;
        match kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ProcessError::Signal {
                pid: id.pid(),
                source: e,
            }),
        }
    }

    fn wait_for_exit(&mut self, id: ProcessId) -> Result<(), ProcessError> {
        if let Some(pos) = self.children.iter().position(|(cid, _)| cid.pid() == id.pid()) {
            let (_, mut child) = self.children.remove(pos);
            child.wait().map_err(|e| ProcessError::Io {
                path: self.proc_file(id.pid(), "stat"),
                source: e,
            })?;
            return Ok(());
        }
        while !self.has_exited(id) {
            std::thread::sleep(EXIT_POLL);
        }
        Ok(())
    }

    fn spawn(&mut self, path: &Path) -> Result<ProcessId, ProcessError> {
        let child = Command::new(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0) // keep terminal signals aimed at the watchdog away from it
            .spawn()
            .map_err(|e| ProcessError::LaunchFailed {
                path: path.to_path_buf(),
                source: e,
            })?;

        let pid = child.id();
        let start_ticks = self.read_stat(pid).map(|s| s.start_ticks).unwrap_or(0);
        let id = ProcessId::new(pid, start_ticks);
        tracing::info!(pid, path = %path.display(), "spawned new instance");
        self.children.push((id, child));
        Ok(id)
    }
}
