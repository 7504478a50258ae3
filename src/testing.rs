//! In-memory stand-ins for the process table, the limiter and the sinks.
use crate::limiter::{LimitError, ResourceLimiter};
use crate::process::{ProcessControl, ProcessError, ProcessId};
use crate::sinks::{EventSink, NotificationSink, Severity};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const MIB: u64 = 1024 * 1024;

/// Poll `cond` until it holds, failing the test after five seconds.
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met within 5s");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Find,
    Read(u32),
    Kill(u32),
    Wait(u32),
    Spawn,
}

struct FakeProc {
    name: String,
    readings: VecDeque<u64>,
    last: u64,
    exited: bool,
    exit_after_reads: Option<usize>,
    reads: usize,
}

struct FakeTable {
    procs: BTreeMap<u32, FakeProc>,
    next_pid: u32,
    spawn_name: String,
    spawn_readings: Vec<u64>,
    spawn_fails: bool,
    panic_on_read: bool,
    read_fails: bool,
    kill_refused: bool,
    calls: Vec<(Call, Instant)>,
}

impl FakeTable {
    fn record(&mut self, call: Call) {
        self.calls.push((call, Instant::now()));
    }
}

/// Scripted process table. Spawned instances get pids from 1000 upwards.
#[derive(Clone)]
pub struct FakeProcesses {
    table: Arc<Mutex<FakeTable>>,
}

impl FakeProcesses {
    pub fn new(spawn_name: &str) -> Self {
        Self {
            table: Arc::new(Mutex::new(FakeTable {
                procs: BTreeMap::new(),
                next_pid: 1000,
                spawn_name: spawn_name.to_string(),
                spawn_readings: vec![0],
                spawn_fails: false,
                panic_on_read: false,
                read_fails: false,
                kill_refused: false,
                calls: Vec::new(),
            })),
        }
    }

    /// Add a running process whose successive memory reads return `readings`
    /// (the last value repeats).
    pub fn add(&self, pid: u32, name: &str, readings: &[u64]) {
        lock(&self.table).procs.insert(
            pid,
            FakeProc {
                name: name.to_string(),
                readings: readings.iter().copied().collect(),
                last: 0,
                exited: false,
                exit_after_reads: None,
                reads: 0,
            },
        );
    }

    /// Make `pid` exit on its own right after its `reads`-th memory read.
    pub fn exit_after(&self, pid: u32, reads: usize) {
        if let Some(p) = lock(&self.table).procs.get_mut(&pid) {
            p.exit_after_reads = Some(reads);
        }
    }

    pub fn set_spawn_readings(&self, readings: &[u64]) {
        lock(&self.table).spawn_readings = readings.to_vec();
    }

    pub fn set_spawn_fails(&self, fails: bool) {
        lock(&self.table).spawn_fails = fails;
    }

    pub fn set_panic_on_read(&self, panic: bool) {
        lock(&self.table).panic_on_read = panic;
    }

    /// Memory reads fail with an I/O error other than "gone".
    pub fn set_read_fails(&self, fails: bool) {
        lock(&self.table).read_fails = fails;
    }

    /// `kill` is refused by the OS (EPERM).
    pub fn set_kill_refused(&self, refused: bool) {
        lock(&self.table).kill_refused = refused;
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.table).calls.iter().map(|(c, _)| c.clone()).collect()
    }

    /// Calls with the instant each one was made.
    pub fn timed_calls(&self) -> Vec<(Call, Instant)> {
        lock(&self.table).calls.clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        lock(&self.table)
            .calls
            .iter()
            .filter(|(c, _)| c == call)
            .count()
    }
}

impl ProcessControl for FakeProcesses {
    fn find_by_name(&mut self, name: &str) -> Result<Option<ProcessId>, ProcessError> {
        let mut table = lock(&self.table);
        table.record(Call::Find);
        Ok(table
            .procs
            .iter()
            .find(|(_, p)| p.name == name && !p.exited)
            .map(|(pid, _)| ProcessId::new(*pid, 0)))
    }

    fn resident_memory_bytes(&mut self, id: ProcessId) -> Result<u64, ProcessError> {
        let mut table = lock(&self.table);
        table.record(Call::Read(id.pid()));
        if table.panic_on_read {
            drop(table);
            panic!("scripted read failure");
        }
        if table.read_fails {
            return Err(ProcessError::Io {
                path: PathBuf::from(format!("/proc/{}/status", id.pid())),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }
        let proc = table
            .procs
            .get_mut(&id.pid())
            .filter(|p| !p.exited)
            .ok_or(ProcessError::Gone { pid: id.pid() })?;
        let value = proc.readings.pop_front().unwrap_or(proc.last);
        proc.last = value;
        proc.reads += 1;
        if proc.exit_after_reads == Some(proc.reads) {
            proc.exited = true;
        }
        Ok(value)
    }

    fn has_exited(&mut self, id: ProcessId) -> bool {
        lock(&self.table)
            .procs
            .get(&id.pid())
            .map_or(true, |p| p.exited)
    }

    fn kill(&mut self, id: ProcessId) -> Result<(), ProcessError> {
        let mut table = lock(&self.table);
        table.record(Call::Kill(id.pid()));
        if table.kill_refused {
            return Err(ProcessError::Signal {
                pid: id.pid(),
                source: nix::errno::Errno::EPERM,
            });
        }
        if let Some(p) = table.procs.get_mut(&id.pid()) {
            p.exited = true;
        }
        Ok(())
    }

    fn wait_for_exit(&mut self, id: ProcessId) -> Result<(), ProcessError> {
        lock(&self.table).record(Call::Wait(id.pid()));
        Ok(())
    }

    fn spawn(&mut self, path: &Path) -> Result<ProcessId, ProcessError> {
        let mut table = lock(&self.table);
        table.record(Call::Spawn);
        if table.spawn_fails {
            return Err(ProcessError::LaunchFailed {
                path: path.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        let pid = table.next_pid;
        table.next_pid += 1;
        let proc = FakeProc {
            name: table.spawn_name.clone(),
            readings: table.spawn_readings.iter().copied().collect(),
            last: 0,
            exited: false,
            exit_after_reads: None,
            reads: 0,
        };
        table.procs.insert(pid, proc);
        Ok(ProcessId::new(pid, 0))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FailAt {
    Creation,
    Association,
    LimitConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitEvent {
    Attach(u32),
    Release(u32),
}

#[derive(Default)]
struct LimiterLog {
    events: Vec<LimitEvent>,
    fail: Option<FailAt>,
}

/// Limiter that records attach/release order and can fail a chosen step.
#[derive(Clone, Default)]
pub struct FakeLimiter {
    log: Arc<Mutex<LimiterLog>>,
}

impl FakeLimiter {
    pub fn fail_at(&self, step: FailAt) {
        lock(&self.log).fail = Some(step);
    }

    pub fn clear_failure(&self) {
        lock(&self.log).fail = None;
    }

    pub fn events(&self) -> Vec<LimitEvent> {
        lock(&self.log).events.clone()
    }

    pub fn attached(&self) -> Vec<u32> {
        lock(&self.log)
            .events
            .iter()
            .filter_map(|e| match e {
                LimitEvent::Attach(pid) => Some(*pid),
                LimitEvent::Release(_) => None,
            })
            .collect()
    }
}

pub struct FakeLimit {
    pid: u32,
    log: Arc<Mutex<LimiterLog>>,
}

impl Drop for FakeLimit {
    fn drop(&mut self) {
        lock(&self.log).events.push(LimitEvent::Release(self.pid));
    }
}

impl ResourceLimiter for FakeLimiter {
    type Handle = FakeLimit;

    fn attach(
        &mut self,
        process: ProcessId,
        ceiling_bytes: u64,
    ) -> Result<FakeLimit, LimitError> {
        let mut log = lock(&self.log);
        let denied = || std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        match log.fail {
            Some(FailAt::Creation) => {
                return Err(LimitError::CreationFailed {
                    path: PathBuf::from("/sys/fs/cgroup/memwarden"),
                    source: denied(),
                })
            }
            Some(FailAt::Association) => {
                return Err(LimitError::AssociationFailed {
                    pid: process.pid(),
                    source: denied(),
                })
            }
            Some(FailAt::LimitConfig) => {
                return Err(LimitError::LimitConfigFailed {
                    ceiling_bytes,
                    source: denied(),
                })
            }
            None => {}
        }
        log.events.push(LimitEvent::Attach(process.pid()));
        Ok(FakeLimit {
            pid: process.pid(),
            log: Arc::clone(&self.log),
        })
    }
}

#[derive(Default)]
pub struct RecordingEvents {
    entries: Mutex<Vec<(Severity, String)>>,
}

impl RecordingEvents {
    pub fn entries(&self) -> Vec<(Severity, String)> {
        lock(&self.entries).clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.position(needle).is_some()
    }

    /// Index of the first entry containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        lock(&self.entries)
            .iter()
            .position(|(_, msg)| msg.contains(needle))
    }

    pub fn with_severity(&self, severity: Severity) -> Vec<String> {
        lock(&self.entries)
            .iter()
            .filter(|(s, _)| *s == severity)
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

impl EventSink for RecordingEvents {
    fn write(&self, message: &str, severity: Severity) {
        lock(&self.entries).push((severity, message.to_string()));
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    shown: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn shown(&self) -> Vec<(String, String)> {
        lock(&self.shown).clone()
    }
}

impl NotificationSink for RecordingNotifier {
    fn show(&self, title: &str, message: &str) {
        lock(&self.shown).push((title.to_string(), message.to_string()));
    }
}
