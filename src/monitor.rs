//! The enforcement loop: find the target, cap it, watch it, and replace it
//! when it outgrows the ceiling.
//!
//! The loop runs on one dedicated thread. That thread is the only one that
//! touches the tracked process, its limit handle and the current
//! [`MonitorState`]; the lifecycle side only flips a [`StopSignal`] and joins.
use crate::config::{TargetSpec, Timing};
use crate::limiter::{LimitError, ResourceLimiter};
use crate::messages;
use crate::policy::{to_mb, CeilingPolicy, PollDecision};
use crate::process::{ProcessControl, ProcessError, ProcessId};
use crate::sinks::{EventSink, NotificationSink};
use crate::status::StatusTracker;
use serde::Serialize;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Once, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const THREAD_NAME: &str = "memwarden-monitor";

static PANIC_HOOK: Once = Once::new();

thread_local! {
    /// Location and backtrace of the last panic on this monitor thread.
    static PANIC_SITE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Chain a process-wide panic hook that records the panic location and a
/// backtrace, on monitor threads only. The previous hook still runs.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if std::thread::current().name() == Some(THREAD_NAME) {
                let location = info
                    .location()
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| "unknown location".to_string());
                let site = format!("at {location}\nbacktrace:\n{}", Backtrace::force_capture());
                PANIC_SITE.with(|slot| *slot.borrow_mut() = Some(site));
            }
            previous(info);
        }));
    });
}

fn take_panic_site() -> Option<String> {
    PANIC_SITE.with(|slot| slot.borrow_mut().take())
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Idle,
    Discovering,
    Limiting,
    Polling,
    Terminating,
    Restarting,
    Stopped,
}

/// Why the loop ended.
#[derive(Debug)]
pub enum ExitReason {
    /// `stop()` was requested.
    Stopped,
    /// The memory ceiling could not be attached; enforcement is impossible.
    LimiterFault(LimitError),
    /// An unanticipated error or panic. Carries the logged detail.
    Crashed(String),
}

/// Cooperative stop flag with sleeps that wake as soon as it is raised.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self) {
        *self.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.lock()
    }

    /// Sleep for `duration` or until stopped. Returns `true` if stopped.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stopped = self.lock();
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            stopped = guard;
        }
        true
    }
}

/// Errors that end the loop.
#[derive(Debug)]
pub enum MonitorError {
    Process(ProcessError),
    Limiter(LimitError),
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::Process(e) => write!(f, "process operation failed: {}", e),
            MonitorError::Limiter(e) => write!(f, "memory limit setup failed: {}", e),
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Process(e) => Some(e),
            MonitorError::Limiter(e) => Some(e),
        }
    }
}

impl From<ProcessError> for MonitorError {
    fn from(e: ProcessError) -> Self {
        MonitorError::Process(e)
    }
}

impl From<LimitError> for MonitorError {
    fn from(e: LimitError) -> Self {
        MonitorError::Limiter(e)
    }
}

/// The instance currently under watch.
#[derive(Debug)]
pub struct MonitoredProcess {
    id: ProcessId,
    exited: bool,
    last_rss: Option<u64>,
}

impl MonitoredProcess {
    fn new(id: ProcessId) -> Self {
        Self {
            id,
            exited: false,
            last_rss: None,
        }
    }
}

/// Everything the loop owns. Moves onto the worker thread on `start()` and
/// comes back on `stop()`.
struct Worker<P, L> {
    processes: P,
    limiter: L,
    target: TargetSpec,
    timing: Timing,
    policy: CeilingPolicy,
    events: Arc<dyn EventSink>,
    notifier: Arc<dyn NotificationSink>,
    status: Option<StatusTracker>,
    state: MonitorState,
}

struct Running<P, L> {
    stop: Arc<StopSignal>,
    handle: JoinHandle<(Worker<P, L>, ExitReason)>,
}

/// Owns the enforcement loop and its thread.
pub struct Monitor<P, L> {
    worker: Option<Worker<P, L>>,
    running: Option<Running<P, L>>,
}

impl<P, L> Monitor<P, L>
where
    P: ProcessControl + 'static,
    L: ResourceLimiter + 'static,
{
    pub fn new(
        target: TargetSpec,
        processes: P,
        limiter: L,
        events: Arc<dyn EventSink>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let policy = CeilingPolicy::new(target.ceiling_bytes());
        Self {
            worker: Some(Worker {
                processes,
                limiter,
                target,
                timing: Timing::default(),
                policy,
                events,
                notifier,
                status: None,
                state: MonitorState::Stopped,
            }),
            running: None,
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        if let Some(worker) = self.worker.as_mut() {
            worker.timing = timing;
        }
        self
    }

    pub fn with_status(mut self, status: StatusTracker) -> Self {
        if let Some(worker) = self.worker.as_mut() {
            worker.status = Some(status);
        }
        self
    }

    /// True while the loop thread is alive.
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Launch the loop on its own thread and return immediately.
    ///
    /// Does nothing if the loop is already running. A loop that ended on its
    /// own (fatal fault) is joined first and a fresh one is started.
    pub fn start(&mut self) -> std::io::Result<()> {
        if self.is_running() {
            tracing::debug!("monitor already running");
            return Ok(());
        }
        if let Some(reason) = self.stop() {
            tracing::info!(?reason, "previous monitor loop had ended, starting a new one");
        }

        let mut worker = self
            .worker
            .take()
            .ok_or_else(|| std::io::Error::other("monitor worker was lost to a crashed thread"))?;
        worker.state = MonitorState::Idle;
        install_panic_hook();

        let stop = Arc::new(StopSignal::new());
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || worker.run(&thread_stop))?;

        tracing::info!(target_name = %self.target_name(), "monitor started");
        self.running = Some(Running { stop, handle });
        Ok(())
    }

    /// Ask the loop to stop and block until its thread has exited.
    ///
    /// Returns why the loop ended, or `None` if it was never started.
    pub fn stop(&mut self) -> Option<ExitReason> {
        let running = self.running.take()?;
        running.stop.set();
        match running.handle.join() {
            Ok((worker, reason)) => {
                self.worker = Some(worker);
                Some(reason)
            }
            Err(payload) => {
                let detail = panic_message(payload.as_ref());
                tracing::error!(%detail, "monitor thread panicked outside its guard");
                Some(ExitReason::Crashed(detail))
            }
        }
    }

    fn target_name(&self) -> String {
        self.worker
            .as_ref()
            .map(|w| w.target.name().to_string())
            .unwrap_or_default()
    }
}

impl<P, L> Drop for Monitor<P, L> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop.set();
            let _ = running.handle.join();
        }
    }
}

impl<P, L> Worker<P, L>
where
    P: ProcessControl,
    L: ResourceLimiter,
{
    /// Top of the worker thread. Nothing escapes: every failure becomes an
    /// [`ExitReason`] after being logged.
    fn run(mut self, stop: &StopSignal) -> (Self, ExitReason) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.enforce(stop)));
        let reason = match outcome {
            Ok(Ok(())) => ExitReason::Stopped,
            // Already logged and notified where it happened.
            Ok(Err(MonitorError::Limiter(e))) => ExitReason::LimiterFault(e),
            Ok(Err(e)) => {
                let detail = error_detail(&e);
                self.report_crash(&detail);
                ExitReason::Crashed(detail)
            }
            Err(payload) => {
                let mut detail = format!("panic: {}", panic_message(payload.as_ref()));
                if let Some(site) = take_panic_site() {
                    detail.push('\n');
                    detail.push_str(&site);
                }
                self.report_crash(&detail);
                ExitReason::Crashed(detail)
            }
        };

        self.transition(MonitorState::Stopped);
        if let Some(status) = &self.status {
            if matches!(reason, ExitReason::Stopped) {
                status.remove();
            }
        }
        tracing::info!(?reason, "monitor loop exited");
        (self, reason)
    }

    fn report_crash(&self, detail: &str) {
        let message = messages::unexpected_failure(detail);
        self.events.error(&message);
        self.notifier.show(self.target.name(), &message);
    }

    fn transition(&mut self, state: MonitorState) {
        if self.state == state {
            return;
        }
        tracing::debug!(from = ?self.state, to = ?state, "monitor state");
        self.state = state;
        if let Some(status) = &self.status {
            status.update(state);
        }
    }

    fn enforce(&mut self, stop: &StopSignal) -> Result<(), MonitorError> {
        while !stop.is_set() {
            self.transition(MonitorState::Discovering);
            let Some(id) = self.processes.find_by_name(self.target.name())? else {
                self.events
                    .info(&messages::process_not_found(self.target.name()));
                self.restart_process();
                self.transition(MonitorState::Idle);
                if stop.sleep(self.timing.not_found_delay) {
                    break;
                }
                continue;
            };

            let mut process = MonitoredProcess::new(id);
            if let Some(status) = self.status.as_mut() {
                status.set_tracked(id.pid());
            }

            self.transition(MonitorState::Limiting);
            let limit = match self.limiter.attach(id, self.target.ceiling_bytes()) {
                Ok(handle) => handle,
                Err(e) => {
                    let message = messages::limit_failed(&e);
                    self.events.error(&message);
                    self.notifier.show(self.target.name(), &message);
                    return Err(e.into());
                }
            };
            self.events.info(&messages::limit_set(
                self.target.name(),
                id.pid(),
                to_mb(self.target.ceiling_bytes()),
            ));

            self.transition(MonitorState::Polling);
            let outcome = self.poll(&mut process, stop);
            drop(limit);

            tracing::debug!(
                pid = process.id.pid(),
                exited = process.exited,
                last_rss = ?process.last_rss,
                "stopped tracking instance"
            );
            if let Some(status) = self.status.as_mut() {
                status.clear_tracked();
            }
            outcome?;
        }
        Ok(())
    }

    /// Watch one instance until it exits, violates the ceiling, or stop is
    /// requested.
    fn poll(
        &mut self,
        process: &mut MonitoredProcess,
        stop: &StopSignal,
    ) -> Result<(), MonitorError> {
        loop {
            if stop.is_set() {
                return Ok(());
            }
            if self.processes.has_exited(process.id) {
                self.note_self_exit(process);
                return Ok(());
            }

            let rss = match self.processes.resident_memory_bytes(process.id) {
                Ok(bytes) => bytes,
                Err(ProcessError::Gone { .. }) => {
                    self.note_self_exit(process);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            process.last_rss = Some(rss);
            tracing::debug!(pid = process.id.pid(), rss_bytes = rss, "polled");
            if let Some(status) = self.status.as_mut() {
                status.set_rss_bytes(rss);
                status.update(self.state);
            }

            if let PollDecision::Violation { rss_bytes, .. } = self.policy.evaluate(rss) {
                return self.replace(process, rss_bytes);
            }

            if stop.sleep(self.timing.poll_interval) {
                return Ok(());
            }
        }
    }

    /// A process that went away without our help goes back through
    /// discovery, whose not-found branch launches the replacement.
    fn note_self_exit(&mut self, process: &mut MonitoredProcess) {
        process.exited = true;
        self.events
            .info(&messages::process_exited(self.target.name(), process.id.pid()));
    }

    /// Kill an instance over the ceiling, wait for it, and launch a new one.
    fn replace(
        &mut self,
        process: &mut MonitoredProcess,
        rss_bytes: u64,
    ) -> Result<(), MonitorError> {
        self.transition(MonitorState::Terminating);
        let message = messages::limit_exceeded(
            self.target.name(),
            to_mb(rss_bytes),
            to_mb(self.policy.ceiling_bytes()),
        );
        self.events.info(&message);
        self.notifier.show(self.target.name(), &message);

        self.processes.kill(process.id)?;
        self.processes.wait_for_exit(process.id)?;
        process.exited = true;

        self.transition(MonitorState::Restarting);
        self.restart_process();
        Ok(())
    }

    /// Launch a new instance. Failure is reported and left for the next
    /// discovery pass to retry.
    fn restart_process(&mut self) {
        let name = self.target.name();
        match self.processes.spawn(self.target.path()) {
            Ok(id) => {
                tracing::info!(pid = id.pid(), "replacement launched");
                self.events.info(&messages::starting_process(name));
            }
            Err(e) => {
                self.notifier.show(name, &messages::launch_failed_notice(name));
                self.events.error(&messages::launch_failed(name, &e.to_string()));
            }
        }
        if let Some(status) = self.status.as_mut() {
            status.record_restart();
            tracing::debug!(restarts = status.restarts(), "launch attempted");
        }
    }
}

/// Message, cause chain and debug form of an error.
fn error_detail(err: &(dyn std::error::Error + 'static)) -> String {
    let mut detail = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        detail.push_str(&format!("\ncaused by: {cause}"));
        source = cause.source();
    }
    detail.push_str(&format!("\n{err:?}"));
    detail
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
