//! Where the watchdog reports to: a durable event log and transient desktop
//! notifications. Both are best effort; a failing sink never stops the monitor.
use chrono::{SecondsFormat, Utc};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Severity of an event log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Error => "ERROR",
        }
    }
}

/// Append-only durable log.
pub trait EventSink: Send + Sync {
    fn write(&self, message: &str, severity: Severity);

    fn info(&self, message: &str) {
        self.write(message, Severity::Info);
    }

    fn error(&self, message: &str) {
        self.write(message, Severity::Error);
    }
}

/// Short transient message shown to the user.
pub trait NotificationSink: Send + Sync {
    fn show(&self, title: &str, message: &str);
}

/// Event log backed by a plain text file, one entry per line:
///
/// ```text
/// 2026-10-17T09:12:44.120Z INFO Memory ceiling set for adguardvpn-cli
/// ```
///
/// The file is opened in append mode for each entry so rotation by an
/// external tool is picked up without a restart. Every entry is mirrored to
/// `tracing`.
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }
}

/// Render one log line. Embedded newlines (multi-line error detail) are kept
/// but indented so each entry still starts with a timestamp.
fn format_entry(message: &str, severity: Severity) -> String {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let body = message.trim_end().replace('\n', "\n    ");
    format!("{timestamp} {} {body}\n", severity.as_str())
}

impl EventSink for EventLog {
    fn write(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info => tracing::info!(target: "memwarden::events", "{message}"),
            Severity::Error => tracing::error!(target: "memwarden::events", "{message}"),
        }
        if let Err(e) = self.append(&format_entry(message, severity)) {
            tracing::warn!(error = %e, path = %self.path.display(), "failed to write event log");
        }
    }
}

/// Desktop notifications through `notify-send` (or a compatible command).
///
/// The command is launched and left to finish on its own; the monitor never
/// waits for it. Finished commands are reaped on the next `show`.
pub struct DesktopNotifier {
    enabled: bool,
    command: String,
    pending: Mutex<Vec<Child>>,
}

impl DesktopNotifier {
    pub fn new(enabled: bool, command: impl Into<String>) -> Self {
        Self {
            enabled,
            command: command.into(),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Vec<Child>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Collect finished notification commands. Returns how many are still
    /// running.
    fn reap(&self) -> usize {
        let mut pending = self.pending();
        pending.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    tracing::debug!(
                        command = %self.command,
                        %status,
                        "notification command failed"
                    );
                }
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::debug!(error = %e, "cannot poll notification command");
                false
            }
        });
        pending.len()
    }
}

impl NotificationSink for DesktopNotifier {
    fn show(&self, title: &str, message: &str) {
        if !self.enabled {
            tracing::debug!(title, message, "notifications disabled");
            return;
        }
        self.reap();
        let spawned = Command::new(&self.command)
            .args(["--app-name", "memwarden", title, message])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(child) => self.pending().push(child),
            Err(e) => tracing::debug!(
                command = %self.command,
                error = %e,
                "cannot run notification command"
            ),
        }
    }
}
