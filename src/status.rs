//! Status file: writes `status` as JSON on every monitor state transition and
//! every poll, so operators can see what the watchdog is doing right now.
//!
//! Each write goes to a staging file that is then renamed over the live one.
use crate::monitor::MonitorState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: MonitorState,
    pub target: String,
    pub ceiling_bytes: u64,
    pub tracked_pid: Option<u32>,
    pub rss_bytes: Option<u64>,
    pub restarts: u64,
    pub tracking_since: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
}

/// The live status file. Only one watchdog runs per state directory (the
/// instance lock), so a fixed sibling temp name is enough.
pub struct StatusFile {
    path: PathBuf,
    staging: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "status".to_string());
        let staging = path.with_file_name(format!(".{name}.partial"));
        Self { path, staging }
    }

    /// Replace the file contents in one rename so readers never see a
    /// half-written document.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let staged = File::create(&self.staging).and_then(|file| {
            let mut out = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut out, data)?;
            out.flush()
        });
        staged.map_err(|source| StatusError::Stage {
            path: self.staging.clone(),
            source,
        })?;

        fs::rename(&self.staging, &self.path).map_err(|source| {
            let _ = fs::remove_file(&self.staging);
            StatusError::Publish {
                path: self.path.clone(),
                source,
            }
        })
    }

    /// Remove the file on clean shutdown. Already gone is fine.
    pub fn remove(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "cannot remove status file")
            }
        }
    }
}

/// Mutable view of the monitor that builds StatusData for each update.
pub struct StatusTracker {
    file: StatusFile,
    pid: u32,
    target: String,
    ceiling_bytes: u64,
    tracked_pid: Option<u32>,
    rss_bytes: Option<u64>,
    restarts: u64,
    tracking_since: Option<DateTime<Utc>>,
}

impl StatusTracker {
    /// Create a new tracker.
    pub fn new(status_path: PathBuf, target: &str, ceiling_bytes: u64) -> Self {
        Self {
            file: StatusFile::new(status_path),
            pid: std::process::id(),
            target: target.to_string(),
            ceiling_bytes,
            tracked_pid: None,
            rss_bytes: None,
            restarts: 0,
            tracking_since: None,
        }
    }

    /// Update and write the status file with the given state.
    pub fn update(&self, state: MonitorState) {
        let data = StatusData {
            pid: self.pid,
            state,
            target: self.target.clone(),
            ceiling_bytes: self.ceiling_bytes,
            tracked_pid: self.tracked_pid,
            rss_bytes: self.rss_bytes,
            restarts: self.restarts,
            tracking_since: self.tracking_since,
            last_update: Utc::now(),
        };

        if let Err(e) = self.file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    /// Start tracking a newly discovered instance.
    pub fn set_tracked(&mut self, pid: u32) {
        self.tracked_pid = Some(pid);
        self.rss_bytes = None;
        self.tracking_since = Some(Utc::now());
    }

    /// Forget the tracked instance.
    pub fn clear_tracked(&mut self) {
        self.tracked_pid = None;
        self.rss_bytes = None;
        self.tracking_since = None;
    }

    /// Record the latest resident memory reading.
    pub fn set_rss_bytes(&mut self, bytes: u64) {
        self.rss_bytes = Some(bytes);
    }

    /// Count a launch attempt.
    pub fn record_restart(&mut self) {
        self.restarts += 1;
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Remove the status file.
    pub fn remove(&self) {
        self.file.remove();
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    /// Writing the staging copy failed (includes serialization).
    Stage { path: PathBuf, source: io::Error },
    /// Renaming the staging copy over the live file failed.
    Publish { path: PathBuf, source: io::Error },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Stage { path, source } => {
                write!(f, "cannot write {}: {source}", path.display())
            }
            StatusError::Publish { path, source } => {
                write!(f, "cannot publish {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Stage { source, .. } | StatusError::Publish { source, .. } => Some(source),
        }
    }
}
