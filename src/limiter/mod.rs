//! OS-enforced memory caps.
//!
//! A limiter binds one process instance to a hard ceiling the kernel enforces
//! on its own, so a spike between two polls is still contained.

pub mod cgroup;

use crate::process::ProcessId;
use std::path::PathBuf;

/// Binds a process to a memory ceiling.
pub trait ResourceLimiter: Send {
    /// Owned limit. Dropping it releases the OS object and detaches the
    /// process.
    type Handle: Send;

    /// Create a fresh limit object for `process` capped at `ceiling_bytes`.
    ///
    /// Steps run in order (create, associate, configure) and stop at the first
    /// failure. No retries.
    fn attach(&mut self, process: ProcessId, ceiling_bytes: u64)
        -> Result<Self::Handle, LimitError>;
}

/// Which step of limit attachment failed.
#[derive(Debug)]
pub enum LimitError {
    /// The limit object could not be created.
    CreationFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The process could not be placed into the limit object.
    AssociationFailed { pid: u32, source: std::io::Error },
    /// The ceiling could not be applied.
    LimitConfigFailed {
        ceiling_bytes: u64,
        source: std::io::Error,
    },
}

impl LimitError {
    /// Stable name of the failed step, used in log entries.
    pub fn kind(&self) -> &'static str {
        match self {
            LimitError::CreationFailed { .. } => "CreationFailed",
            LimitError::AssociationFailed { .. } => "AssociationFailed",
            LimitError::LimitConfigFailed { .. } => "LimitConfigFailed",
        }
    }
}

impl std::fmt::Display for LimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitError::CreationFailed { path, source } => write!(
                f,
                "{}: cannot create limit group {}: {}",
                self.kind(),
                path.display(),
                source
            ),
            LimitError::AssociationFailed { pid, source } => write!(
                f,
                "{}: cannot move process {} into limit group: {}",
                self.kind(),
                pid,
                source
            ),
            LimitError::LimitConfigFailed {
                ceiling_bytes,
                source,
            } => write!(
                f,
                "{}: cannot set memory ceiling of {} bytes: {}",
                self.kind(),
                ceiling_bytes,
                source
            ),
        }
    }
}

impl std::error::Error for LimitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LimitError::CreationFailed { source, .. } => Some(source),
            LimitError::AssociationFailed { source, .. } => Some(source),
            LimitError::LimitConfigFailed { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_distinct_in_display() {
        let errs = [
            LimitError::CreationFailed {
                path: PathBuf::from("/sys/fs/cgroup/memwarden"),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            },
            LimitError::AssociationFailed {
                pid: 7,
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            },
            LimitError::LimitConfigFailed {
                ceiling_bytes: 1024,
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            },
        ];
        let rendered: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
        assert!(rendered[0].starts_with("CreationFailed"));
        assert!(rendered[1].starts_with("AssociationFailed"));
        assert!(rendered[2].starts_with("LimitConfigFailed"));
    }
}
