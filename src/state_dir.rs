use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Manages the runtime state directory (default `/run/memwarden/`).
///
/// Holds the live status file and the singleton lock. Nothing in here is
/// meant to survive a reboot.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Create a new StateDir referencing the given root path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory (e.g. `/run/memwarden/`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the live status file.
    pub fn status(&self) -> PathBuf {
        self.root.join("status")
    }

    /// Path to the singleton lock file.
    pub fn lock(&self) -> PathBuf {
        self.root.join("lock")
    }

    /// Create the directory if missing.
    /// Returns Ok(true) if it was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        Ok(created)
    }

    /// Take the exclusive instance lock, failing fast if another watchdog
    /// holds it. The lock lasts as long as the returned guard.
    pub fn acquire_lock(&self) -> Result<InstanceLock, LockError> {
        let path = self.lock();
        let file = File::create(&path).map_err(|e| LockError::Open {
            path: path.clone(),
            source: e,
        })?;
        file.try_lock_exclusive()
            .map_err(|e| LockError::Held { path, source: e })?;
        Ok(InstanceLock { file })
    }
}

/// Exclusive lock on `<state dir>/lock`, released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Errors from taking the instance lock.
#[derive(Debug)]
pub enum LockError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    Held {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Open { path, source } => {
                write!(f, "failed to open lock file {}: {}", path.display(), source)
            }
            LockError::Held { path, .. } => write!(
                f,
                "another memwarden instance holds {}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Open { source, .. } => Some(source),
            LockError::Held { source, .. } => Some(source),
        }
    }
}
