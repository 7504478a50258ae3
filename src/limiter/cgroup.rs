//! cgroup v2 binding of [`ResourceLimiter`].
//!
//! Layout: `<mount>/<parent>/<pid>-<start_ticks>`. The parent group is shared
//! by all instances and has the memory controller enabled for its children;
//! each process instance gets its own leaf group whose `memory.max` is the
//! ceiling. The kernel OOM-kills the instance if it outgrows the leaf.
use super::{LimitError, ResourceLimiter};
use crate::process::procfs::live_start_ticks;
use crate::process::ProcessId;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const PROC_ROOT: &str = "/proc";

pub struct CgroupLimiter {
    mount: PathBuf,
    parent: String,
    proc_root: PathBuf,
}

impl CgroupLimiter {
    pub fn new(mount: impl Into<PathBuf>, parent: impl Into<String>) -> Self {
        Self {
            mount: mount.into(),
            parent: parent.into(),
            proc_root: PathBuf::from(PROC_ROOT),
        }
    }

    /// Look up each process's original cgroup under another procfs root.
    #[cfg(test)]
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    fn parent_path(&self) -> PathBuf {
        self.mount.join(&self.parent)
    }

    /// Group the process currently lives in, from the `0::` line of
    /// `/proc/<pid>/cgroup`.
    fn origin_of(&self, pid: u32) -> Option<PathBuf> {
        let content =
            fs::read_to_string(self.proc_root.join(pid.to_string()).join("cgroup")).ok()?;
        let rel = content
            .lines()
            .find_map(|line| line.strip_prefix("0::"))?
            .trim()
            .trim_start_matches('/');
        Some(self.mount.join(rel))
    }

    /// Create the shared parent and let its children use the memory controller.
    fn prepare_parent(&self) -> Result<PathBuf, LimitError> {
        let parent = self.parent_path();
        fs::create_dir_all(&parent).map_err(|e| LimitError::CreationFailed {
            path: parent.clone(),
            source: e,
        })?;
        write_file(&parent.join("cgroup.subtree_control"), "+memory").map_err(|e| {
            LimitError::CreationFailed {
                path: parent.clone(),
                source: e,
            }
        })?;
        Ok(parent)
    }
}

impl ResourceLimiter for CgroupLimiter {
    type Handle = CgroupHandle;

    fn attach(
        &mut self,
        process: ProcessId,
        ceiling_bytes: u64,
    ) -> Result<CgroupHandle, LimitError> {
        let parent = self.prepare_parent()?;

        let path = parent.join(format!("{}-{}", process.pid(), process.start_ticks()));
        match fs::create_dir(&path) {
            Ok(()) => {}
            // Left behind by an earlier run for this exact instance; reuse it.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::debug!(path = %path.display(), "limit group already exists");
            }
            Err(e) => return Err(LimitError::CreationFailed { path, source: e }),
        }

        let origin = self.origin_of(process.pid());
        write_file(&path.join("cgroup.procs"), &process.pid().to_string()).map_err(|e| {
            // Nothing was joined yet, so there is nothing to move back.
            remove_group(&path);
            LimitError::AssociationFailed {
                pid: process.pid(),
                source: e,
            }
        })?;

        // From here on the handle owns cleanup.
        let handle = CgroupHandle {
            path,
            origin,
            process,
            proc_root: self.proc_root.clone(),
        };

        write_file(&handle.path.join("memory.max"), &ceiling_bytes.to_string()).map_err(|e| {
            LimitError::LimitConfigFailed {
                ceiling_bytes,
                source: e,
            }
        })?;

        tracing::info!(
            pid = process.pid(),
            ceiling_bytes,
            group = %handle.path.display(),
            "memory ceiling attached"
        );
        Ok(handle)
    }
}

/// A leaf cgroup holding exactly one process instance.
#[derive(Debug)]
pub struct CgroupHandle {
    path: PathBuf,
    origin: Option<PathBuf>,
    process: ProcessId,
    proc_root: PathBuf,
}

impl CgroupHandle {
    /// Move the instance back to the group it came from, unless its pid has
    /// since been freed or handed to another process.
    fn restore_origin(&self) {
        let Some(origin) = &self.origin else {
            return;
        };
        let pid = self.process.pid();
        if live_start_ticks(&self.proc_root, pid) != Some(self.process.start_ticks()) {
            tracing::debug!(pid, "instance is gone, leaving its pid alone");
            return;
        }
        if let Err(e) = write_file(&origin.join("cgroup.procs"), &pid.to_string()) {
            tracing::debug!(
                pid,
                origin = %origin.display(),
                error = %e,
                "did not move process back to its original group"
            );
        }
    }
}

impl Drop for CgroupHandle {
    fn drop(&mut self) {
        self.restore_origin();
        remove_group(&self.path);
        tracing::debug!(
            pid = self.process.pid(),
            group = %self.path.display(),
            "memory ceiling released"
        );
    }
}

fn remove_group(path: &Path) {
    match fs::remove_dir(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(group = %path.display(), error = %e, "failed to remove limit group")
        }
    }
}

/// Write to an existing cgroup interface file. cgroupfs creates these files
/// itself, so a missing file is an error rather than something to create.
fn write_file(path: &Path, content: &str) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new().write(true).open(path)?;
    file.write_all(content.as_bytes())
}
