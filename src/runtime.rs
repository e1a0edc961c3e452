//! Single-instance process lock
//!
//! Acquires a PID-file lock so two orchestrator processes never fight over
//! the same `runs`/`cas` directories, grounded in the original system's
//! `process_manager.py`. Engaged once in `main.rs` before the gateway binds.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another instance is already running (pid {pid}, lock file {path})")]
    AlreadyRunning { pid: u32, path: PathBuf },

    #[error("failed to access lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Holds a PID-file lock for the lifetime of the process; removes the file
/// on drop.
pub struct SingleInstanceLock {
    path: PathBuf,
}

fn process_alive(pid: u32) -> bool {
    // Linux-specific: the /proc entry disappears as soon as the process
    // table slot is reclaimed, which is good enough for a best-effort
    // stale-lock check; a PID reused as some unrelated process is the same
    // failure mode every PID-file lock has.
    Path::new(&format!("/proc/{pid}")).exists()
}

impl SingleInstanceLock {
    /// Attempts to acquire the lock at `path`. If a lock file exists and its
    /// recorded pid is still alive, fails; if the recorded pid is dead (a
    /// crash left the file behind), the stale lock is replaced.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();

        if let Ok(existing) = std::fs::read_to_string(&path) {
            if let Ok(pid) = existing.trim().parse::<u32>() {
                if process_alive(pid) {
                    return Err(LockError::AlreadyRunning { pid, path });
                }
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Io { path: path.clone(), source })?;
        }
        std::fs::write(&path, std::process::id().to_string())
            .map_err(|source| LockError::Io { path: path.clone(), source })?;

        Ok(Self { path })
    }
}

impl Drop for SingleInstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
