//! Process-level mutual exclusion.
//!
//! Only one upload or monitor invocation may run against a log/state directory
//! at a time. The guard is an exclusive advisory lock (`flock`) on a zero-byte
//! file at a deterministic path, taken through the `fs2` crate. Contention fails
//! immediately; this is a guard, not a queue.
//!
//! The kernel drops the lock when the holding process exits, so a killed
//! invocation never leaves a stale lock behind.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock is held by another process: {0}")]
    Held(PathBuf),

    #[error("failed to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to acquire lock {path}: {source}")]
    Acquire {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An exclusive lock held for the lifetime of one invocation.
///
/// The lock is released when the guard is dropped, including on error paths.
pub struct ProcessLock {
    file: File,
    path: PathBuf,
}

impl ProcessLock {
    /// Try to take the lock at `path` without blocking.
    pub fn acquire(path: &Path) -> Result<ProcessLock, LockError> {
        debug!(lock = %path.display(), "Attempting to acquire process lock");

        // an existing lock file is opened as-is, never truncated
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                info!(lock = %path.display(), pid = std::process::id(), "Acquired process lock");
                Ok(ProcessLock {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                warn!(lock = %path.display(), "Process lock already held, another upload is running");
                Err(LockError::Held(path.to_path_buf()))
            }
            Err(source) => Err(LockError::Acquire {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly. Equivalent to dropping the guard.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            // closing the descriptor below still releases the flock
            debug!(lock = %self.path.display(), error = %e, "Explicit unlock failed");
        }
        info!(lock = %self.path.display(), "Released process lock");
    }
}

impl std::fmt::Debug for ProcessLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLock")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_fails_while_first_is_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let first = ProcessLock::acquire(&path).expect("first acquire succeeds");
        match ProcessLock::acquire(&path) {
            Err(LockError::Held(p)) => assert_eq!(p, path),
            other => panic!("expected LockError::Held, got {other:?}"),
        }

        first.release();
        ProcessLock::acquire(&path).expect("lock is free again after release");
    }

    #[test]
    fn existing_lock_file_is_not_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lock");
        std::fs::write(&path, b"left by someone").unwrap();

        let _lock = ProcessLock::acquire(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"left by someone");
    }

    #[test]
    fn fresh_lock_file_is_zero_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let _lock = ProcessLock::acquire(&path).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
