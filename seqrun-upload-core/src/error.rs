//! Error taxonomy for an upload invocation.
//!
//! Run-level rejections (incomplete run, sample sheet mismatch) and file-level
//! transfer failures are *not* errors here: they are logged and recorded, and the
//! pass carries on. Everything in [`UploadError`] ends the invocation.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::lock::LockError;
use crate::state::StateError;

#[derive(Debug, Error)]
pub enum UploadError {
    /// The log/state directory cannot be created or written to.
    #[error("log directory {path} is not writable: {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Another invocation holds the process lock.
    #[error("another upload is already running (lock held at {0})")]
    LockHeld(PathBuf),

    #[error("failed to acquire process lock: {0}")]
    Lock(LockError),

    #[error("bucket {bucket} is not accessible: {message}")]
    BucketNotAccessible { bucket: String, message: String },

    #[error("{0} does not appear to be a complete sequencing run")]
    NotASequencingRun(PathBuf),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("failed to enumerate files under {path}: {source}")]
    Enumerate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("transfer worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<LockError> for UploadError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Held(path) => UploadError::LockHeld(path),
            other => UploadError::Lock(other),
        }
    }
}
