//! Deterministic locations under the configured log/state directory.
//!
//! ```text
//! <log_dir>/
//!   seqrun_upload.lock     process lock
//!   seqrun_upload.log      appended application log (written by the CLI)
//!   uploads/               one upload-state JSON file per run
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::UploadError;

pub const LOCK_FILE_NAME: &str = "seqrun_upload.lock";
pub const LOG_FILE_NAME: &str = "seqrun_upload.log";
pub const STATE_DIR_NAME: &str = "uploads";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLayout {
    log_dir: PathBuf,
}

impl LogLayout {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn lock_path(&self) -> PathBuf {
        self.log_dir.join(LOCK_FILE_NAME)
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join(LOG_FILE_NAME)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.log_dir.join(STATE_DIR_NAME)
    }

    /// Create the log and state directories and prove they can be written to.
    ///
    /// Must run before the lock is taken: an unwritable log directory is a
    /// configuration problem, not contention.
    pub fn ensure_writable(&self) -> Result<(), UploadError> {
        for dir in [self.log_dir.clone(), self.state_dir()] {
            fs::create_dir_all(&dir).map_err(|source| UploadError::LogDir {
                path: dir.clone(),
                source,
            })?;
            tempfile::tempfile_in(&dir).map_err(|source| UploadError::LogDir {
                path: dir.clone(),
                source,
            })?;
        }
        debug!(log_dir = %self.log_dir.display(), "Log directory is writable");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_derived_from_log_dir() {
        let layout = LogLayout::new("/var/log/seqrun_upload");
        assert_eq!(
            layout.lock_path(),
            PathBuf::from("/var/log/seqrun_upload/seqrun_upload.lock")
        );
        assert_eq!(
            layout.state_dir(),
            PathBuf::from("/var/log/seqrun_upload/uploads")
        );
    }

    #[test]
    fn ensure_writable_creates_missing_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = LogLayout::new(tmp.path().join("nested/logs"));
        layout.ensure_writable().expect("should create and write");
        assert!(layout.state_dir().is_dir());
    }

    #[test]
    fn ensure_writable_fails_when_log_dir_is_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let not_a_dir = tmp.path().join("file");
        fs::write(&not_a_dir, b"x").unwrap();

        let layout = LogLayout::new(&not_a_dir);
        assert!(matches!(
            layout.ensure_writable(),
            Err(UploadError::LogDir { .. })
        ));
    }
}
