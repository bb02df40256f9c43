//! Upload State Store: the durable, per-run record of what has been uploaded.
//!
//! Each run gets one JSON file under `<log_dir>/uploads/`. The file is the
//! source of truth for resuming: files in `uploaded_files` are not sent again,
//! and a record with `completed: true` removes the run from future scans.
//!
//! Writes go to a temporary file in the same directory which is then renamed
//! over the previous record, so readers only ever see a whole record.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::run::RunDirectory;

const RECORD_SUFFIX: &str = ".upload.log.json";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read upload state {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("upload state {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write upload state {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Persisted upload progress of one run. Field names are a stable contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub run_id: String,
    pub run_path: String,
    pub completed: bool,
    pub total_local_files: usize,
    pub total_uploaded_files: usize,
    pub total_failed_upload: usize,
    pub failed_upload_files: Vec<String>,
    /// Local file path to remote entity tag.
    pub uploaded_files: BTreeMap<String, String>,
}

impl UploadRecord {
    pub fn new(run: &RunDirectory) -> Self {
        Self {
            run_id: run.run_id.clone(),
            run_path: run.path.to_string_lossy().into_owned(),
            completed: false,
            total_local_files: 0,
            total_uploaded_files: 0,
            total_failed_upload: 0,
            failed_upload_files: Vec::new(),
            uploaded_files: BTreeMap::new(),
        }
    }

    /// Reset per-attempt state before a new upload attempt.
    ///
    /// Failures from the previous attempt are cleared; those files are not in
    /// `uploaded_files` so they are retried as part of the new work list.
    pub fn begin_attempt(&mut self, local_files: &HashSet<String>) {
        self.failed_upload_files.clear();
        self.refresh(local_files);
    }

    pub fn record_success(&mut self, path: &str, digest: &str, local_files: &HashSet<String>) {
        self.uploaded_files.insert(path.to_owned(), digest.to_owned());
        self.failed_upload_files.retain(|f| f != path);
        self.refresh(local_files);
    }

    /// Drop the stored tag of a file that is about to be sent again.
    ///
    /// Its old tag no longer describes the local content, so it stops counting
    /// as uploaded until the new copy is confirmed.
    pub fn forget_upload(&mut self, path: &str) {
        self.uploaded_files.remove(path);
    }

    pub fn record_failure(&mut self, path: &str, local_files: &HashSet<String>) {
        if !self.failed_upload_files.iter().any(|f| f == path) {
            self.failed_upload_files.push(path.to_owned());
        }
        self.refresh(local_files);
    }

    /// Recompute the counters and the completion flag from the current contents.
    pub fn refresh(&mut self, local_files: &HashSet<String>) {
        self.total_local_files = local_files.len();
        self.total_uploaded_files = self.uploaded_files.len();
        self.total_failed_upload = self.failed_upload_files.len();
        self.completed = self.failed_upload_files.is_empty()
            && local_files
                .iter()
                .all(|f| self.uploaded_files.contains_key(f));
    }

    /// Number of local files still without a confirmed remote copy.
    pub fn remaining(&self) -> usize {
        self.total_local_files.saturating_sub(self.total_uploaded_files)
    }
}

/// One-record-per-run JSON store with atomic replace writes.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<run_id>.<root tag>.upload.log.json`
    ///
    /// The root tag keeps runs with the same name under different monitored
    /// directories apart.
    pub fn record_path(&self, run: &RunDirectory) -> PathBuf {
        let digest = Sha256::digest(run.root.to_string_lossy().as_bytes());
        let root_tag = &hex::encode(digest)[..8];
        self.dir
            .join(format!("{}.{}{}", run.run_id, root_tag, RECORD_SUFFIX))
    }

    pub fn load(&self, run: &RunDirectory) -> Result<Option<UploadRecord>, StateError> {
        let path = self.record_path(run);
        let record = match read_record(&path) {
            Ok(record) => record,
            Err(StateError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                debug!(run_id = %run.run_id, "No upload state recorded yet");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if record.completed {
            debug!(run_id = %record.run_id, "Upload state: finished upload");
        } else {
            debug!(
                run_id = %record.run_id,
                total_local_files = record.total_local_files,
                total_uploaded_files = record.total_uploaded_files,
                total_failed_upload = record.total_failed_upload,
                remaining = record.remaining(),
                "Upload state: incomplete upload"
            );
        }
        Ok(Some(record))
    }

    /// Persist `record` for `run`, replacing any previous version atomically.
    pub fn save(&self, record: &UploadRecord, run: &RunDirectory) -> Result<(), StateError> {
        let path = self.record_path(run);
        let write_err = |source: io::Error| StateError::Write {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(write_err)?;
        let payload = serde_json::to_vec_pretty(record)
            .map_err(|e| write_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(write_err)?;
        tmp.write_all(&payload).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&path).map_err(|e| write_err(e.error))?;

        debug!(
            run_id = %record.run_id,
            uploaded = record.total_uploaded_files,
            failed = record.total_failed_upload,
            completed = record.completed,
            "Saved upload state"
        );
        Ok(())
    }

    /// Run ids of every stored record that has not completed, sorted.
    pub fn list_incomplete(&self) -> Result<Vec<String>, StateError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StateError::Read {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut incomplete = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StateError::Read {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if !path.to_string_lossy().ends_with(RECORD_SUFFIX) {
                continue;
            }
            match read_record(&path) {
                Ok(record) if !record.completed => incomplete.push(record.run_id),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Skipping unreadable upload state file"),
            }
        }
        incomplete.sort();
        info!(count = incomplete.len(), "Listed incomplete uploads");
        Ok(incomplete)
    }
}

fn read_record(path: &Path) -> Result<UploadRecord, StateError> {
    let contents = fs::read_to_string(path).map_err(|source| StateError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| StateError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
