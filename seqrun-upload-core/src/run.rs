//! Run Locator: find sequencing run directories that are ready to upload.
//!
//! A run directory is recognised by its `RunInfo.xml` and considered finished
//! once the instrument has written a termination file (`CopyComplete.txt` on
//! NovaSeq, `RTAComplete.txt`/`RTAComplete.xml` elsewhere). A run without a
//! termination file is simply "not yet" and is looked at again on the next scan.
//! With `skip_check` every subdirectory counts as complete.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

const RUN_INFO_FILE: &str = "RunInfo.xml";
const TERMINATION_FILES: [&str; 3] = ["CopyComplete.txt", "RTAComplete.txt", "RTAComplete.xml"];

/// One sequencing run on local disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunDirectory {
    /// Directory name of the run.
    pub run_id: String,
    /// Canonical absolute path of the run.
    pub path: PathBuf,
    /// Canonical path of the directory the run sits in.
    pub root: PathBuf,
}

impl RunDirectory {
    /// Resolve `path` to its canonical form and derive the run id from it.
    pub fn from_path(path: &Path) -> io::Result<RunDirectory> {
        let path = path.canonicalize()?;
        let run_id = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no directory name", path.display()),
                )
            })?;
        let root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        Ok(RunDirectory { run_id, path, root })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocatorOptions {
    /// Treat every subdirectory as a complete run.
    pub skip_check: bool,
}

/// Result of looking at one candidate directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCheck {
    Complete,
    NotARun,
    Incomplete,
}

pub fn is_sequencing_run_dir(path: &Path) -> bool {
    path.join(RUN_INFO_FILE).is_file()
}

pub fn termination_file_exists(path: &Path) -> bool {
    TERMINATION_FILES.iter().any(|f| path.join(f).is_file())
}

pub fn check_run(path: &Path, options: &LocatorOptions) -> RunCheck {
    if options.skip_check {
        return RunCheck::Complete;
    }
    if !is_sequencing_run_dir(path) {
        return RunCheck::NotARun;
    }
    if !termination_file_exists(path) {
        return RunCheck::Incomplete;
    }
    RunCheck::Complete
}

/// Scan each root for complete run directories.
///
/// A run reachable through more than one root (overlapping roots, symlinks) is
/// returned once, under the first root it was found in.
pub fn locate_runs(roots: &[PathBuf], options: &LocatorOptions) -> Vec<RunDirectory> {
    let mut runs = Vec::new();
    let mut seen = HashSet::new();

    for root in roots {
        info!(root = %root.display(), "Checking for completed sequencing runs");

        let mut candidates = match subdirectories(root) {
            Ok(dirs) => dirs,
            Err(e) => {
                error!(root = %root.display(), error = %e, "Failed to read monitored directory, skipping");
                continue;
            }
        };
        candidates.sort();

        for candidate in candidates {
            match check_run(&candidate, options) {
                RunCheck::NotARun => {
                    debug!(dir = %candidate.display(), "Not a sequencing run, will not be uploaded");
                    continue;
                }
                RunCheck::Incomplete => {
                    debug!(dir = %candidate.display(), "Sequencing not complete yet, will not be uploaded");
                    continue;
                }
                RunCheck::Complete => {}
            }

            let run = match RunDirectory::from_path(&candidate) {
                Ok(run) => run,
                Err(e) => {
                    error!(dir = %candidate.display(), error = %e, "Failed to resolve run directory, skipping");
                    continue;
                }
            };

            if !seen.insert(run.path.clone()) {
                debug!(run_id = %run.run_id, path = %run.path.display(), "Run already found via another monitored directory");
                continue;
            }

            debug!(run_id = %run.run_id, "Found complete sequencing run");
            runs.push(run);
        }
    }

    runs
}

fn subdirectories(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        // follows symlinks, so a linked run directory is picked up too
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}
