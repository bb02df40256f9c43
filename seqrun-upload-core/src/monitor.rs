//! Monitor Loop: one scheduled pass over every configured target.
//!
//! A pass takes the process lock, confirms each bucket is reachable, locates
//! complete runs, drops those the sample filter rejects or whose record says
//! they are finished, and uploads the rest one run at a time. Runs with a
//! partial record go first so interrupted uploads finish before new ones start.
//!
//! The lock is held for the whole pass and released on every exit path.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use crate::contract::{Channel, Notifier, ObjectStore};
use crate::error::UploadError;
use crate::layout::LogLayout;
use crate::lock::ProcessLock;
use crate::notify::{format_error_message, notify_best_effort, send_pass_summary};
use crate::run::{check_run, locate_runs, LocatorOptions, RunCheck, RunDirectory};
use crate::samplesheet::{evaluate_samples, SampleVerdict};
use crate::state::{StateStore, UploadRecord};
use crate::transfer::{plan_run, upload_run, TransferOptions, TransferOutcome, UploadTarget};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub layout: LogLayout,
    pub targets: Vec<UploadTarget>,
    pub transfer: TransferOptions,
    /// Treat every subdirectory of a monitored directory as a finished run.
    pub skip_check: bool,
    /// Report what would be uploaded without transferring or recording anything.
    pub dry_run: bool,
}

/// A run a dry-run pass would have uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedUpload {
    pub run_id: String,
    pub run_path: PathBuf,
    pub bucket: String,
    pub remote_prefix: String,
    /// Paths relative to the run directory.
    pub files: Vec<String>,
    /// Whether an earlier pass already uploaded part of the run.
    pub resumed: bool,
}

/// What one pass did, by run id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    /// Runs that finished uploading during this pass.
    pub uploaded: Vec<String>,
    /// Runs that were attempted but still have files outstanding.
    pub incomplete: Vec<String>,
    /// Runs whose record already says they are complete.
    pub skipped: Vec<String>,
    /// Runs the sample filter turned away.
    pub rejected: Vec<String>,
    pub planned: Vec<PlannedUpload>,
}

impl MonitorReport {
    pub fn has_failures(&self) -> bool {
        !self.incomplete.is_empty()
    }
}

struct PendingRun {
    run: RunDirectory,
    target: usize,
    record: Option<UploadRecord>,
}

/// Run one monitoring pass.
///
/// Errors are lock contention, an unwritable log directory, an unreachable
/// bucket and unexpected I/O or state failures. Failures after the lock is
/// taken are also posted to the alert channel.
pub async fn monitor<S, N>(
    settings: &MonitorSettings,
    store: Arc<S>,
    notifier: &N,
) -> Result<MonitorReport, UploadError>
where
    S: ObjectStore + 'static,
    N: Notifier + ?Sized,
{
    info!(
        targets = settings.targets.len(),
        dry_run = settings.dry_run,
        skip_check = settings.skip_check,
        "Beginning monitoring directories for runs to upload"
    );
    settings.layout.ensure_writable()?;
    let lock = ProcessLock::acquire(&settings.layout.lock_path())?;

    let result = run_pass(settings, store, notifier).await;
    if let Err(e) = &result {
        error!(error = %e, "Monitoring pass failed");
        notify_best_effort(notifier, Channel::Alert, &format_error_message(e)).await;
    }

    lock.release();
    result
}

async fn run_pass<S, N>(
    settings: &MonitorSettings,
    store: Arc<S>,
    notifier: &N,
) -> Result<MonitorReport, UploadError>
where
    S: ObjectStore + 'static,
    N: Notifier + ?Sized,
{
    if settings.dry_run {
        info!("Dry run: buckets are not checked and nothing will be uploaded");
    } else {
        let buckets: BTreeSet<&str> = settings.targets.iter().map(|t| t.bucket.as_str()).collect();
        for bucket in buckets {
            check_bucket(store.as_ref(), bucket).await?;
        }
    }

    let state = StateStore::new(settings.layout.state_dir());
    let mut report = MonitorReport::default();
    let pending = find_pending_runs(settings, &state, &mut report)?;

    if pending.is_empty() {
        info!("No sequencing runs requiring upload found");
        return Ok(report);
    }
    info!(
        runs = pending.len(),
        partial = pending.iter().filter(|p| p.record.is_some()).count(),
        "Found sequencing runs to upload"
    );

    for PendingRun { run, target, record } in pending {
        let target = &settings.targets[target];
        if settings.dry_run {
            let files = plan_run(&run, record.as_ref()).await?;
            info!(
                run_id = %run.run_id,
                bucket = %target.bucket,
                remote_prefix = %target.remote_prefix,
                files = files.len(),
                "Dry run: would upload run"
            );
            report.planned.push(PlannedUpload {
                run_id: run.run_id.clone(),
                run_path: run.path.clone(),
                bucket: target.bucket.clone(),
                remote_prefix: target.remote_prefix.clone(),
                files: files.into_iter().map(|f| f.relative).collect(),
                resumed: record.is_some(),
            });
            continue;
        }

        let outcome =
            upload_run(Arc::clone(&store), &state, &run, target, record, &settings.transfer).await?;
        if outcome.is_complete() {
            report.uploaded.push(run.run_id);
        } else {
            report.incomplete.push(run.run_id);
        }
    }

    if !settings.dry_run {
        send_pass_summary(notifier, &report.uploaded, &report.incomplete).await;
    }
    info!(
        uploaded = report.uploaded.len(),
        incomplete = report.incomplete.len(),
        skipped = report.skipped.len(),
        "Finished monitoring pass"
    );
    Ok(report)
}

/// Runs to upload this pass, partially uploaded ones first.
///
/// A run is claimed by the first target whose sample filter accepts it, so two
/// targets watching the same directory can route runs to different buckets.
fn find_pending_runs(
    settings: &MonitorSettings,
    state: &StateStore,
    report: &mut MonitorReport,
) -> Result<Vec<PendingRun>, UploadError> {
    let options = LocatorOptions {
        skip_check: settings.skip_check,
    };
    let mut claimed: HashSet<PathBuf> = HashSet::new();
    let mut skipped: HashSet<PathBuf> = HashSet::new();
    let mut partial = Vec::new();
    let mut new = Vec::new();

    for (index, target) in settings.targets.iter().enumerate() {
        for run in locate_runs(&target.roots, &options) {
            if claimed.contains(&run.path) || skipped.contains(&run.path) {
                continue;
            }

            let verdict = evaluate_samples(&run.path, target.sample_regex.as_ref(), settings.skip_check);
            if let SampleVerdict::Rejected { reason } = verdict {
                info!(run_id = %run.run_id, bucket = %target.bucket, reason, "Run not selected for this target");
                if !report.rejected.contains(&run.run_id) {
                    report.rejected.push(run.run_id.clone());
                }
                continue;
            }
            report.rejected.retain(|id| id != &run.run_id);

            match state.load(&run)? {
                Some(record) if record.completed => {
                    info!(run_id = %run.run_id, "Run has completed uploading and will be skipped");
                    skipped.insert(run.path.clone());
                    report.skipped.push(run.run_id);
                }
                Some(record) => {
                    info!(
                        run_id = %run.run_id,
                        uploaded = record.total_uploaded_files,
                        total = record.total_local_files,
                        "Run has partially uploaded and will be resumed"
                    );
                    claimed.insert(run.path.clone());
                    partial.push(PendingRun {
                        run,
                        target: index,
                        record: Some(record),
                    });
                }
                None => {
                    info!(run_id = %run.run_id, "New run to upload");
                    claimed.insert(run.path.clone());
                    new.push(PendingRun {
                        run,
                        target: index,
                        record: None,
                    });
                }
            }
        }
    }

    partial.extend(new);
    Ok(partial)
}

async fn check_bucket<S>(store: &S, bucket: &str) -> Result<(), UploadError>
where
    S: ObjectStore + ?Sized,
{
    store
        .check_bucket(bucket)
        .await
        .map_err(|e| UploadError::BucketNotAccessible {
            bucket: bucket.to_owned(),
            message: e.to_string(),
        })?;
    info!(bucket, "Bucket is accessible");
    Ok(())
}

/// Upload one named run directory, outside of any monitoring configuration.
///
/// Takes the same process lock as [`monitor`]. A run whose record is already
/// complete is returned as-is without touching the bucket contents.
pub async fn upload_single<S>(
    layout: &LogLayout,
    store: Arc<S>,
    run_path: &Path,
    bucket: &str,
    remote_prefix: &str,
    skip_check: bool,
    options: &TransferOptions,
) -> Result<TransferOutcome, UploadError>
where
    S: ObjectStore + 'static,
{
    layout.ensure_writable()?;
    let lock = ProcessLock::acquire(&layout.lock_path())?;

    let result: Result<TransferOutcome, UploadError> = async {
        if check_run(run_path, &LocatorOptions { skip_check }) != RunCheck::Complete {
            return Err(UploadError::NotASequencingRun(run_path.to_path_buf()));
        }
        let run = RunDirectory::from_path(run_path)?;
        check_bucket(store.as_ref(), bucket).await?;

        let state = StateStore::new(layout.state_dir());
        let record = state.load(&run)?;
        if let Some(record) = record.as_ref().filter(|r| r.completed) {
            info!(run_id = %run.run_id, "Run has already completed uploading");
            return Ok(TransferOutcome {
                record: record.clone(),
                attempted: 0,
                uploaded: 0,
                failed: Vec::new(),
            });
        }

        let target = UploadTarget {
            bucket: bucket.to_owned(),
            remote_prefix: remote_prefix.to_owned(),
            sample_regex: None,
            roots: vec![run.root.clone()],
        };
        upload_run(store, &state, &run, &target, record, options).await
    }
    .await;

    lock.release();
    result
}
