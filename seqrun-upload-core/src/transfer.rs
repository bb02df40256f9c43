//! Transfer Engine: upload one run's files in parallel and keep the record current.
//!
//! The work list is every regular file under the run that does not already have
//! a matching remote copy in the run's [`UploadRecord`]. It is split across
//! `cores` worker tasks, and each worker keeps up to `threads` transfers in
//! flight. Every file outcome is written back through a single mutex-guarded
//! ledger which persists the record straight away, so a killed process loses at
//! most the transfers that were in flight.
//!
//! # Integrity
//! Entity tags returned for single-part uploads are the MD5 of the content. When
//! the returned tag has that shape it is checked against the local MD5, and a
//! mismatch counts as a failed attempt.
//!
//! # Changed files
//! A file already in `uploaded_files` is uploaded again when its local MD5 no
//! longer matches the stored tag. Tags that are not plain MD5 (multipart uploads
//! from other tools) cannot be compared and are trusted. A changed file loses
//! its stored tag when the attempt starts and only counts as uploaded again once
//! the new copy is confirmed.

use futures::{stream, TryStreamExt};
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn, Instrument};
use walkdir::WalkDir;

use crate::contract::{ObjectStore, PutObject};
use crate::error::UploadError;
use crate::run::RunDirectory;
use crate::state::{StateStore, UploadRecord};

/// Largest object accepted by a single PUT.
pub const MAX_SINGLE_PUT_BYTES: u64 = 5 * 1024 * 1024 * 1024;

const DIGEST_BUFFER_BYTES: usize = 1 << 20;

/// Where a group of monitored directories uploads to.
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub bucket: String,
    pub remote_prefix: String,
    /// Every sample in a run's sample sheet must match for the run to upload.
    pub sample_regex: Option<Regex>,
    pub roots: Vec<PathBuf>,
}

/// Bounded retry with exponential backoff for a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per file, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Number of worker tasks the work list is split across.
    pub cores: usize,
    /// Concurrent transfers per worker.
    pub threads: usize,
    pub retry: RetryPolicy,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            cores: default_cores(),
            threads: 4,
            retry: RetryPolicy::default(),
        }
    }
}

pub fn default_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// A regular file inside a run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    /// Path relative to the run directory, `/`-separated.
    pub relative: String,
    pub size: u64,
}

impl LocalFile {
    /// Key under which this file appears in an [`UploadRecord`].
    pub fn record_key(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// Result of one upload attempt of one run.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub record: UploadRecord,
    /// Files on this attempt's work list.
    pub attempted: usize,
    /// Files confirmed uploaded during this attempt.
    pub uploaded: usize,
    /// Files that exhausted their retries during this attempt.
    pub failed: Vec<String>,
}

impl TransferOutcome {
    pub fn is_complete(&self) -> bool {
        self.record.completed
    }
}

/// Every regular file beneath `run_path`, largest first.
pub fn list_run_files(run_path: &Path) -> io::Result<Vec<LocalFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(run_path) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(run_path)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push(LocalFile {
            path: entry.path().to_path_buf(),
            relative,
            size: entry.metadata().map_err(io::Error::from)?.len(),
        });
    }
    files.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));

    info!(
        run_path = %run_path.display(),
        files = files.len(),
        total_bytes = files.iter().map(|f| f.size).sum::<u64>(),
        "Listed files to upload"
    );
    Ok(files)
}

/// Streamed MD5 of a local file as lowercase hex.
pub fn local_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; DIGEST_BUFFER_BYTES];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// True for a single-part entity tag, which is the content MD5.
pub fn is_plain_md5(digest: &str) -> bool {
    digest.len() == 32 && digest.chars().all(|c| c.is_ascii_hexdigit())
}

/// `remote_prefix/run_id/relative`, without empty segments or a leading slash.
pub fn remote_key(remote_prefix: &str, run_id: &str, relative: &str) -> String {
    remote_prefix
        .split('/')
        .chain(std::iter::once(run_id))
        .chain(relative.split('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Files that still need sending given what `uploaded` already records.
pub fn build_work_list(
    files: Vec<LocalFile>,
    uploaded: &BTreeMap<String, String>,
) -> io::Result<Vec<LocalFile>> {
    let mut work = Vec::new();
    for file in files {
        let Some(stored) = uploaded.get(&file.record_key()) else {
            work.push(file);
            continue;
        };
        if !is_plain_md5(stored) {
            continue;
        }
        let current = local_digest(&file.path)?;
        if !current.eq_ignore_ascii_case(stored) {
            info!(file = %file.path.display(), "Local file changed since upload, will upload again");
            work.push(file);
        }
    }
    Ok(work)
}

/// Split `items` into at most `n` groups, dealing them out in turn.
///
/// With input sorted by size this gives each group a similar mix of large and
/// small files.
pub fn split_by_cores<T>(items: Vec<T>, n: usize) -> Vec<Vec<T>> {
    let n = n.max(1).min(items.len());
    let mut groups: Vec<Vec<T>> = (0..n).map(|_| Vec::new()).collect();
    for (i, item) in items.into_iter().enumerate() {
        groups[i % n].push(item);
    }
    groups
}

async fn enumerate_run(run: &RunDirectory) -> Result<Vec<LocalFile>, UploadError> {
    let path = run.path.clone();
    tokio::task::spawn_blocking(move || list_run_files(&path))
        .await
        .map_err(|e| UploadError::Worker(e.to_string()))?
        .map_err(|source| UploadError::Enumerate {
            path: run.path.clone(),
            source,
        })
}

async fn compute_work_list(
    files: Vec<LocalFile>,
    record: Option<&UploadRecord>,
) -> Result<Vec<LocalFile>, UploadError> {
    let Some(record) = record else {
        return Ok(files);
    };
    let uploaded = record.uploaded_files.clone();
    let work = tokio::task::spawn_blocking(move || build_work_list(files, &uploaded))
        .await
        .map_err(|e| UploadError::Worker(e.to_string()))??;
    Ok(work)
}

/// Files an upload of `run` would send right now. Touches no state.
pub async fn plan_run(
    run: &RunDirectory,
    record: Option<&UploadRecord>,
) -> Result<Vec<LocalFile>, UploadError> {
    let files = enumerate_run(run).await?;
    compute_work_list(files, record).await
}

struct TransferContext {
    bucket: String,
    remote_prefix: String,
    run_id: String,
    retry: RetryPolicy,
}

/// Single writer for the run's record while workers complete concurrently.
struct Ledger {
    record: UploadRecord,
    local: HashSet<String>,
    state: StateStore,
    run: RunDirectory,
    uploaded: usize,
    failed: Vec<String>,
}

impl Ledger {
    /// Apply one file outcome and persist the record. The save completes before
    /// the ledger lock is released.
    async fn settle(&mut self, file: &LocalFile, result: Result<String, String>) -> Result<(), UploadError> {
        let key = file.record_key();
        match result {
            Ok(etag) => {
                debug!(file = %key, etag = %etag, "Uploaded file");
                self.record.record_success(&key, &etag, &self.local);
                self.uploaded += 1;
            }
            Err(e) => {
                error!(file = %key, error = %e, "Failed uploading file, will be retried on the next run");
                self.record.record_failure(&key, &self.local);
                self.failed.push(key);
            }
        }
        persist(&self.state, &self.record, &self.run).await
    }
}

/// Save `record` on the blocking pool; the write is fsynced before rename.
async fn persist(state: &StateStore, record: &UploadRecord, run: &RunDirectory) -> Result<(), UploadError> {
    let (state, record, run) = (state.clone(), record.clone(), run.clone());
    tokio::task::spawn_blocking(move || state.save(&record, &run))
        .await
        .map_err(|e| UploadError::Worker(e.to_string()))??;
    Ok(())
}

/// Upload the files of `run` that are not yet stored remotely.
///
/// `record` is the run's current state (if any). Per-file failures are recorded
/// and do not fail the call; errors returned here are enumeration, worker or
/// state-persistence failures.
pub async fn upload_run<S>(
    store: Arc<S>,
    state: &StateStore,
    run: &RunDirectory,
    target: &UploadTarget,
    record: Option<UploadRecord>,
    options: &TransferOptions,
) -> Result<TransferOutcome, UploadError>
where
    S: ObjectStore + 'static,
{
    let files = enumerate_run(run).await?;
    let local: HashSet<String> = files.iter().map(LocalFile::record_key).collect();
    let work = compute_work_list(files, record.as_ref()).await?;

    let mut record = record.unwrap_or_else(|| UploadRecord::new(run));
    for file in &work {
        record.forget_upload(&file.record_key());
    }
    record.begin_attempt(&local);
    persist(state, &record, run).await?;

    let attempted = work.len();
    let cores = options.cores.max(1);
    let threads = options.threads.max(1);
    info!(
        run_id = %run.run_id,
        bucket = %target.bucket,
        remote_prefix = %target.remote_prefix,
        files = attempted,
        already_uploaded = record.total_uploaded_files,
        cores,
        threads,
        "Beginning upload"
    );

    let ledger = Arc::new(Mutex::new(Ledger {
        record,
        local,
        state: state.clone(),
        run: run.clone(),
        uploaded: 0,
        failed: Vec::new(),
    }));
    let context = Arc::new(TransferContext {
        bucket: target.bucket.clone(),
        remote_prefix: target.remote_prefix.clone(),
        run_id: run.run_id.clone(),
        retry: options.retry,
    });

    let mut workers = Vec::new();
    for (index, group) in split_by_cores(work, cores).into_iter().enumerate() {
        let span = tracing::info_span!("upload_worker", worker = index, files = group.len());
        workers.push(tokio::spawn(
            upload_group(
                group,
                threads,
                Arc::clone(&store),
                Arc::clone(&ledger),
                Arc::clone(&context),
            )
            .instrument(span),
        ));
    }
    for joined in futures::future::join_all(workers).await {
        joined.map_err(|e| UploadError::Worker(e.to_string()))??;
    }

    let mut guard = ledger.lock().await;
    let Ledger {
        record,
        local,
        state,
        run,
        uploaded,
        failed,
    } = &mut *guard;
    record.refresh(local);
    persist(state, record, run).await?;

    if record.completed {
        info!(run_id = %run.run_id, uploaded = *uploaded, total = record.total_local_files, "Run completed uploading");
    } else {
        warn!(
            run_id = %run.run_id,
            uploaded = *uploaded,
            failed = failed.len(),
            remaining = record.remaining(),
            "Run did not complete uploading and will be retried on the next run"
        );
    }

    Ok(TransferOutcome {
        record: record.clone(),
        attempted,
        uploaded: *uploaded,
        failed: failed.clone(),
    })
}

async fn upload_group<S>(
    files: Vec<LocalFile>,
    threads: usize,
    store: Arc<S>,
    ledger: Arc<Mutex<Ledger>>,
    context: Arc<TransferContext>,
) -> Result<(), UploadError>
where
    S: ObjectStore + 'static,
{
    debug!(files = files.len(), threads, "Worker starting");
    stream::iter(files.into_iter().map(Ok::<_, UploadError>))
        .try_for_each_concurrent(threads, |file| {
            let store = Arc::clone(&store);
            let ledger = Arc::clone(&ledger);
            let context = Arc::clone(&context);
            async move {
                let result = transfer_file(store.as_ref(), &context, &file).await;
                ledger.lock().await.settle(&file, result).await?;
                Ok(())
            }
        })
        .await
}

async fn transfer_file<S>(store: &S, context: &TransferContext, file: &LocalFile) -> Result<String, String>
where
    S: ObjectStore + ?Sized,
{
    if file.size > MAX_SINGLE_PUT_BYTES {
        return Err(format!(
            "file is {} bytes, larger than the {} byte single upload limit",
            file.size, MAX_SINGLE_PUT_BYTES
        ));
    }

    let key = remote_key(&context.remote_prefix, &context.run_id, &file.relative);
    let mut attempt = 1;
    loop {
        match put_verified(store, context, file, &key).await {
            Ok(etag) => return Ok(etag),
            Err(e) if attempt < context.retry.attempts => {
                let delay = context.retry.delay_after(attempt);
                warn!(file = %file.path.display(), attempt, error = %e, ?delay, "Upload attempt failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(format!("{e} (after {attempt} attempts)")),
        }
    }
}

async fn put_verified<S>(
    store: &S,
    context: &TransferContext,
    file: &LocalFile,
    key: &str,
) -> Result<String, String>
where
    S: ObjectStore + ?Sized,
{
    debug!(file = %file.path.display(), bucket = %context.bucket, key, "Uploading file");
    let output = store
        .put_object(PutObject {
            bucket: context.bucket.clone(),
            key: key.to_owned(),
            local_path: file.path.clone(),
            size: file.size,
        })
        .await
        .map_err(|e| e.to_string())?;
    let etag = output.etag.trim_matches('"').to_owned();

    if is_plain_md5(&etag) {
        let path = file.path.clone();
        let local = tokio::task::spawn_blocking(move || local_digest(&path))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| format!("failed to checksum local file: {e}"))?;
        if !local.eq_ignore_ascii_case(&etag) {
            return Err(format!("remote entity tag {etag} does not match local MD5 {local}"));
        }
    }
    Ok(etag)
}
