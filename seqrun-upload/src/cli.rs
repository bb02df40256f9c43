//! # seqrun-upload CLI interface
//!
//! Command parsing and the async [`run`] entrypoint. All upload logic lives in
//! `seqrun-upload-core`; this module wires the real S3 and Slack clients into it.
//!
//! - `upload` sends one run directory to a bucket.
//! - `monitor` performs one scheduled pass over the directories in a config file.
//!   Scheduling itself (cron, systemd timers) is external.
//!
//! Any failure, including a run left incomplete, is returned as an error so the
//! process exits non-zero.

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use seqrun_upload_core::transfer::default_cores;
use seqrun_upload_core::{monitor, upload_single, LogLayout, RetryPolicy, TransferOptions};

use crate::load_config::{load_config, DEFAULT_THREADS};
use crate::slack::SlackNotifier;
use crate::upload::S3Client;

pub const DEFAULT_LOG_DIR: &str = "/var/log/seqrun_upload";

/// Upload completed Illumina sequencing runs into S3.
#[derive(Parser, Debug)]
#[clap(
    name = "seqrun-upload",
    version,
    about = "Upload completed Illumina sequencing runs into S3, on demand or on a monitoring schedule"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Upload a single run directory
    Upload {
        /// Run directory to upload
        #[clap(long)]
        local_path: PathBuf,
        /// Destination bucket
        #[clap(long)]
        bucket: String,
        /// Key prefix the run is placed under
        #[clap(long, default_value = "/")]
        remote_path: String,
        /// Upload the directory even if it does not look like a finished run
        #[clap(long)]
        skip_check: bool,
        /// Number of upload workers (defaults to the number of CPUs)
        #[clap(long)]
        cores: Option<usize>,
        /// Concurrent transfers per worker
        #[clap(long, default_value_t = DEFAULT_THREADS)]
        threads: usize,
        /// Directory for the lock, log file and upload state
        #[clap(long, default_value = DEFAULT_LOG_DIR)]
        log_dir: PathBuf,
    },
    /// Run one monitoring pass over the directories in a config file
    Monitor {
        /// Path to the JSON config file
        #[clap(long)]
        config: PathBuf,
        /// Report what would be uploaded without uploading or recording anything
        #[clap(long)]
        dry_run: bool,
    },
}

impl Cli {
    /// Log directory this invocation will write to, if it can be known up front.
    pub fn log_dir(&self) -> Option<PathBuf> {
        match &self.command {
            Commands::Upload { log_dir, .. } => Some(log_dir.clone()),
            Commands::Monitor { config, .. } => load_config(config).ok().and_then(|c| c.log_dir),
        }
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Upload {
            local_path,
            bucket,
            remote_path,
            skip_check,
            cores,
            threads,
            log_dir,
        } => {
            tracing::info!(command = "upload", local_path = %local_path.display(), bucket = %bucket, "Starting single run upload");
            let store = S3Client::new_from_env()
                .map_err(|e| anyhow!("Failed to construct S3 client from env: {e}"))?;
            let options = TransferOptions {
                cores: cores.filter(|n| *n > 0).unwrap_or_else(default_cores),
                threads: threads.max(1),
                retry: RetryPolicy::default(),
            };

            let outcome = upload_single(
                &LogLayout::new(log_dir),
                Arc::new(store),
                &local_path,
                &bucket,
                &remote_path,
                skip_check,
                &options,
            )
            .await?;

            if !outcome.is_complete() {
                tracing::error!(command = "upload", failed = outcome.failed.len(), "Upload incomplete");
                bail!(
                    "{} file(s) failed to upload for run {}",
                    outcome.record.total_failed_upload,
                    outcome.record.run_id
                );
            }
            tracing::info!(command = "upload", run_id = %outcome.record.run_id, uploaded = outcome.uploaded, "Upload complete");
            Ok(())
        }
        Commands::Monitor { config, dry_run } => {
            let config = load_config(config)?;
            tracing::info!(command = "monitor", dry_run, "Starting monitoring pass");
            let notifier = SlackNotifier::new(
                config.slack_log_webhook.clone(),
                config.slack_alert_webhook.clone(),
            )
            .map_err(|e| anyhow!("Failed to construct Slack notifier: {e}"))?;
            let settings = config.into_settings(dry_run)?;
            let store = S3Client::new_from_env()
                .map_err(|e| anyhow!("Failed to construct S3 client from env: {e}"))?;

            let report = monitor(&settings, Arc::new(store), &notifier).await?;

            for planned in &report.planned {
                tracing::info!(
                    command = "monitor",
                    run_id = %planned.run_id,
                    bucket = %planned.bucket,
                    remote_path = %planned.remote_prefix,
                    files = planned.files.len(),
                    resumed = planned.resumed,
                    "Dry run: planned upload"
                );
                for file in &planned.files {
                    tracing::info!(command = "monitor", run_id = %planned.run_id, file = %file, "Dry run: would upload file");
                }
            }
            if report.has_failures() {
                tracing::error!(command = "monitor", incomplete = ?report.incomplete, "Monitoring pass left runs incomplete");
                bail!("runs left incomplete: {}", report.incomplete.join(", "));
            }
            tracing::info!(command = "monitor", ?report, "Monitoring pass complete");
            Ok(())
        }
    }
}
