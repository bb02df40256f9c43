//! `load_config` module: loads the JSON monitoring config and maps it onto the
//! core [`MonitorSettings`].
//!
//! This module is the only place where the user-supplied config file is parsed.
//! [`verify_config`] reports every problem in one go so a broken config can be
//! fixed in a single edit.
//!
//! ```json
//! {
//!   "max_cores": 4,
//!   "max_threads": 8,
//!   "log_dir": "/var/log/seqrun_upload",
//!   "slack_log_webhook": "https://hooks.slack.com/services/...",
//!   "slack_alert_webhook": "https://hooks.slack.com/services/...",
//!   "monitor": [
//!     {
//!       "monitored_directories": ["/genetics/novaseq"],
//!       "bucket": "sequencing-runs",
//!       "remote_path": "/novaseq",
//!       "sample_regex": "_assay_1_code_"
//!     }
//!   ]
//! }
//! ```

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use seqrun_upload_core::transfer::default_cores;
use seqrun_upload_core::{LogLayout, MonitorSettings, RetryPolicy, TransferOptions, UploadTarget};

pub const DEFAULT_THREADS: usize = 4;

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub max_cores: Option<i64>,
    #[serde(default)]
    pub max_threads: Option<i64>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub skip_check: bool,
    #[serde(default)]
    pub slack_log_webhook: Option<String>,
    #[serde(default)]
    pub slack_alert_webhook: Option<String>,
    #[serde(default)]
    pub monitor: Vec<MonitorEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorEntry {
    #[serde(default)]
    pub monitored_directories: Vec<PathBuf>,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub remote_path: String,
    #[serde(default)]
    pub sample_regex: Option<String>,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<MonitorConfig> {
    let path = path.as_ref();
    info!(config_path = ?path, "Loading configuration from file");

    let contents = fs::read_to_string(path).map_err(|e| {
        error!(error = ?e, config_path = ?path, "Failed to read config file");
        anyhow!("Failed to read config file {:?}: {}", path, e)
    })?;

    let config: MonitorConfig = serde_json::from_str(&contents).map_err(|e| {
        error!(error = ?e, config_path = ?path, "Failed to parse config JSON");
        anyhow!("Failed to parse config JSON {:?}: {e}", path)
    })?;

    verify_config(&config)?;
    info!(config_path = ?path, targets = config.monitor.len(), "Config loaded and verified");
    Ok(config)
}

/// Check every field and fail with all problems listed together.
pub fn verify_config(config: &MonitorConfig) -> Result<()> {
    let mut errors = Vec::new();

    if matches!(config.max_cores, Some(n) if n < 1) {
        errors.push("max_cores must be a positive integer".to_string());
    }
    if matches!(config.max_threads, Some(n) if n < 1) {
        errors.push("max_threads must be a positive integer".to_string());
    }
    match &config.log_dir {
        None => errors.push("log_dir missing".to_string()),
        Some(dir) if dir.as_os_str().is_empty() => errors.push("log_dir is empty".to_string()),
        Some(_) => {}
    }

    if config.monitor.is_empty() {
        errors.push("monitor section missing or empty".to_string());
    }
    for (i, entry) in config.monitor.iter().enumerate() {
        let at = format!("monitor[{i}]");
        if entry.monitored_directories.is_empty() {
            errors.push(format!("{at}: no monitored_directories given"));
        }
        for dir in &entry.monitored_directories {
            if !dir.is_absolute() {
                errors.push(format!(
                    "{at}: monitored directory {} is not an absolute path",
                    dir.display()
                ));
            }
        }
        if entry.bucket.trim().is_empty() {
            errors.push(format!("{at}: bucket missing"));
        }
        if entry.remote_path.trim().is_empty() {
            errors.push(format!("{at}: remote_path missing"));
        }
        if let Some(pattern) = &entry.sample_regex {
            if let Err(e) = Regex::new(pattern) {
                errors.push(format!("{at}: invalid sample_regex {pattern:?}: {e}"));
            }
        }
    }

    if errors.is_empty() {
        return Ok(());
    }
    error!(count = errors.len(), ?errors, "Config is invalid");
    bail!("Invalid config:\n\t{}", errors.join("\n\t"))
}

impl MonitorConfig {
    pub fn log_layout(&self) -> Result<LogLayout> {
        self.log_dir
            .clone()
            .map(LogLayout::new)
            .context("log_dir missing from config")
    }

    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            cores: positive(self.max_cores).unwrap_or_else(default_cores),
            threads: positive(self.max_threads).unwrap_or(DEFAULT_THREADS),
            retry: RetryPolicy::default(),
        }
    }

    /// Resolve into the settings for one monitoring pass.
    pub fn into_settings(self, dry_run: bool) -> Result<MonitorSettings> {
        let layout = self.log_layout()?;
        let transfer = self.transfer_options();

        let targets = self
            .monitor
            .into_iter()
            .map(|entry| {
                let sample_regex = entry
                    .sample_regex
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .with_context(|| format!("invalid sample_regex for bucket {}", entry.bucket))?;
                Ok(UploadTarget {
                    bucket: entry.bucket,
                    remote_prefix: entry.remote_path,
                    sample_regex,
                    roots: entry.monitored_directories,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(MonitorSettings {
            layout,
            targets,
            transfer,
            skip_check: self.skip_check,
            dry_run,
        })
    }
}

fn positive(value: Option<i64>) -> Option<usize> {
    value.and_then(|n| usize::try_from(n).ok()).filter(|n| *n > 0)
}
