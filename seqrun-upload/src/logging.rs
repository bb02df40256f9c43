//! Tracing setup for the binary: stdout plus an appended file under the log dir.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use seqrun_upload_core::LogLayout;

fn open_log_file(log_dir: &Path) -> io::Result<File> {
    fs::create_dir_all(log_dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(LogLayout::new(log_dir).log_file())
}

/// Install the global subscriber. `RUST_LOG` overrides the default `info` level.
///
/// If the log file cannot be opened the subscriber logs to stdout only; the
/// upload itself reports the unwritable directory.
pub fn init_logging(log_dir: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file, file_error) = match log_dir.map(open_log_file) {
        Some(Ok(file)) => (Some(file), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };
    let file_layer = file.map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()?;

    if let Some(e) = file_error {
        tracing::warn!(error = %e, "Could not open log file, logging to stdout only");
    }
    Ok(())
}
