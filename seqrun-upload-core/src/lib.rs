#![doc = "seqrun-upload-core: core logic library for seqrun-upload."]

//! This crate contains the upload orchestration and resumable-state engine:
//! discovering completed sequencing runs, filtering them on their sample sheet,
//! persisting per-file upload progress and transferring run files in parallel.
//! Storage and notification backends are reached only through the traits in
//! [`contract`], so the CLI crate supplies the real clients and tests supply mocks.
//!
//! # Usage
//! Drive a scheduled pass with [`monitor::monitor`] or a single run with
//! [`monitor::upload_single`].

pub mod contract;
pub mod error;
pub mod layout;
pub mod lock;
pub mod monitor;
pub mod notify;
pub mod run;
pub mod samplesheet;
pub mod state;
pub mod transfer;

pub use contract::{Channel, Notifier, ObjectStore, PutObject, PutObjectOutput};
pub use error::UploadError;
pub use layout::LogLayout;
pub use monitor::{monitor, upload_single, MonitorReport, MonitorSettings, PlannedUpload};
pub use run::{LocatorOptions, RunDirectory};
pub use state::{StateStore, UploadRecord};
pub use transfer::{RetryPolicy, TransferOptions, TransferOutcome, UploadTarget};
