//! # contract: backend interfaces for object storage and notifications
//!
//! This module defines the two seams between the core engine and the outside
//! world: [`ObjectStore`] (where run files are written) and [`Notifier`]
//! (where pass summaries and alerts are posted).
//!
//! ## Interface & Extensibility
//! - Implement [`ObjectStore`] to add a storage backend (the CLI crate ships an S3 client).
//! - Implement [`Notifier`] to add a delivery channel (the CLI crate ships a Slack webhook client).
//! - All methods are async and return boxed error types, so any transport error can be surfaced.
//!
//! ## Mocking & Testing
//! - Both traits are annotated for `mockall`; `MockObjectStore` and `MockNotifier`
//!   are exported under the default `test-export-mocks` feature.

use async_trait::async_trait;
use std::path::PathBuf;

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

/// Error type used at the backend boundary.
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// A single object write: one local file streamed to one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutObject {
    pub bucket: String,
    /// Full object key, without a leading slash.
    pub key: String,
    /// Local file to stream; implementors must not buffer it whole.
    pub local_path: PathBuf,
    /// Size of the local file in bytes, as seen at enumeration time.
    pub size: u64,
}

/// What the backend reports back after a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutObjectOutput {
    /// Server-computed entity tag, quotes stripped.
    pub etag: String,
}

/// Trait for writing run files into a bucket.
///
/// The implementor is responsible for authentication, transport and streaming.
/// The trait is `Send` + `Sync` so one client can be shared by every transfer worker.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Confirm the bucket exists and the configured credentials can reach it.
    async fn check_bucket(&self, bucket: &str) -> Result<(), BackendError>;

    /// Stream one local file to `bucket/key`, returning the remote entity tag.
    async fn put_object(&self, req: PutObject) -> Result<PutObjectOutput, BackendError>;
}

/// Notification channels a pass may post to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Routine summaries of what was uploaded.
    Log,
    /// Failures needing someone to look.
    Alert,
}

/// Trait for delivering human-readable notifications about a pass.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, channel: Channel, message: &str) -> Result<(), BackendError>;
}

/// Notifier that drops every message; used when no webhooks are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, channel: Channel, message: &str) -> Result<(), BackendError> {
        tracing::debug!(?channel, message, "No notifier configured, dropping message");
        Ok(())
    }
}
