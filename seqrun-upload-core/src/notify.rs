//! Human-readable pass summaries and their delivery.

use tracing::{debug, warn};

use crate::contract::{Channel, Notifier};

const BULLET: &str = "\n\t:black_square: ";

/// Summary of a pass: runs that finished uploading and runs that did not.
///
/// Returns an empty string when both lists are empty.
pub fn format_message(completed: &[String], failed: &[String]) -> String {
    let mut sections = Vec::new();
    if !completed.is_empty() {
        sections.push(format!(
            ":white_check_mark: S3 Upload: Successfully uploaded {} runs{}{}",
            completed.len(),
            BULLET,
            completed.join(BULLET)
        ));
    }
    if !failed.is_empty() {
        sections.push(format!(
            ":x: S3 Upload: Failed uploading {} runs{}{}",
            failed.len(),
            BULLET,
            failed.join(BULLET)
        ));
    }
    sections.join("\n\n")
}

pub fn format_error_message(error: &dyn std::fmt::Display) -> String {
    format!(":x: S3 Upload: Error in monitoring: {error}")
}

/// Post `message`, logging rather than returning a delivery failure.
pub async fn notify_best_effort<N>(notifier: &N, channel: Channel, message: &str)
where
    N: Notifier + ?Sized,
{
    if message.is_empty() {
        return;
    }
    match notifier.notify(channel, message).await {
        Ok(()) => debug!(?channel, "Sent notification"),
        Err(e) => warn!(?channel, error = %e, "Failed to send notification"),
    }
}

/// Post the pass summary to the log channel, and failures to the alert channel.
pub async fn send_pass_summary<N>(notifier: &N, completed: &[String], failed: &[String])
where
    N: Notifier + ?Sized,
{
    notify_best_effort(notifier, Channel::Log, &format_message(completed, failed)).await;
    if !failed.is_empty() {
        notify_best_effort(notifier, Channel::Alert, &format_message(&[], failed)).await;
    }
}
