//! Slack incoming-webhook delivery for pass summaries and alerts.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use seqrun_upload_core::contract::{BackendError, Channel, Notifier};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Posts `{"text": message}` to the webhook configured for each channel.
///
/// A channel without a webhook drops its messages.
#[derive(Debug, Clone)]
pub struct SlackNotifier {
    client: reqwest::Client,
    log_webhook: Option<String>,
    alert_webhook: Option<String>,
}

impl SlackNotifier {
    pub fn new(log_webhook: Option<String>, alert_webhook: Option<String>) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        tracing::info!(
            log_webhook_set = log_webhook.is_some(),
            alert_webhook_set = alert_webhook.is_some(),
            "Initialised Slack notifier"
        );
        Ok(Self {
            client,
            log_webhook,
            alert_webhook,
        })
    }

    fn webhook(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Log => self.log_webhook.as_deref(),
            Channel::Alert => self.alert_webhook.as_deref(),
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, channel: Channel, message: &str) -> Result<(), BackendError> {
        let Some(url) = self.webhook(channel) else {
            tracing::debug!(?channel, "No Slack webhook configured for channel");
            return Ok(());
        };

        tracing::info!(?channel, "Sending Slack notification");
        let response = self
            .client
            .post(url)
            .json(&json!({ "text": message }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(?channel, %status, "Slack webhook rejected notification");
            return Err(format!("Slack webhook returned {status}").into());
        }
        Ok(())
    }
}
