// Notification Delivery - Channels used by `notify` steps

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{WorkflowError, WorkflowResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyChannel {
    #[default]
    Email,
    Webhook,
    Log,
}

/// A rendered message ready for delivery. Serialized as the webhook body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(skip)]
    pub channel: NotifyChannel,
    pub realm_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub step_position: usize,
    pub resource_id: Uuid,
    pub username: String,
    pub recipient: Option<String>,
    pub subject: String,
    pub message: String,
    #[serde(skip)]
    pub url: Option<String>,
}

/// Delivery failures are retryable `Execution` errors
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> WorkflowResult<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> WorkflowResult<()> {
        info!(
            "Workflow {} notification for {} ({}): {} - {}",
            notification.workflow_name,
            notification.username,
            notification.recipient.as_deref().unwrap_or("no address"),
            notification.subject,
            notification.message
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> WorkflowResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WorkflowError::invalid(format!("failed to build webhook client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> WorkflowResult<()> {
        let url = notification
            .url
            .as_deref()
            .ok_or_else(|| WorkflowError::invalid("webhook notification requires a url"))?;

        let response = self
            .client
            .post(url)
            .json(notification)
            .send()
            .await
            .map_err(|e| WorkflowError::execution(format!("webhook {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WorkflowError::execution(format!(
                "webhook {} responded with {}",
                url, status
            )));
        }

        info!("Webhook delivered to {} ({})", url, status.as_u16());
        Ok(())
    }
}

/// Routes each notification to the notifier for its channel
pub struct ChannelNotifier {
    email: Option<Arc<dyn Notifier>>,
    webhook: Arc<dyn Notifier>,
    log: Arc<dyn Notifier>,
}

impl ChannelNotifier {
    pub fn new(email: Option<Arc<dyn Notifier>>, webhook: Arc<dyn Notifier>) -> Self {
        Self {
            email,
            webhook,
            log: Arc::new(LogNotifier),
        }
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, notification: &Notification) -> WorkflowResult<()> {
        match notification.channel {
            NotifyChannel::Email => match &self.email {
                Some(email) => email.notify(notification).await,
                None => {
                    warn!("SMTP is not configured; logging email notification instead");
                    self.log.notify(notification).await
                }
            },
            NotifyChannel::Webhook => self.webhook.notify(notification).await,
            NotifyChannel::Log => self.log.notify(notification).await,
        }
    }
}
