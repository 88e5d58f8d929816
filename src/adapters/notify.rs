use serde_json::json;
use std::time::Duration;

use super::{Notification, NotificationKind, Notifier};
use crate::errors::NotifyError;

/// Writes notifications to the process log. Used when no webhook is set.
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        match notification.kind {
            NotificationKind::RunCompleted => log::info!("{notification}"),
            NotificationKind::Escalation | NotificationKind::RunFailed => {
                log::warn!("operator attention needed: {notification}")
            }
        }
        Ok(())
    }
}

/// Posts notifications as JSON to a chat or paging webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let body = json!({
            "text": notification.to_string(),
            "kind": notification.kind,
            "run_id": notification.run_id,
            "stage": notification.stage,
            "message": notification.message,
        });
        let res = self.client.post(&self.url).json(&body).send().await?;
        if !res.status().is_success() {
            return Err(NotifyError::Status(res.status().as_u16()));
        }
        Ok(())
    }
}
