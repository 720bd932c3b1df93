use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use super::{Notification, NotifyBackend};

/// Posts notifications as JSON to an incoming-webhook URL.
pub struct WebhookBackend {
    webhook_url: String,
    http: reqwest::Client,
}

impl WebhookBackend {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotifyBackend for WebhookBackend {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        let payload = json!({
            "text": notification.summary(),
            "code": notification.code(),
            "notification": notification,
        });

        let resp = self
            .http
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Notification webhook returned non-success");
            anyhow::bail!("Notification webhook returned {status}");
        }

        Ok(())
    }
}
