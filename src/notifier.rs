//! Outbound admin messages

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{error, info};

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Best-effort; failures are logged, never returned
    async fn post_message(&self, text: &str);
}

/// Posts to a Discord-style webhook
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    webhook_url: String,
}

impl WebhookNotifier {
    pub fn new(webhook_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            webhook_url: webhook_url.to_string(),
        })
    }

    async fn send(&self, text: &str) -> anyhow::Result<()> {
        let payload = serde_json::json!({ "content": text });
        let response = self.client.post(&self.webhook_url).json(&payload).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(anyhow::anyhow!("Webhook post failed: {} - {}", status, body))
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn post_message(&self, text: &str) {
        if let Err(e) = self.send(text).await {
            error!("Failed to post admin message: {}", e);
        }
    }
}

/// Writes admin messages to the log only
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn post_message(&self, text: &str) {
        info!("[admin] {}", text);
    }
}
