//! Chat webhook subscriber.
//!
//! Relays each outcome to an incoming-webhook URL as `{"Content": <text>}`,
//! the payload shape chat services like Chime accept.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::domain::OutcomeMessage;
use crate::notify::Subscriber;

/// Incoming-webhook client
pub struct WebhookSubscriber {
    endpoint: String,
    client: reqwest::Client,
}

/// Body posted to the webhook
#[derive(Debug, Serialize)]
pub struct WebhookPayload {
    #[serde(rename = "Content")]
    pub content: String,
}

impl WebhookSubscriber {
    /// Create a new client
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
        }
    }

    pub fn payload(message: &OutcomeMessage) -> WebhookPayload {
        WebhookPayload {
            content: message.to_text(),
        }
    }
}

#[async_trait]
impl Subscriber for WebhookSubscriber {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, message: &OutcomeMessage) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&Self::payload(message))
            .send()
            .await
            .context("Failed to post to chat webhook")?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Webhook error ({}): {}", status, text)
        }
    }
}
