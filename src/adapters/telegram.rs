//! Telegram subscriber for workflow outcomes.
//!
//! Posts the one-line outcome text to a chat with the Bot API `sendMessage`
//! method. Failures are sent with sound; successes are delivered silently.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::OutcomeMessage;
use crate::notify::Subscriber;

const API_BASE: &str = "https://api.telegram.org";

/// Bot credentials and destination chat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

/// `sendMessage` request body
#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    disable_notification: bool,
    disable_web_page_preview: bool,
}

/// Bot API envelope; only the error side is inspected
#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    description: Option<String>,
}

/// Delivers outcomes to one Telegram chat
pub struct TelegramSubscriber {
    config: TelegramConfig,
    client: reqwest::Client,
}

impl TelegramSubscriber {
    pub fn from_config(config: TelegramConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn send_message_url(&self) -> String {
        format!("{}/bot{}/sendMessage", API_BASE, self.config.bot_token)
    }

    fn request<'a>(&'a self, message: &OutcomeMessage) -> SendMessage<'a> {
        SendMessage {
            chat_id: &self.config.chat_id,
            text: message.to_text(),
            disable_notification: message.outcome.is_success(),
            disable_web_page_preview: true,
        }
    }
}

#[async_trait]
impl Subscriber for TelegramSubscriber {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn deliver(&self, message: &OutcomeMessage) -> Result<()> {
        let reply: ApiReply = self
            .client
            .post(self.send_message_url())
            .json(&self.request(message))
            .send()
            .await
            .context("Failed to reach Telegram")?
            .json()
            .await
            .context("Failed to parse Telegram reply")?;

        if !reply.ok {
            anyhow::bail!(
                "Telegram rejected message: {}",
                reply.description.unwrap_or_default()
            );
        }

        Ok(())
    }
}
