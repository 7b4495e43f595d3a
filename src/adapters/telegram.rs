//! Telegram bot notifications
//!
//! Sends alert text to one chat through the Bot API `sendMessage` call.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::{Secret, TelegramConfig};
use crate::supervisor::AlertChannel;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    bot_token: Secret,
    chat_id: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

impl TelegramNotifier {
    pub fn new(bot_token: Secret, chat_id: impl Into<String>) -> Arc<Self> {
        Self::with_api_base(DEFAULT_API_BASE, bot_token, chat_id)
    }

    pub fn with_api_base(
        api_base: impl Into<String>,
        bot_token: Secret,
        chat_id: impl Into<String>,
    ) -> Arc<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Arc::new(Self {
            client,
            api_base: api_base.into(),
            bot_token,
            chat_id: chat_id.into(),
        })
    }

    /// Build from config; `None` when disabled or incomplete
    pub fn from_config(config: &TelegramConfig) -> Option<Arc<Self>> {
        if !config.enabled {
            return None;
        }
        match (&config.bot_token, &config.chat_id) {
            (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
                info!("Telegram notifications enabled");
                let base = config
                    .api_base
                    .clone()
                    .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
                Some(Self::with_api_base(base, token.clone(), chat_id.clone()))
            }
            _ => {
                error!("Telegram enabled but bot_token/chat_id missing; notifications disabled");
                None
            }
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.bot_token.expose()
        )
    }

    pub async fn send_message(&self, text: &str) -> Result<(), String> {
        let body = SendMessage {
            chat_id: &self.chat_id,
            text,
            disable_web_page_preview: true,
        };

        match self.client.post(self.endpoint()).json(&body).send().await {
            Ok(resp) => {
                if resp.status().is_success() {
                    debug!("Telegram notification sent");
                    Ok(())
                } else {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    Err(format!("HTTP {}: {}", status, body))
                }
            }
            // reqwest errors can embed the URL, which carries the token
            Err(e) => Err(format!("request failed: {}", e.without_url())),
        }
    }
}

#[async_trait]
impl AlertChannel for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, text: &str) -> Result<(), String> {
        self.send_message(text).await
    }
}
