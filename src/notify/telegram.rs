//! # notify::telegram
//!
//! Telegram Bot API `sendMessage` with `parse_mode=HTML`.  Everything coming
//! from the terminal or the levels file is escaped; only the title is bold.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AppError;
use crate::models::Priority;
use crate::notify::{check_delivery, Message, Notifier};

const API_BASE: &str = "https://api.telegram.org";

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id:                  &'a str,
    text:                     String,
    parse_mode:               &'static str,
    disable_web_page_preview: bool,
}

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

pub struct TelegramNotifier {
    client:   reqwest::Client,
    token:    String,
    chat_id:  String,
    api_base: String,
}

impl TelegramNotifier {
    pub fn new(client: reqwest::Client, token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            client,
            token:    token.into(),
            chat_id:  chat_id.into(),
            api_base: API_BASE.to_string(),
        }
    }
}

fn indicator(priority: Priority) -> &'static str {
    match priority {
        Priority::Critical => "🚨",
        Priority::Important => "⚠️",
        Priority::Normal => "ℹ️",
    }
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

pub fn format_html(message: &Message) -> String {
    format!(
        "{} <b>{}</b>\n\n{}",
        indicator(message.priority),
        escape_html(&message.title),
        escape_html(&message.body())
    )
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, message: &Message) -> Result<(), AppError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        let body = SendMessage {
            chat_id:                  &self.chat_id,
            text:                     format_html(message),
            parse_mode:               "HTML",
            disable_web_page_preview: true,
        };

        let response = check_delivery("telegram", self.client.post(&url).json(&body).send().await).await?;
        let api: ApiResponse = response
            .json()
            .await
            .map_err(|e| AppError::DeliveryFailed(format!("telegram response parse error: {e}")))?;
        if !api.ok {
            return Err(AppError::DeliveryFailed(format!(
                "telegram: {}",
                api.description.unwrap_or_else(|| "not ok".into())
            )));
        }

        debug!(chat_id = %self.chat_id, "Telegram message sent");
        Ok(())
    }
}
