//! # notify::webhook
//!
//! Two flavours of HTTP webhook:
//! - **Discord** — `{ "content": "..." }` with markdown bold title
//! - **JSON**    — `{ "priority", "title", "message", "source" }` for anything else

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::error::AppError;
use crate::models::Priority;
use crate::notify::{check_delivery, Message, Notifier};

/// Discord caps message content at 2000 characters.
const DISCORD_MAX_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Discord,
    Json,
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url:    String,
    flavor: Flavor,
}

impl WebhookNotifier {
    pub fn discord(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into(), flavor: Flavor::Discord }
    }

    pub fn json(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into(), flavor: Flavor::Json }
    }

    pub fn payload(&self, message: &Message) -> serde_json::Value {
        match self.flavor {
            Flavor::Discord => {
                let indicator = match message.priority {
                    Priority::Critical => "🔴",
                    Priority::Important => "🟡",
                    Priority::Normal => "🔵",
                };
                let content = format!("{indicator} **{}**\n{}", message.title, message.body());
                json!({ "content": truncate(&content, DISCORD_MAX_CHARS) })
            }
            Flavor::Json => json!({
                "priority": match message.priority {
                    Priority::Critical => "CRITICAL",
                    Priority::Important => "IMPORTANT",
                    Priority::Normal => "NORMAL",
                },
                "title":   message.title,
                "message": message.body(),
                "source":  "sentinel",
            }),
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars - 1).collect();
    out.push('…');
    out
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        match self.flavor {
            Flavor::Discord => "discord",
            Flavor::Json => "webhook",
        }
    }

    async fn send(&self, message: &Message) -> Result<(), AppError> {
        let payload = self.payload(message);
        check_delivery(self.name(), self.client.post(&self.url).json(&payload).send().await).await?;
        debug!(channel = self.name(), "Webhook delivered");
        Ok(())
    }
}
