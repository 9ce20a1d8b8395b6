//! # notify
//!
//! Outbound notification channels and the dispatcher that feeds them.
//!
//! - [`render`]     — event → channel-neutral [`Message`]
//! - [`telegram`]   — Telegram Bot API (HTML)
//! - [`webhook`]    — Discord webhook and plain JSON webhook
//! - [`email`]      — SMTP via lettre
//! - [`dispatcher`] — grouping, timeouts, bounded retries

pub mod dispatcher;
pub mod email;
pub mod render;
pub mod telegram;
pub mod webhook;

use async_trait::async_trait;

use crate::error::AppError;
use crate::models::Priority;

pub use dispatcher::{DeliveryReport, DispatchConfig, Dispatcher};

/// Channel-neutral rendered alert.  Body lines are plain text; each channel
/// applies its own markup and priority indicator.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub title: String,
    pub lines: Vec<String>,
    pub priority: Priority,
}

impl Message {
    pub fn body(&self) -> String {
        self.lines.join("\n")
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel name for logs and delivery stats.
    fn name(&self) -> &'static str;
    async fn send(&self, message: &Message) -> Result<(), AppError>;
}

/// Map a reqwest outcome to `DeliveryFailed`, checking the HTTP status.
pub(crate) async fn check_delivery(
    channel: &str,
    result: Result<reqwest::Response, reqwest::Error>,
) -> Result<reqwest::Response, AppError> {
    let response = result.map_err(|e| AppError::DeliveryFailed(format!("{channel}: {e}")))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::DeliveryFailed(format!("{channel} HTTP {status}: {body}")));
    }
    Ok(response)
}
