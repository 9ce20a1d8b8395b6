//! # advisor — optional external profit-taking advisor
//!
//! The engine asks the advisor for a one-line recommendation per profit
//! suggestion.  The call is bounded by a timeout; a slow or failing advisor
//! only means the suggestion goes out without a recommendation.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{Position, ProfitSuggestion};

// ─── Request / Response ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct TradeFeatures {
    pub ticket:        u64,
    pub symbol:        String,
    pub side:          &'static str,
    pub volume:        f64,
    pub open_price:    f64,
    pub current_price: f64,
    pub profit:        f64,
    pub profit_pct:    f64,
    pub held_secs:     i64,
}

impl TradeFeatures {
    pub fn from_position(position: &Position, suggestion: &ProfitSuggestion, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            ticket:        position.ticket,
            symbol:        position.symbol.clone(),
            side:          position.side.as_str(),
            volume:        position.volume,
            open_price:    position.open_price,
            current_price: position.current_price,
            profit:        position.profit,
            profit_pct:    suggestion.profit_pct,
            held_secs:     (now - position.open_time).num_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Recommendation {
    /// e.g. "close_half", "hold", "trail_stop"
    pub action: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub rationale: Option<String>,
}

impl Recommendation {
    pub fn summary(&self) -> String {
        let mut text = self.action.replace('_', " ");
        if let Some(c) = self.confidence {
            text.push_str(&format!(" ({:.0}%)", c * 100.0));
        }
        if let Some(r) = self.rationale.as_deref().filter(|r| !r.is_empty()) {
            text.push_str(" — ");
            text.push_str(r);
        }
        text
    }
}

// ─── Advisor trait ────────────────────────────────────────────────────────────

#[async_trait]
pub trait ProfitAdvisor: Send + Sync {
    async fn recommend(&self, features: &TradeFeatures) -> anyhow::Result<Recommendation>;
}

/// POSTs the features as JSON, expects a [`Recommendation`] back.
pub struct HttpAdvisor {
    client: reqwest::Client,
    url:    String,
}

impl HttpAdvisor {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into() }
    }
}

#[async_trait]
impl ProfitAdvisor for HttpAdvisor {
    async fn recommend(&self, features: &TradeFeatures) -> anyhow::Result<Recommendation> {
        debug!(ticket = features.ticket, "Calling profit advisor...");

        let resp = self
            .client
            .post(&self.url)
            .json(features)
            .send()
            .await
            .context("advisor request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("advisor error {status}: {text}");
        }

        resp.json().await.context("advisor response parse error")
    }
}

/// Ask the advisor, giving up after `timeout`.
pub async fn advise(
    advisor: &dyn ProfitAdvisor,
    features: &TradeFeatures,
    timeout: Duration,
) -> Option<String> {
    match tokio::time::timeout(timeout, advisor.recommend(features)).await {
        Ok(Ok(rec)) => Some(rec.summary()),
        Ok(Err(e)) => {
            warn!(ticket = features.ticket, error = %e, "Advisor failed — suggestion sent without it");
            None
        }
        Err(_) => {
            warn!(ticket = features.ticket, timeout_ms = timeout.as_millis() as u64, "Advisor timed out");
            None
        }
    }
}
