//! # models::order
//!
//! Pending orders as reported by the terminal.  Same ticket-identity
//! lifecycle as [`Position`](super::Position), except that a disappearing
//! order is ambiguous: it was either filled or expired/cancelled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Side;

// ─── OrderType ────────────────────────────────────────────────────────────────

/// MQL5 `ENUM_ORDER_TYPE` restricted to pending types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    BuyLimit,
    SellLimit,
    BuyStop,
    SellStop,
    BuyStopLimit,
    SellStopLimit,
}

impl OrderType {
    /// Side of the position this order opens when filled.
    pub fn side(&self) -> Side {
        match self {
            OrderType::BuyLimit | OrderType::BuyStop | OrderType::BuyStopLimit => Side::Buy,
            OrderType::SellLimit | OrderType::SellStop | OrderType::SellStopLimit => Side::Sell,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OrderType::BuyLimit => "BUY LIMIT",
            OrderType::SellLimit => "SELL LIMIT",
            OrderType::BuyStop => "BUY STOP",
            OrderType::SellStop => "SELL STOP",
            OrderType::BuyStopLimit => "BUY STOP LIMIT",
            OrderType::SellStopLimit => "SELL STOP LIMIT",
        }
    }
}

// ─── Order ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub ticket: u64,
    pub symbol: String,
    pub order_type: OrderType,
    pub volume: f64,
    /// Trigger / limit price.
    pub price: f64,
    pub setup_time: DateTime<Utc>,
    /// `None` = good-till-cancelled.
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}

impl Order {
    pub fn is_well_formed(&self) -> bool {
        self.volume.is_finite() && self.volume > 0.0 && self.price.is_finite()
    }

    /// `true` once the expiration timestamp has passed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration.map_or(false, |exp| exp <= now)
    }
}
