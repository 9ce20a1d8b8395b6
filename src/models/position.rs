//! # models::position
//!
//! Defines [`Position`], one open position as reported by the MT5 terminal
//! on a single poll.
//!
//! Identity is the `ticket`.  A position is "born" the first time its ticket
//! shows up in a snapshot and "dies" when the ticket disappears; the State
//! Differ turns those transitions into events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Side ─────────────────────────────────────────────────────────────────────

/// Market side of a position (and of the order that opens it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

// ─── Position ─────────────────────────────────────────────────────────────────

/// An open position, mirroring the fields of MQL5 `PositionGetXXX()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Terminal ticket, unique within the account at any instant.
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    /// Volume in lots, e.g. `0.10`.
    pub volume: f64,
    pub open_price: f64,
    pub open_time: DateTime<Utc>,
    pub current_price: f64,
    /// Floating profit in account currency.
    pub profit: f64,
    /// Stop-loss price; `None` when MT5 reports `0.0` (not set).
    #[serde(default)]
    pub stop_loss: Option<f64>,
    /// Take-profit price; `None` when not set.
    #[serde(default)]
    pub take_profit: Option<f64>,
}

impl Position {
    /// `false` when a numeric field is NaN/∞ or the volume is not positive.
    /// Malformed entries are kept as "present" by the differ but never diffed
    /// field-by-field.
    pub fn is_well_formed(&self) -> bool {
        self.volume.is_finite()
            && self.volume > 0.0
            && self.open_price.is_finite()
            && self.current_price.is_finite()
            && self.profit.is_finite()
            && self.stop_loss.map_or(true, f64::is_finite)
            && self.take_profit.map_or(true, f64::is_finite)
    }

    /// Price distance moved in the position's favour since entry.
    pub fn favourable_move(&self) -> f64 {
        match self.side {
            Side::Buy => self.current_price - self.open_price,
            Side::Sell => self.open_price - self.current_price,
        }
    }
}
