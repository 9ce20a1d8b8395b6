//! # models::snapshot
//!
//! [`AccountSnapshot`] and [`TradingSnapshot`]: one full read of the
//! terminal.  Snapshots are values: the engine never mutates one, it only
//! compares the previous against the current.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Order, Position};

/// Account metrics at the time of the poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    /// Margin level in percent; `None` when no margin is used (MT5 reports 0).
    #[serde(default)]
    pub margin_level: Option<f64>,
    pub open_positions: usize,
    pub timestamp: DateTime<Utc>,
}

/// Positions + orders + account, fetched in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSnapshot {
    pub account: AccountSnapshot,
    pub positions: Vec<Position>,
    pub orders: Vec<Order>,
}

impl TradingSnapshot {
    /// A snapshot is only usable when the account's position count agrees
    /// with the position list.  MT5 occasionally answers `positions_get()`
    /// with an empty list mid-reconnect.
    pub fn is_consistent(&self) -> bool {
        self.account.open_positions == self.positions.len()
    }

    pub fn position(&self, ticket: u64) -> Option<&Position> {
        self.positions.iter().find(|p| p.ticket == ticket)
    }
}
