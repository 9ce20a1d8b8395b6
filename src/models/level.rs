//! # models::level
//!
//! [`PriceLevel`] is a user-configured trigger on one instrument, together
//! with the mutable [`TriggerState`] owned by the Price-Level Evaluator.
//!
//! The definition half comes from `price_levels.json` and is validated at
//! load time (see `store::levels`); the state half is persisted separately so
//! that a spent one-time level stays spent across restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── LevelKind ────────────────────────────────────────────────────────────────

/// Which crossing fires the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelKind {
    /// Fires when price moves above the target.
    Above,
    /// Fires when price moves below the target.
    Below,
    /// Fires when price crosses the target in either direction.
    Both,
}

impl LevelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LevelKind::Above => "above",
            LevelKind::Below => "below",
            LevelKind::Both => "both",
        }
    }
}

// ─── Recurrence ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    /// Fires once, then is spent forever (kept in config, never evaluated).
    OneTime,
    /// Re-arms after price returns to the opposite side of the target.
    Recurring,
}

// ─── LevelKey ─────────────────────────────────────────────────────────────────

/// Level ids are only unique per symbol, so state is keyed by both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LevelKey {
    pub symbol: String,
    pub id: String,
}

impl LevelKey {
    pub fn new(symbol: impl Into<String>, id: impl Into<String>) -> Self {
        Self { symbol: symbol.into(), id: id.into() }
    }
}

impl std::fmt::Display for LevelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.symbol, self.id)
    }
}

// ─── TriggerState ─────────────────────────────────────────────────────────────

/// Mutable per-level state.  Only the evaluator writes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerState {
    /// `true` = a crossing in the level's direction will fire.
    pub armed: bool,
    /// Last observed price; `None` until the first observation.
    pub last_price: Option<f64>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub times_fired: u32,
    /// One-time level that already fired.
    pub spent: bool,
    /// Expiry has been reported (reported once, then silent).
    pub expired_reported: bool,
    /// Target and kind the state was built for; a config edit that changes
    /// either invalidates the state.
    #[serde(default)]
    pub fingerprint: Option<(f64, LevelKind)>,
}

// ─── PriceLevel ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub id: String,
    pub symbol: String,
    pub target: f64,
    pub kind: LevelKind,
    pub description: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub recurrence: Recurrence,
    #[serde(default)]
    pub state: TriggerState,
}

impl PriceLevel {
    pub fn key(&self) -> LevelKey {
        LevelKey::new(&self.symbol, &self.id)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |exp| exp <= now)
    }

    /// Neither spent nor reported expired, so still worth a price fetch.
    pub fn is_live(&self) -> bool {
        !self.state.spent && !self.state.expired_reported
    }

    /// Adopt a persisted state, unless the definition changed since it was saved.
    /// A state without a fingerprint never saw a price and is always adopted.
    pub fn restore_state(&mut self, saved: TriggerState) {
        if saved.fingerprint.map_or(true, |f| f == (self.target, self.kind)) {
            self.state = saved;
        }
    }
}
