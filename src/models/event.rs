//! # models::event
//!
//! [`Event`] is every semantic change the engine can announce, and
//! [`AlertDecision`], the Alert Policy Engine's verdict on one event.
//!
//! Each variant carries the entity snapshot(s) needed to render a message
//! without going back to the terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{LevelKey, LevelKind, Order, Position, Recurrence, Side};

// ─── Category / Priority ──────────────────────────────────────────────────────

/// Rate-limit bucket an event draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    Trade,
    Order,
    PriceLevel,
    Advisory,
    Risk,
    /// Connection notices, suppression summaries, command responses.
    System,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCategory::Trade => "trade",
            AlertCategory::Order => "order",
            AlertCategory::PriceLevel => "price_level",
            AlertCategory::Advisory => "advisory",
            AlertCategory::Risk => "risk",
            AlertCategory::System => "system",
        }
    }

    /// Risk and system notices never draw from a bucket.
    pub fn is_rate_limited(&self) -> bool {
        !matches!(self, AlertCategory::Risk | AlertCategory::System)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    Important,
    Critical,
}

// ─── Payload pieces ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifiedField {
    StopLoss,
    TakeProfit,
    Volume,
}

impl ModifiedField {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModifiedField::StopLoss => "sl",
            ModifiedField::TakeProfit => "tp",
            ModifiedField::Volume => "volume",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: ModifiedField,
    pub old: Option<f64>,
    pub new: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelTrigger {
    pub key: LevelKey,
    pub target: f64,
    pub kind: LevelKind,
    pub description: String,
    pub price: f64,
    pub previous_price: Option<f64>,
    pub times_fired: u32,
    pub recurrence: Recurrence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskKind {
    ConnectionDegraded,
    MarginWarning,
    MarginCritical,
    Drawdown,
    DailyLoss,
}

impl RiskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskKind::ConnectionDegraded => "connection_degraded",
            RiskKind::MarginWarning => "margin_warning",
            RiskKind::MarginCritical => "margin_critical",
            RiskKind::Drawdown => "drawdown",
            RiskKind::DailyLoss => "daily_loss",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitSuggestion {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub volume_to_close: f64,
    pub profit: f64,
    pub profit_pct: f64,
    /// Advisor's recommendation, when it answered in time.
    pub recommendation: Option<String>,
}

// ─── EventBody ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventBody {
    PositionOpened {
        position: Position,
        /// Pending order that filled into this position, if matched.
        from_order: Option<u64>,
    },
    PositionClosed {
        /// Last observed state of the position before it vanished.
        position: Position,
        /// Close was issued through the command surface.
        by_request: bool,
    },
    PositionModified {
        position: Position,
        changes: Vec<FieldChange>,
    },
    OrderPlaced {
        order: Order,
    },
    OrderFilled {
        order: Order,
        position_ticket: u64,
    },
    OrderExpired {
        order: Order,
    },
    OrderCancelled {
        order: Order,
    },
    PriceLevelTriggered {
        trigger: LevelTrigger,
    },
    PriceLevelExpired {
        key: LevelKey,
        target: f64,
        description: String,
    },
    RiskWarning {
        risk: RiskKind,
        severity: Priority,
        message: String,
    },
    ProfitSuggestion {
        suggestion: ProfitSuggestion,
    },
    ConnectionRestored {
        failed_cycles: u32,
    },
    AlertsSuppressed {
        category: AlertCategory,
        count: u32,
    },
    CommandResult {
        request_id: Uuid,
        command: String,
        ok: bool,
        message: String,
    },
}

// ─── Event ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub at: DateTime<Utc>,
    pub body: EventBody,
}

impl Event {
    pub fn new(at: DateTime<Utc>, body: EventBody) -> Self {
        Self { at, body }
    }

    /// Stable machine name of the variant.
    pub fn kind(&self) -> &'static str {
        match &self.body {
            EventBody::PositionOpened { .. } => "position_opened",
            EventBody::PositionClosed { .. } => "position_closed",
            EventBody::PositionModified { .. } => "position_modified",
            EventBody::OrderPlaced { .. } => "order_placed",
            EventBody::OrderFilled { .. } => "order_filled",
            EventBody::OrderExpired { .. } => "order_expired",
            EventBody::OrderCancelled { .. } => "order_cancelled",
            EventBody::PriceLevelTriggered { .. } => "price_level_triggered",
            EventBody::PriceLevelExpired { .. } => "price_level_expired",
            EventBody::RiskWarning { .. } => "risk_warning",
            EventBody::ProfitSuggestion { .. } => "profit_suggestion",
            EventBody::ConnectionRestored { .. } => "connection_restored",
            EventBody::AlertsSuppressed { .. } => "alerts_suppressed",
            EventBody::CommandResult { .. } => "command_result",
        }
    }

    pub fn category(&self) -> AlertCategory {
        match &self.body {
            EventBody::PositionOpened { .. }
            | EventBody::PositionClosed { .. }
            | EventBody::PositionModified { .. } => AlertCategory::Trade,
            EventBody::OrderPlaced { .. }
            | EventBody::OrderFilled { .. }
            | EventBody::OrderExpired { .. }
            | EventBody::OrderCancelled { .. } => AlertCategory::Order,
            EventBody::PriceLevelTriggered { .. } | EventBody::PriceLevelExpired { .. } => {
                AlertCategory::PriceLevel
            }
            EventBody::ProfitSuggestion { .. } => AlertCategory::Advisory,
            EventBody::RiskWarning { .. } => AlertCategory::Risk,
            EventBody::ConnectionRestored { .. }
            | EventBody::AlertsSuppressed { .. }
            | EventBody::CommandResult { .. } => AlertCategory::System,
        }
    }

    pub fn priority(&self) -> Priority {
        match &self.body {
            EventBody::RiskWarning { severity, .. } => *severity,
            EventBody::CommandResult { .. } => Priority::Critical,
            EventBody::PositionClosed { .. }
            | EventBody::OrderFilled { .. }
            | EventBody::PriceLevelTriggered { .. }
            | EventBody::ConnectionRestored { .. } => Priority::Important,
            _ => Priority::Normal,
        }
    }

    /// Quiet hours never touch critical events or explicit command responses.
    pub fn bypasses_quiet_hours(&self) -> bool {
        self.priority() == Priority::Critical
            || matches!(self.body, EventBody::RiskWarning { .. } | EventBody::CommandResult { .. })
    }

    pub fn symbol(&self) -> Option<&str> {
        match &self.body {
            EventBody::PositionOpened { position, .. }
            | EventBody::PositionClosed { position, .. }
            | EventBody::PositionModified { position, .. } => Some(&position.symbol),
            EventBody::OrderPlaced { order }
            | EventBody::OrderFilled { order, .. }
            | EventBody::OrderExpired { order }
            | EventBody::OrderCancelled { order } => Some(&order.symbol),
            EventBody::PriceLevelTriggered { trigger } => Some(&trigger.key.symbol),
            EventBody::PriceLevelExpired { key, .. } => Some(&key.symbol),
            EventBody::ProfitSuggestion { suggestion } => Some(&suggestion.symbol),
            _ => None,
        }
    }

    /// Deduplication key: kind + entity (ticket / level id), and for
    /// modifications the changed fields with their new values, so two
    /// genuinely different edits of the same ticket are not merged.
    pub fn dedup_key(&self) -> String {
        let kind = self.kind();
        match &self.body {
            EventBody::PositionOpened { position, .. }
            | EventBody::PositionClosed { position, .. } => format!("{kind}:{}", position.ticket),
            EventBody::PositionModified { position, changes } => {
                let fields: Vec<String> = changes
                    .iter()
                    .map(|c| match c.new {
                        Some(v) => format!("{}={v}", c.field.as_str()),
                        None => format!("{}=none", c.field.as_str()),
                    })
                    .collect();
                format!("{kind}:{}:{}", position.ticket, fields.join(","))
            }
            EventBody::OrderPlaced { order }
            | EventBody::OrderFilled { order, .. }
            | EventBody::OrderExpired { order }
            | EventBody::OrderCancelled { order } => format!("{kind}:{}", order.ticket),
            EventBody::PriceLevelTriggered { trigger } => {
                format!("{kind}:{}:{}", trigger.key, trigger.times_fired)
            }
            EventBody::PriceLevelExpired { key, .. } => format!("{kind}:{key}"),
            // each outage streak is its own notice
            EventBody::RiskWarning { risk: RiskKind::ConnectionDegraded, .. } => {
                format!("{kind}:{}:{}", RiskKind::ConnectionDegraded.as_str(), self.at.timestamp())
            }
            EventBody::RiskWarning { risk, .. } => format!("{kind}:{}", risk.as_str()),
            EventBody::ProfitSuggestion { suggestion } => format!("{kind}:{}", suggestion.ticket),
            EventBody::ConnectionRestored { .. } => format!("{kind}:{}", self.at.timestamp()),
            EventBody::AlertsSuppressed { category, .. } => {
                format!("{kind}:{}:{}", category.as_str(), self.at.timestamp())
            }
            EventBody::CommandResult { request_id, .. } => format!("{kind}:{request_id}"),
        }
    }
}

// ─── AlertDecision ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    Duplicate,
    RateLimited,
    QuietHours,
    CategoryDisabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Deliver,
    Suppress(SuppressReason),
    Defer(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertDecision {
    pub event: Event,
    pub outcome: Outcome,
    pub dedup_key: String,
}

impl AlertDecision {
    pub fn is_deliver(&self) -> bool {
        self.outcome == Outcome::Deliver
    }
}
