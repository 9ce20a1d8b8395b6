//! # engine::risk
//!
//! Account-level guard rails evaluated on every successful snapshot.
//!
//! ## Checks
//! 1. **Margin level**  — warning below `margin_warning`, critical below `margin_critical`
//! 2. **Drawdown**      — equity vs the first balance seen by this process
//! 3. **Daily loss**    — equity vs the first balance seen this UTC day
//!
//! Each breach is announced once and re-armed only after the account
//! recovers past the threshold.  A threshold of 0 disables that check.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::models::{AccountSnapshot, Event, EventBody, Priority, RiskKind};

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Margin level (%) below which a warning is sent.
    pub margin_warning: f64,
    /// Margin level (%) below which a critical alert is sent.
    pub margin_critical: f64,
    /// Max drawdown from the session start balance, in percent.
    pub drawdown_pct: f64,
    /// Max loss since the start of the UTC day, in percent.
    pub daily_loss_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            margin_warning:  150.0,
            margin_critical: 100.0,
            drawdown_pct:    10.0,
            daily_loss_pct:  5.0,
        }
    }
}

// ─── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    /// Persisted for status only; every start takes a fresh one.
    pub session_start_balance: Option<f64>,
    pub day: Option<NaiveDate>,
    pub day_start_balance: Option<f64>,
    /// Breach ที่แจ้งไปแล้ว และยังไม่ recover กลับเกิน threshold
    #[serde(default)]
    pub active: HashSet<RiskKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskStatus {
    pub drawdown_pct:   Option<f64>,
    pub daily_loss_pct: Option<f64>,
    pub margin_level:   Option<f64>,
    pub active:         Vec<RiskKind>,
}

// ─── RiskMonitor ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RiskMonitor {
    config: RiskConfig,
    state: RiskState,
    last: Option<AccountSnapshot>,
}

impl RiskMonitor {
    /// A restart opens a new session: the drawdown reference is dropped,
    /// the day baseline and active breaches are kept.
    pub fn new(config: RiskConfig, mut state: RiskState) -> Self {
        if let Some(previous) = state.session_start_balance.take() {
            debug!(previous, "Risk: new session, drawdown reference reset");
        }
        Self { config, state, last: None }
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    pub fn check(&mut self, account: &AccountSnapshot, now: DateTime<Utc>) -> Vec<Event> {
        let mut events = Vec::new();

        // Daily reset
        let today = now.date_naive();
        if self.state.day != Some(today) {
            self.state.day = Some(today);
            self.state.day_start_balance = Some(account.balance);
            self.state.active.remove(&RiskKind::DailyLoss);
            info!(balance = account.balance, "📅 Risk: daily baseline reset");
        }
        let session_start = *self.state.session_start_balance.get_or_insert(account.balance);

        self.check_margin(account, now, &mut events);

        if self.config.drawdown_pct > 0.0 {
            let drawdown = loss_pct(session_start, account.equity);
            let message = format!(
                "Drawdown {drawdown:.1}% from session start balance {session_start:.2} (limit {:.1}%)",
                self.config.drawdown_pct
            );
            self.edge(RiskKind::Drawdown, drawdown >= self.config.drawdown_pct, Priority::Critical, message, now, &mut events);
        }

        if self.config.daily_loss_pct > 0.0 {
            let day_start = self.state.day_start_balance.unwrap_or(account.balance);
            let loss = loss_pct(day_start, account.equity);
            let message = format!(
                "Daily loss {loss:.1}% since {day_start:.2} (limit {:.1}%)",
                self.config.daily_loss_pct
            );
            self.edge(RiskKind::DailyLoss, loss >= self.config.daily_loss_pct, Priority::Important, message, now, &mut events);
        }

        self.last = Some(account.clone());
        events
    }

    fn check_margin(&mut self, account: &AccountSnapshot, now: DateTime<Utc>, events: &mut Vec<Event>) {
        let Some(level) = account.margin_level.filter(|l| l.is_finite() && *l > 0.0) else {
            self.state.active.remove(&RiskKind::MarginWarning);
            self.state.active.remove(&RiskKind::MarginCritical);
            return;
        };

        let critical = self.config.margin_critical > 0.0 && level < self.config.margin_critical;
        let warning = self.config.margin_warning > 0.0 && level < self.config.margin_warning;

        if critical {
            if self.state.active.insert(RiskKind::MarginCritical) {
                // critical แล้ว ไม่ต้องแจ้ง warning ซ้ำตอน margin ไต่กลับขึ้นมา
                self.state.active.insert(RiskKind::MarginWarning);
                events.push(risk_event(
                    now,
                    RiskKind::MarginCritical,
                    Priority::Critical,
                    format!("Margin level {level:.1}% below critical {:.0}%", self.config.margin_critical),
                ));
            }
        } else {
            self.state.active.remove(&RiskKind::MarginCritical);
            self.edge(
                RiskKind::MarginWarning,
                warning,
                Priority::Important,
                format!("Margin level {level:.1}% below {:.0}%", self.config.margin_warning),
                now,
                events,
            );
        }
    }

    /// Emit on the rising edge of `breached`, re-arm on the falling edge.
    fn edge(
        &mut self,
        kind: RiskKind,
        breached: bool,
        severity: Priority,
        message: String,
        now: DateTime<Utc>,
        events: &mut Vec<Event>,
    ) {
        if breached {
            if self.state.active.insert(kind) {
                events.push(risk_event(now, kind, severity, message));
            }
        } else if self.state.active.remove(&kind) {
            info!(risk = kind.as_str(), "✅ Risk condition recovered");
        }
    }

    pub fn status(&self) -> RiskStatus {
        let mut active: Vec<RiskKind> = self.state.active.iter().copied().collect();
        active.sort_by_key(|k| k.as_str());
        RiskStatus {
            drawdown_pct: self
                .last
                .as_ref()
                .zip(self.state.session_start_balance)
                .map(|(a, start)| loss_pct(start, a.equity)),
            daily_loss_pct: self
                .last
                .as_ref()
                .zip(self.state.day_start_balance)
                .map(|(a, start)| loss_pct(start, a.equity)),
            margin_level: self.last.as_ref().and_then(|a| a.margin_level),
            active,
        }
    }
}

fn loss_pct(reference: f64, equity: f64) -> f64 {
    if reference <= 0.0 || !reference.is_finite() || !equity.is_finite() {
        return 0.0;
    }
    ((reference - equity) / reference * 100.0).max(0.0)
}

pub fn risk_event(now: DateTime<Utc>, risk: RiskKind, severity: Priority, message: String) -> Event {
    warn!(risk = risk.as_str(), severity = ?severity, "🚨 {message}");
    Event::new(now, EventBody::RiskWarning { risk, severity, message })
}

// ─── Tests ────────────────────────────────────────────────────────────────────
