//! # engine::suggest
//!
//! Profit-taking suggestions: an open position whose profit clears both the
//! absolute and the percentage threshold gets one "consider closing half"
//! suggestion for the lifetime of its ticket.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::{Event, EventBody, Position, ProfitSuggestion, TradingSnapshot};

#[derive(Debug, Clone)]
pub struct SuggestionConfig {
    pub enabled: bool,
    /// Minimum profit in account currency.
    pub min_profit: f64,
    /// Minimum favourable move, percent of the open price.
    pub min_profit_pct: f64,
}

impl Default for SuggestionConfig {
    fn default() -> Self {
        Self { enabled: true, min_profit: 10.0, min_profit_pct: 5.0 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SuggestionTracker {
    config: SuggestionConfig,
    suggested: HashSet<u64>,
}

impl SuggestionTracker {
    pub fn new(config: SuggestionConfig, suggested: impl IntoIterator<Item = u64>) -> Self {
        Self { config, suggested: suggested.into_iter().collect() }
    }

    pub fn suggested(&self) -> Vec<u64> {
        let mut tickets: Vec<u64> = self.suggested.iter().copied().collect();
        tickets.sort_unstable();
        tickets
    }

    /// New suggestions for this snapshot.  Tickets no longer open are forgotten.
    pub fn scan(&mut self, snapshot: &TradingSnapshot, now: DateTime<Utc>) -> Vec<Event> {
        let open: HashSet<u64> = snapshot.positions.iter().map(|p| p.ticket).collect();
        self.suggested.retain(|t| open.contains(t));

        if !self.config.enabled {
            return Vec::new();
        }

        let mut events = Vec::new();
        for position in snapshot.positions.iter().filter(|p| p.is_well_formed()) {
            if self.suggested.contains(&position.ticket) {
                continue;
            }
            let Some(suggestion) = self.evaluate(position) else { continue };
            debug!(ticket = position.ticket, profit = position.profit, "Profit suggestion candidate");
            self.suggested.insert(position.ticket);
            events.push(Event::new(now, EventBody::ProfitSuggestion { suggestion }));
        }
        events
    }

    fn evaluate(&self, position: &Position) -> Option<ProfitSuggestion> {
        if position.profit < self.config.min_profit || position.open_price <= 0.0 {
            return None;
        }
        let profit_pct = position.favourable_move() / position.open_price * 100.0;
        if profit_pct < self.config.min_profit_pct {
            return None;
        }
        Some(ProfitSuggestion {
            ticket:          position.ticket,
            symbol:          position.symbol.clone(),
            side:            position.side,
            volume:          position.volume,
            volume_to_close: round_lots(position.volume / 2.0),
            profit:          position.profit,
            profit_pct,
            recommendation:  None,
        })
    }
}

/// Round to the 0.01 lot step.
fn round_lots(volume: f64) -> f64 {
    ((volume * 100.0).round() / 100.0).max(0.01)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::differ::tests::{position, snapshot, t0};
    use crate::models::Side;

    fn winner(ticket: u64) -> Position {
        let mut p = position(ticket, "XAUUSD", Side::Buy, 0.3, 2000.0);
        p.current_price = 2120.0;
        p.profit = 360.0;
        p
    }

    #[test]
    fn test_suggests_once_per_ticket() {
        let mut tracker = SuggestionTracker::default();
        let snap = snapshot(vec![winner(1)], vec![]);

        let events = tracker.scan(&snap, t0());
        assert_eq!(events.len(), 1);
        match &events[0].body {
            EventBody::ProfitSuggestion { suggestion } => {
                assert_eq!(suggestion.volume_to_close, 0.15);
                assert!((suggestion.profit_pct - 6.0).abs() < 1e-9);
            }
            other => panic!("expected suggestion, got {other:?}"),
        }
        assert!(tracker.scan(&snap, t0()).is_empty());
    }

    #[test]
    fn test_below_threshold_is_ignored() {
        let mut tracker = SuggestionTracker::default();
        let mut p = winner(1);
        p.current_price = 2050.0; // 2.5%
        assert!(tracker.scan(&snapshot(vec![p], vec![]), t0()).is_empty());
    }

    #[test]
    fn test_closed_ticket_is_forgotten() {
        let mut tracker = SuggestionTracker::default();
        tracker.scan(&snapshot(vec![winner(1)], vec![]), t0());
        tracker.scan(&snapshot(vec![], vec![]), t0());
        assert!(tracker.suggested().is_empty());
    }

    #[test]
    fn test_disabled_emits_nothing() {
        let mut tracker = SuggestionTracker::new(
            SuggestionConfig { enabled: false, ..Default::default() },
            [],
        );
        assert!(tracker.scan(&snapshot(vec![winner(1)], vec![]), t0()).is_empty());
    }
}
