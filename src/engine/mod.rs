//! # engine
//!
//! The pure half of the alerting pipeline.  Nothing in here performs I/O;
//! the scheduler feeds snapshots and prices in, and gets events and
//! decisions out.
//!
//! ```text
//! snapshot ──▶ differ ──┐
//! account  ──▶ risk   ──┤
//! prices   ──▶ levels ──┼──▶ raw events ──▶ policy ──▶ decisions
//! snapshot ──▶ suggest ─┘
//! ```

pub mod differ;
pub mod levels;
pub mod policy;
pub mod risk;
pub mod suggest;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::models::{AlertDecision, Event, TradingSnapshot};
use crate::store::{LevelStore, PersistedState};

use differ::{FillTolerance, StateDiffer};
use policy::{AlertPolicy, PolicyConfig};
use risk::{RiskConfig, RiskMonitor};
use suggest::{SuggestionConfig, SuggestionTracker};

/// Serializes poll cycles and commands: both take this lock for their whole
/// read-modify-write section.
pub type SharedEngine = Arc<Mutex<EngineState>>;

/// All mutable engine state.  Owned by the scheduler, borrowed by commands.
#[derive(Debug)]
pub struct EngineState {
    pub differ: StateDiffer,
    pub levels: LevelStore,
    pub policy: AlertPolicy,
    pub risk: RiskMonitor,
    pub suggestions: SuggestionTracker,
    /// Tickets closed through the command surface, awaiting their close event.
    pub requested_closes: HashSet<u64>,
}

/// Per-component settings needed to rebuild an [`EngineState`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub tolerance: FillTolerance,
    pub policy: PolicyConfig,
    pub risk: RiskConfig,
    pub suggestions: SuggestionConfig,
}

impl EngineState {
    /// Rebuild from persisted state.  `levels` must already hold the loaded
    /// definitions; their saved trigger state is re-attached here.
    pub fn restore(config: EngineConfig, mut levels: LevelStore, saved: PersistedState) -> Self {
        levels.restore_states(saved.levels);
        Self {
            differ:           StateDiffer::new(config.tolerance, saved.baseline),
            levels,
            policy:           AlertPolicy::new(config.policy, saved.policy),
            risk:             RiskMonitor::new(config.risk, saved.risk),
            suggestions:      SuggestionTracker::new(config.suggestions, saved.suggested),
            requested_closes: saved.requested_closes.into_iter().collect(),
        }
    }

    pub fn snapshot_state(&self, now: DateTime<Utc>) -> PersistedState {
        let mut requested: Vec<u64> = self.requested_closes.iter().copied().collect();
        requested.sort_unstable();
        PersistedState {
            version:          0,
            saved_at:         Some(now),
            baseline:         self.differ.previous().cloned(),
            levels:           self.levels.states(),
            policy:           self.policy.state().clone(),
            risk:             self.risk.state().clone(),
            suggested:        self.suggestions.suggested(),
            requested_closes: requested,
        }
    }

    /// Raw events for one successful fetch, in emission order:
    /// snapshot diff, risk, price levels, profit suggestions.
    ///
    /// Risk is a level, not a change, so it is announced from the first
    /// snapshot on.  Suggestions wait for a diff baseline; before that every
    /// open winner would look new.
    pub fn observe(
        &mut self,
        snapshot: &TradingSnapshot,
        prices: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Vec<Event> {
        let baseline = self.differ.previous().is_some();

        let mut events = self.differ.diff(snapshot, now, &self.requested_closes);
        events.extend(self.risk.check(&snapshot.account, now));
        events.extend(levels::evaluate(&mut self.levels, prices, now));
        let suggestions = self.suggestions.scan(snapshot, now);
        if baseline {
            events.extend(suggestions);
        }
        events
    }

    /// Policy verdicts for a batch, followed by any due suppression summaries
    /// and deferred alerts released after quiet hours.
    pub fn decide(&mut self, events: Vec<Event>, now: DateTime<Utc>) -> Vec<AlertDecision> {
        let mut decisions: Vec<AlertDecision> =
            events.into_iter().map(|e| self.policy.decide(e, now)).collect();
        for summary in self.policy.due_summaries(now) {
            decisions.push(self.policy.decide(summary, now));
        }
        decisions
    }

    /// Advance the diff baseline.  Only after the cycle's events were dispatched.
    pub fn commit(&mut self, snapshot: TradingSnapshot) {
        let open: HashSet<u64> = snapshot.positions.iter().map(|p| p.ticket).collect();
        self.requested_closes.retain(|t| open.contains(t));
        self.differ.commit(snapshot);
    }
}

pub fn shared(state: EngineState) -> SharedEngine {
    Arc::new(Mutex::new(state))
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventBody, Side};
    use differ::tests::{position, snapshot, t0};

    fn make_engine() -> EngineState {
        EngineState::restore(EngineConfig::default(), LevelStore::default(), PersistedState::default())
    }

    #[test]
    fn test_first_cycle_reports_only_risk() {
        let mut engine = make_engine();
        let mut crowded = snapshot(vec![position(1, "EURUSD", Side::Buy, 0.1, 1.1)], vec![]);
        crowded.account.equity = 5_000.0; // 50% drawdown vs balance

        let first: Vec<&str> = engine
            .observe(&crowded, &HashMap::new(), t0())
            .iter()
            .map(Event::kind)
            .collect();
        assert_eq!(first, vec!["risk_warning", "risk_warning"]);
        engine.commit(crowded);

        let empty = snapshot(vec![], vec![]);
        let events = engine.observe(&empty, &HashMap::new(), t0());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "position_closed");
    }

    #[test]
    fn test_requested_close_cleared_after_commit() {
        let mut engine = make_engine();
        let snap = snapshot(vec![position(9, "EURUSD", Side::Buy, 0.1, 1.1)], vec![]);
        engine.commit(snap);
        engine.requested_closes.insert(9);

        let empty = snapshot(vec![], vec![]);
        let events = engine.observe(&empty, &HashMap::new(), t0());
        assert!(matches!(events[0].body, EventBody::PositionClosed { by_request: true, .. }));
        engine.commit(empty);
        assert!(engine.requested_closes.is_empty());
    }

    #[test]
    fn test_persisted_state_restores_baseline() {
        let mut engine = make_engine();
        engine.commit(snapshot(vec![position(1, "EURUSD", Side::Buy, 0.1, 1.1)], vec![]));
        let saved = engine.snapshot_state(t0());

        let mut restarted = EngineState::restore(EngineConfig::default(), LevelStore::default(), saved);
        let events = restarted.observe(&snapshot(vec![], vec![]), &HashMap::new(), t0());
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_decide_appends_due_summaries() {
        let mut engine = make_engine();
        engine.commit(snapshot(vec![], vec![]));
        let positions: Vec<_> = (1..=15).map(|t| position(t, "EURUSD", Side::Buy, 0.1, 1.1)).collect();
        let events = engine.observe(&snapshot(positions, vec![]), &HashMap::new(), t0());

        let decisions = engine.decide(events, t0());
        assert_eq!(decisions.iter().filter(|d| d.is_deliver()).count(), 10);

        let later = engine.decide(Vec::new(), t0() + chrono::Duration::seconds(61));
        assert_eq!(later.len(), 1);
        assert!(later[0].is_deliver());
        assert!(matches!(later[0].event.body, EventBody::AlertsSuppressed { count: 5, .. }));
    }
}
