//! # engine::differ
//!
//! **State Differ** — turns two consecutive full snapshots into an ordered
//! list of semantic events.
//!
//! ## Emission order (one cycle)
//! ```text
//! 1. PositionClosed            (previous iteration order)
//! 2. OrderFilled / OrderExpired / OrderCancelled
//! 3. PositionModified          (current iteration order)
//! 4. PositionOpened            (current iteration order)
//! 5. OrderPlaced
//! ```
//! Closes always precede opens, so a "previous trade closed" message is seen
//! before the re-entry on the same symbol.
//!
//! The differ never advances its baseline by itself: [`StateDiffer::diff`] is
//! pure and [`StateDiffer::commit`] is called by the scheduler only after the
//! events were handed to policy and dispatch.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::models::{
    Event, EventBody, FieldChange, ModifiedField, Order, Position, TradingSnapshot,
};

/// Values closer than this are the same price/volume.
const EPSILON: f64 = 1e-9;

// ─── Fill matching tolerance ──────────────────────────────────────────────────

/// How close a new position must be to a vanished pending order to count as
/// its fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillTolerance {
    /// Max |position.open_price − order.price| as a percentage of the order price.
    pub price_pct: f64,
    /// Max |position.volume − order.volume| in lots.
    pub volume: f64,
}

impl Default for FillTolerance {
    fn default() -> Self {
        Self { price_pct: 0.5, volume: 1e-6 }
    }
}

impl FillTolerance {
    fn matches(&self, order: &Order, position: &Position) -> bool {
        if order.symbol != position.symbol || order.order_type.side() != position.side {
            return false;
        }
        let price_gap = (position.open_price - order.price).abs();
        let max_gap = order.price.abs() * self.price_pct / 100.0;
        (position.volume - order.volume).abs() <= self.volume + EPSILON
            && price_gap <= max_gap + EPSILON
    }
}

// ─── StateDiffer ──────────────────────────────────────────────────────────────

/// Holds the last committed snapshot.
#[derive(Debug, Clone, Default)]
pub struct StateDiffer {
    previous: Option<TradingSnapshot>,
    tolerance: FillTolerance,
}

impl StateDiffer {
    pub fn new(tolerance: FillTolerance, baseline: Option<TradingSnapshot>) -> Self {
        Self { previous: baseline, tolerance }
    }

    pub fn previous(&self) -> Option<&TradingSnapshot> {
        self.previous.as_ref()
    }

    /// Events between the committed baseline and `current`.
    ///
    /// Without a baseline (first connect) there is nothing to compare against
    /// and no events are produced; the first commit becomes the baseline.
    pub fn diff(
        &self,
        current: &TradingSnapshot,
        now: DateTime<Utc>,
        requested_closes: &HashSet<u64>,
    ) -> Vec<Event> {
        match &self.previous {
            Some(previous) => diff_snapshots(previous, current, &self.tolerance, now, requested_closes),
            None => {
                debug!(
                    positions = current.positions.len(),
                    orders    = current.orders.len(),
                    "No baseline yet — adopting snapshot silently"
                );
                Vec::new()
            }
        }
    }

    /// Replace the baseline.  Call only after the cycle's events were handed off.
    pub fn commit(&mut self, current: TradingSnapshot) {
        self.previous = Some(current);
    }
}

// ─── Core diff ────────────────────────────────────────────────────────────────

/// Compare `previous` against `current`.
///
/// Every ticket present in `previous` and absent in `current` yields exactly
/// one closed-class event; every ticket absent in `previous` and present in
/// `current` yields exactly one opened-class event.  A malformed entry in
/// `current` still counts as present, it is only excluded from field diffs
/// and fill matching.
pub fn diff_snapshots(
    previous: &TradingSnapshot,
    current: &TradingSnapshot,
    tolerance: &FillTolerance,
    now: DateTime<Utc>,
    requested_closes: &HashSet<u64>,
) -> Vec<Event> {
    let prev_positions: HashMap<u64, &Position> =
        previous.positions.iter().map(|p| (p.ticket, p)).collect();
    let cur_positions: HashMap<u64, &Position> =
        current.positions.iter().map(|p| (p.ticket, p)).collect();
    let cur_orders: HashSet<u64> = current.orders.iter().map(|o| o.ticket).collect();
    let prev_orders: HashSet<u64> = previous.orders.iter().map(|o| o.ticket).collect();

    let mut events = Vec::new();

    // ── 1. Closed positions ──────────────────────────────────────────────────
    for position in previous.positions.iter().filter(|p| !cur_positions.contains_key(&p.ticket)) {
        events.push(Event::new(now, EventBody::PositionClosed {
            position:   position.clone(),
            by_request: requested_closes.contains(&position.ticket),
        }));
    }

    // ── 2. Vanished orders: filled, expired or cancelled ─────────────────────
    let opened: Vec<&Position> = current
        .positions
        .iter()
        .filter(|p| !prev_positions.contains_key(&p.ticket))
        .collect();
    let mut fill_of: HashMap<u64, u64> = HashMap::new(); // position ticket → order ticket

    for order in previous.orders.iter().filter(|o| !cur_orders.contains(&o.ticket)) {
        let body = match find_fill(order, &opened, &fill_of, tolerance) {
            Some(position_ticket) => {
                fill_of.insert(position_ticket, order.ticket);
                EventBody::OrderFilled { order: order.clone(), position_ticket }
            }
            None if order.is_expired_at(now) => EventBody::OrderExpired { order: order.clone() },
            None => EventBody::OrderCancelled { order: order.clone() },
        };
        events.push(Event::new(now, body));
    }

    // ── 3. Modified positions ────────────────────────────────────────────────
    for position in &current.positions {
        let Some(before) = prev_positions.get(&position.ticket) else { continue };
        if !position.is_well_formed() || !before.is_well_formed() {
            warn!(ticket = position.ticket, "Malformed position — field diff skipped");
            continue;
        }
        let changes = position_changes(before, position);
        if !changes.is_empty() {
            events.push(Event::new(now, EventBody::PositionModified {
                position: position.clone(),
                changes,
            }));
        }
    }

    // ── 4. Opened positions ──────────────────────────────────────────────────
    for position in opened {
        events.push(Event::new(now, EventBody::PositionOpened {
            position:   position.clone(),
            from_order: fill_of.get(&position.ticket).copied(),
        }));
    }

    // ── 5. Placed orders ─────────────────────────────────────────────────────
    for order in current.orders.iter().filter(|o| !prev_orders.contains(&o.ticket)) {
        events.push(Event::new(now, EventBody::OrderPlaced { order: order.clone() }));
    }

    events
}

/// Ticket equality wins (MT5 reuses the order ticket as position id), then
/// the closest tolerance match by price.
fn find_fill(
    order: &Order,
    opened: &[&Position],
    claimed: &HashMap<u64, u64>,
    tolerance: &FillTolerance,
) -> Option<u64> {
    if !order.is_well_formed() {
        return None;
    }
    let free = || opened.iter().filter(|p| !claimed.contains_key(&p.ticket) && p.is_well_formed());

    if let Some(same) = free().find(|p| p.ticket == order.ticket) {
        return Some(same.ticket);
    }

    free()
        .filter(|p| tolerance.matches(order, p))
        .min_by(|a, b| {
            let da = (a.open_price - order.price).abs();
            let db = (b.open_price - order.price).abs();
            da.total_cmp(&db)
        })
        .map(|p| p.ticket)
}

fn position_changes(before: &Position, after: &Position) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    if differs(before.stop_loss, after.stop_loss) {
        changes.push(FieldChange {
            field: ModifiedField::StopLoss,
            old:   before.stop_loss,
            new:   after.stop_loss,
        });
    }
    if differs(before.take_profit, after.take_profit) {
        changes.push(FieldChange {
            field: ModifiedField::TakeProfit,
            old:   before.take_profit,
            new:   after.take_profit,
        });
    }
    if differs(Some(before.volume), Some(after.volume)) {
        changes.push(FieldChange {
            field: ModifiedField::Volume,
            old:   Some(before.volume),
            new:   Some(after.volume),
        });
    }
    changes
}

fn differs(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => (x - y).abs() > EPSILON,
        (None, None) => false,
        _ => true,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{AccountSnapshot, OrderType, Side};
    use chrono::{Duration, TimeZone};

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap()
    }

    pub fn position(ticket: u64, symbol: &str, side: Side, volume: f64, price: f64) -> Position {
        Position {
            ticket,
            symbol:        symbol.to_string(),
            side,
            volume,
            open_price:    price,
            open_time:     t0() - Duration::minutes(30),
            current_price: price,
            profit:        0.0,
            stop_loss:     None,
            take_profit:   None,
        }
    }

    pub fn order(ticket: u64, symbol: &str, order_type: OrderType, volume: f64, price: f64) -> Order {
        Order {
            ticket,
            symbol: symbol.to_string(),
            order_type,
            volume,
            price,
            setup_time: t0() - Duration::hours(1),
            expiration: None,
        }
    }

    pub fn snapshot(positions: Vec<Position>, orders: Vec<Order>) -> TradingSnapshot {
        TradingSnapshot {
            account: AccountSnapshot {
                balance:        10_000.0,
                equity:         10_000.0,
                margin:         0.0,
                margin_level:   None,
                open_positions: positions.len(),
                timestamp:      t0(),
            },
            positions,
            orders,
        }
    }

    fn diff(prev: &TradingSnapshot, cur: &TradingSnapshot) -> Vec<Event> {
        diff_snapshots(prev, cur, &FillTolerance::default(), t0(), &HashSet::new())
    }

    #[test]
    fn test_vanished_position_yields_single_close() {
        let prev = snapshot(vec![position(1, "EURUSD", Side::Buy, 0.1, 1.1000)], vec![]);
        let cur = snapshot(vec![], vec![]);

        let events = diff(&prev, &cur);
        assert_eq!(events.len(), 1);
        match &events[0].body {
            EventBody::PositionClosed { position, by_request } => {
                assert_eq!(position.ticket, 1);
                assert!(!by_request);
            }
            other => panic!("expected PositionClosed, got {other:?}"),
        }
    }

    #[test]
    fn test_new_position_yields_single_open() {
        let prev = snapshot(vec![], vec![]);
        let cur = snapshot(vec![position(7, "GBPUSD", Side::Sell, 0.2, 1.2700)], vec![]);

        let events = diff(&prev, &cur);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0].body,
            EventBody::PositionOpened { position, from_order: None } if position.ticket == 7
        ));
    }

    #[test]
    fn test_unchanged_snapshot_is_silent() {
        let snap = snapshot(
            vec![position(1, "EURUSD", Side::Buy, 0.1, 1.1000)],
            vec![order(2, "EURUSD", OrderType::BuyLimit, 0.1, 1.0950)],
        );
        assert!(diff(&snap, &snap.clone()).is_empty());
    }

    #[test]
    fn test_order_filled_when_matching_position_appears() {
        let prev = snapshot(vec![], vec![order(10, "XAUUSD", OrderType::BuyLimit, 0.5, 2000.0)]);
        // slipped 1.0 on 2000 = 0.05% < 0.5%
        let cur = snapshot(vec![position(11, "XAUUSD", Side::Buy, 0.5, 2001.0)], vec![]);

        let events = diff(&prev, &cur);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0].body,
            EventBody::OrderFilled { order, position_ticket: 11 } if order.ticket == 10
        ));
        assert!(matches!(
            &events[1].body,
            EventBody::PositionOpened { from_order: Some(10), .. }
        ));
    }

    #[test]
    fn test_order_fill_by_shared_ticket_ignores_price_gap() {
        let prev = snapshot(vec![], vec![order(42, "US30", OrderType::SellStop, 1.0, 39_000.0)]);
        let cur = snapshot(vec![position(42, "US30", Side::Sell, 1.0, 38_500.0)], vec![]);

        let events = diff(&prev, &cur);
        assert!(matches!(&events[0].body, EventBody::OrderFilled { position_ticket: 42, .. }));
    }

    #[test]
    fn test_side_mismatch_is_not_a_fill() {
        let prev = snapshot(vec![], vec![order(10, "EURUSD", OrderType::BuyLimit, 0.1, 1.1000)]);
        let cur = snapshot(vec![position(11, "EURUSD", Side::Sell, 0.1, 1.1000)], vec![]);

        let events = diff(&prev, &cur);
        assert!(matches!(&events[0].body, EventBody::OrderCancelled { .. }));
        assert!(matches!(&events[1].body, EventBody::PositionOpened { from_order: None, .. }));
    }

    #[test]
    fn test_vanished_order_past_expiry_is_expired() {
        let mut o = order(5, "EURUSD", OrderType::SellLimit, 0.1, 1.1200);
        o.expiration = Some(t0() - Duration::minutes(1));
        let prev = snapshot(vec![], vec![o]);
        let cur = snapshot(vec![], vec![]);

        let events = diff(&prev, &cur);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0].body, EventBody::OrderExpired { order } if order.ticket == 5));
    }

    #[test]
    fn test_vanished_order_without_expiry_is_cancelled() {
        let prev = snapshot(vec![], vec![order(5, "EURUSD", OrderType::SellLimit, 0.1, 1.1200)]);
        let cur = snapshot(vec![], vec![]);

        let events = diff(&prev, &cur);
        assert!(matches!(&events[0].body, EventBody::OrderCancelled { .. }));
    }

    #[test]
    fn test_one_order_fills_at_most_one_position() {
        let prev = snapshot(vec![], vec![order(1, "EURUSD", OrderType::BuyLimit, 0.1, 1.1000)]);
        let cur = snapshot(
            vec![
                position(2, "EURUSD", Side::Buy, 0.1, 1.1001),
                position(3, "EURUSD", Side::Buy, 0.1, 1.1000),
            ],
            vec![],
        );

        let events = diff(&prev, &cur);
        let fills: Vec<_> = events
            .iter()
            .filter(|e| matches!(e.body, EventBody::OrderFilled { .. }))
            .collect();
        assert_eq!(fills.len(), 1);
        // closest by price wins
        assert!(matches!(&fills[0].body, EventBody::OrderFilled { position_ticket: 3, .. }));
        let opens = events
            .iter()
            .filter(|e| matches!(e.body, EventBody::PositionOpened { .. }))
            .count();
        assert_eq!(opens, 2);
    }

    #[test]
    fn test_sl_tp_change_yields_modified_with_fields() {
        let before = position(1, "EURUSD", Side::Buy, 0.1, 1.1000);
        let mut after = before.clone();
        after.stop_loss = Some(1.0950);
        after.current_price = 1.1010; // price moves are not modifications

        let events = diff(&snapshot(vec![before], vec![]), &snapshot(vec![after], vec![]));
        assert_eq!(events.len(), 1);
        match &events[0].body {
            EventBody::PositionModified { changes, .. } => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].field, ModifiedField::StopLoss);
                assert_eq!(changes[0].old, None);
                assert_eq!(changes[0].new, Some(1.0950));
            }
            other => panic!("expected PositionModified, got {other:?}"),
        }
    }

    #[test]
    fn test_partial_close_is_volume_modification() {
        let before = position(1, "EURUSD", Side::Buy, 0.2, 1.1000);
        let mut after = before.clone();
        after.volume = 0.1;

        let events = diff(&snapshot(vec![before], vec![]), &snapshot(vec![after], vec![]));
        assert!(matches!(
            &events[0].body,
            EventBody::PositionModified { changes, .. } if changes[0].field == ModifiedField::Volume
        ));
    }

    #[test]
    fn test_closes_precede_opens() {
        let prev = snapshot(vec![position(1, "EURUSD", Side::Buy, 0.1, 1.1000)], vec![]);
        let cur = snapshot(vec![position(2, "EURUSD", Side::Sell, 0.1, 1.0990)], vec![]);

        let kinds: Vec<&str> = diff(&prev, &cur).iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["position_closed", "position_opened"]);
    }

    #[test]
    fn test_malformed_position_is_still_present() {
        let prev = snapshot(vec![position(1, "EURUSD", Side::Buy, 0.1, 1.1000)], vec![]);
        let mut broken = position(1, "EURUSD", Side::Buy, 0.1, 1.1000);
        broken.profit = f64::NAN;
        let cur = snapshot(vec![broken], vec![]);

        assert!(diff(&prev, &cur).is_empty());
    }

    #[test]
    fn test_requested_close_is_attributed() {
        let prev = snapshot(vec![position(9, "EURUSD", Side::Buy, 0.1, 1.1000)], vec![]);
        let cur = snapshot(vec![], vec![]);
        let requested: HashSet<u64> = [9].into_iter().collect();

        let events = diff_snapshots(&prev, &cur, &FillTolerance::default(), t0(), &requested);
        assert!(matches!(&events[0].body, EventBody::PositionClosed { by_request: true, .. }));
    }

    #[test]
    fn test_differ_without_baseline_is_silent_until_commit() {
        let mut differ = StateDiffer::new(FillTolerance::default(), None);
        let first = snapshot(vec![position(1, "EURUSD", Side::Buy, 0.1, 1.1000)], vec![]);

        assert!(differ.diff(&first, t0(), &HashSet::new()).is_empty());
        differ.commit(first);

        let second = snapshot(vec![], vec![]);
        assert_eq!(differ.diff(&second, t0(), &HashSet::new()).len(), 1);
        // baseline untouched until the next commit
        assert_eq!(differ.previous().map(|s| s.positions.len()), Some(1));
    }
}
