//! # engine::levels
//!
//! **Price-Level Evaluator** — crossing detection with hysteresis.
//!
//! ```text
//! above:  armed ──(price > target)──▶ FIRE ──▶ disarmed ──(price ≤ target)──▶ armed
//! below:  armed ──(price < target)──▶ FIRE ──▶ disarmed ──(price ≥ target)──▶ armed
//! both:   fires whenever the strict side of the target flips
//! ```
//!
//! The first observation of a level only records which side price is on; a
//! level never fires on the cycle it is first seen.  A price sitting exactly
//! on the target is not a crossing.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::models::{Event, EventBody, LevelKind, LevelTrigger, PriceLevel, Recurrence};
use crate::store::levels::LevelStore;

/// Evaluate every live level against the cycle's prices.
///
/// Symbols with no price (fetch failed or not requested) are skipped without
/// touching their state.  Expiry is reported even when the price is missing.
pub fn evaluate(
    store: &mut LevelStore,
    prices: &HashMap<String, f64>,
    now: DateTime<Utc>,
) -> Vec<Event> {
    let mut events = Vec::new();

    for (symbol, levels) in store.symbols_mut() {
        let price = match prices.get(symbol) {
            Some(p) if p.is_finite() => Some(*p),
            Some(p) => {
                warn!(symbol = %symbol, price = %p, "Non-finite price — levels skipped");
                None
            }
            None => None,
        };

        for level in levels.iter_mut().filter(|l| l.is_live()) {
            if level.is_expired_at(now) {
                level.state.fingerprint = Some((level.target, level.kind));
                level.state.expired_reported = true;
                info!(level = %level.key(), "⌛ Price level expired");
                events.push(Event::new(now, EventBody::PriceLevelExpired {
                    key:         level.key(),
                    target:      level.target,
                    description: level.description.clone(),
                }));
                continue;
            }
            let Some(price) = price else { continue };
            if let Some(trigger) = observe(level, price, now) {
                events.push(Event::new(now, EventBody::PriceLevelTriggered { trigger }));
            }
        }
    }

    events
}

/// Feed one price into one level.  Returns the trigger when it fired.
pub fn observe(level: &mut PriceLevel, price: f64, now: DateTime<Utc>) -> Option<LevelTrigger> {
    let target = level.target;
    let state = &mut level.state;
    state.fingerprint = Some((target, level.kind));
    let previous = state.last_price;

    let fired = match level.kind {
        LevelKind::Above => {
            state.last_price = Some(price);
            if previous.is_none() {
                state.armed = price <= target;
                false
            } else if state.armed && price > target {
                state.armed = false;
                true
            } else {
                if price <= target {
                    state.armed = true;
                }
                false
            }
        }
        LevelKind::Below => {
            state.last_price = Some(price);
            if previous.is_none() {
                state.armed = price >= target;
                false
            } else if state.armed && price < target {
                state.armed = false;
                true
            } else {
                if price >= target {
                    state.armed = true;
                }
                false
            }
        }
        LevelKind::Both => {
            // last_price เก็บฝั่งล่าสุดที่อยู่ห่างจาก target จริง ๆ, แตะ target พอดีไม่นับ
            if price == target {
                return None;
            }
            state.last_price = Some(price);
            state.armed = true;
            previous.map_or(false, |p| (p < target) != (price < target))
        }
    };

    if !fired {
        return None;
    }

    state.times_fired += 1;
    state.last_fired_at = Some(now);
    if level.recurrence == Recurrence::OneTime {
        state.spent = true;
        debug!(level = %level.key(), "One-time level spent");
    }
    info!(
        level  = %level.key(),
        target,
        price,
        kind   = level.kind.as_str(),
        "🎯 Price level triggered"
    );

    Some(LevelTrigger {
        key:            level.key(),
        target,
        kind:           level.kind,
        description:    level.description.clone(),
        price,
        previous_price: previous,
        times_fired:    level.state.times_fired,
        recurrence:     level.recurrence,
    })
}

// ─── Tests ────────────────────────────────────────────────────────────────────
