//! # engine::policy
//!
//! **Alert Policy Engine** — decides, per event, whether it is delivered.
//!
//! ## Checks (in order, first match wins)
//! 1. **Dedup**        — same dedup key delivered within the window → `Suppress(Duplicate)`
//! 2. **Category off** — category disabled by config → `Suppress(CategoryDisabled)`
//! 3. **Quiet hours**  — inside the window → `Suppress(QuietHours)` or `Defer(window end)`
//! 4. **Rate limit**   — category bucket or hourly cap empty → `Suppress(RateLimited)`, counted
//!
//! Risk and system events skip the category switch and the buckets.  Quiet
//! hours never hold back critical events, risk warnings or command responses.  Suppressed counts are
//! turned into one `AlertsSuppressed` summary per category once the bucket
//! window has elapsed.
//!
//! Everything here is driven by an explicit `now`, so the whole engine is
//! deterministic under test.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::AppError;
use crate::models::{AlertCategory, AlertDecision, Event, EventBody, Outcome, Priority, SuppressReason};

// ─── Quiet hours ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuietMode {
    Suppress,
    Defer,
}

/// Daily window in the user's fixed UTC offset; may span midnight.
#[derive(Debug, Clone, PartialEq)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub offset: FixedOffset,
}

impl QuietHours {
    /// Parse `"HH:MM-HH:MM"`.
    pub fn parse(window: &str, offset_minutes: i32) -> Result<Self, AppError> {
        let invalid = || AppError::ConfigInvalid(format!("quiet hours '{window}', expected HH:MM-HH:MM"));
        let (start, end) = window.split_once('-').ok_or_else(invalid)?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").map_err(|_| invalid())?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").map_err(|_| invalid())?;
        if start == end {
            return Err(AppError::ConfigInvalid("quiet hours start equals end".into()));
        }
        let offset = FixedOffset::east_opt(offset_minutes * 60)
            .ok_or_else(|| AppError::ConfigInvalid(format!("utc offset {offset_minutes} min out of range")))?;
        Ok(Self { start, end, offset })
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.offset).time();
        if self.start < self.end {
            local >= self.start && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }

    /// Next instant the window closes, strictly after `now`.
    pub fn next_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.offset).naive_local();
        let mut candidate = local.date().and_time(self.end);
        if candidate <= local {
            candidate += Duration::days(1);
        }
        // a fixed offset maps every local time to exactly one instant
        self.offset
            .from_local_datetime(&candidate)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now)
    }
}

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub dedup_window: Duration,
    /// Tokens per category per `rate_window`; 0 disables rate limiting.
    pub rate_per_window: u32,
    pub rate_window: Duration,
    /// Ceiling across all rate-limited categories per hour; 0 disables it.
    pub hourly_cap: u32,
    pub quiet_hours: Option<QuietHours>,
    pub quiet_mode: QuietMode,
    pub disabled: HashSet<AlertCategory>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            dedup_window:    Duration::seconds(10),
            rate_per_window: 10,
            rate_window:     Duration::seconds(60),
            hourly_cap:      100,
            quiet_hours:     None,
            quiet_mode:      QuietMode::Suppress,
            disabled:        HashSet::new(),
        }
    }
}

// ─── Token bucket ─────────────────────────────────────────────────────────────

/// Continuous-refill bucket: `capacity` tokens per window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    pub tokens: f64,
    pub refilled_at: DateTime<Utc>,
    /// Events refused since `suppressed_since`.
    pub suppressed: u32,
    pub suppressed_since: Option<DateTime<Utc>>,
}

impl TokenBucket {
    fn full(capacity: u32, now: DateTime<Utc>) -> Self {
        Self { tokens: capacity as f64, refilled_at: now, suppressed: 0, suppressed_since: None }
    }

    fn refill(&mut self, capacity: u32, window: Duration, now: DateTime<Utc>) {
        let elapsed = (now - self.refilled_at).num_milliseconds();
        let window_ms = window.num_milliseconds().max(1);
        if elapsed > 0 {
            let gained = capacity as f64 * elapsed as f64 / window_ms as f64;
            self.tokens = (self.tokens + gained).min(capacity as f64);
            self.refilled_at = now;
        }
    }

    /// Refill, then report whether a whole token is available.  Takes nothing.
    fn ready(&mut self, capacity: u32, window: Duration, now: DateTime<Utc>) -> bool {
        self.refill(capacity, window, now);
        self.tokens >= 1.0
    }

    fn take(&mut self) {
        self.tokens -= 1.0;
    }

    fn refuse(&mut self, now: DateTime<Utc>) {
        self.suppressed += 1;
        self.suppressed_since.get_or_insert(now);
    }
}

// ─── Persistable state ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredAlert {
    pub event: Event,
    pub until: DateTime<Utc>,
}

/// Everything the policy must remember across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyState {
    /// dedup key → time it was last let through
    #[serde(default)]
    pub recent: HashMap<String, DateTime<Utc>>,
    /// keyed by `AlertCategory::as_str()`
    #[serde(default)]
    pub buckets: HashMap<String, TokenBucket>,
    #[serde(default)]
    pub deferred: Vec<DeferredAlert>,
    /// Shared by every rate-limited category, refilled over one hour.
    #[serde(default)]
    pub hourly: Option<TokenBucket>,
}

// ─── AlertPolicy ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AlertPolicy {
    config: PolicyConfig,
    state: PolicyState,
}

impl AlertPolicy {
    pub fn new(config: PolicyConfig, state: PolicyState) -> Self {
        Self { config, state }
    }

    pub fn state(&self) -> &PolicyState {
        &self.state
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn deferred_len(&self) -> usize {
        self.state.deferred.len()
    }

    pub fn decide(&mut self, event: Event, now: DateTime<Utc>) -> AlertDecision {
        self.prune(now);
        let dedup_key = event.dedup_key();
        let outcome = self.outcome_for(&event, &dedup_key, now);

        match &outcome {
            Outcome::Deliver => {
                self.state.recent.insert(dedup_key.clone(), now);
            }
            Outcome::Defer(until) => {
                self.state.recent.insert(dedup_key.clone(), now);
                self.state.deferred.push(DeferredAlert { event: event.clone(), until: *until });
            }
            Outcome::Suppress(reason) => {
                debug!(key = %dedup_key, reason = ?reason, "Alert suppressed");
            }
        }

        AlertDecision { event, outcome, dedup_key }
    }

    fn outcome_for(&mut self, event: &Event, key: &str, now: DateTime<Utc>) -> Outcome {
        if let Some(seen) = self.state.recent.get(key) {
            if now - *seen < self.config.dedup_window {
                return Outcome::Suppress(SuppressReason::Duplicate);
            }
        }

        let category = event.category();
        if category.is_rate_limited() && self.config.disabled.contains(&category) {
            return Outcome::Suppress(SuppressReason::CategoryDisabled);
        }

        if let Some(quiet) = &self.config.quiet_hours {
            if !event.bypasses_quiet_hours() && quiet.contains(now) {
                return match self.config.quiet_mode {
                    QuietMode::Suppress => Outcome::Suppress(SuppressReason::QuietHours),
                    QuietMode::Defer => Outcome::Defer(quiet.next_end(now)),
                };
            }
        }

        let per_window = self.config.rate_per_window;
        let per_hour = self.config.hourly_cap;
        let limited = per_window > 0 || per_hour > 0;
        if limited && category.is_rate_limited() && event.priority() < Priority::Critical {
            let window = self.config.rate_window;
            let bucket = self
                .state
                .buckets
                .entry(category.as_str().to_string())
                .or_insert_with(|| TokenBucket::full(per_window, now));
            let hourly = self.state.hourly.get_or_insert_with(|| TokenBucket::full(per_hour, now));

            // ต้องมี token ทั้งสองฝั่งก่อน ถึงจะหักออก
            let window_ok = per_window == 0 || bucket.ready(per_window, window, now);
            let hour_ok = per_hour == 0 || hourly.ready(per_hour, Duration::hours(1), now);
            if !(window_ok && hour_ok) {
                if window_ok {
                    debug!(category = category.as_str(), "Hourly alert cap reached");
                }
                bucket.refuse(now);
                return Outcome::Suppress(SuppressReason::RateLimited);
            }
            if per_window > 0 {
                bucket.take();
            }
            if per_hour > 0 {
                hourly.take();
            }
        }

        Outcome::Deliver
    }

    /// One `AlertsSuppressed` per category whose suppression window elapsed.
    pub fn due_summaries(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        let window = self.config.rate_window;
        let mut summaries = Vec::new();

        let mut names: Vec<String> = self.state.buckets.keys().cloned().collect();
        names.sort();

        for name in names {
            let Some(bucket) = self.state.buckets.get_mut(&name) else { continue };
            let Some(since) = bucket.suppressed_since else { continue };
            if now - since < window || bucket.suppressed == 0 {
                continue;
            }
            let count = std::mem::take(&mut bucket.suppressed);
            bucket.suppressed_since = None;
            if let Some(category) = category_from_str(&name) {
                info!(category = %name, count, "🔇 Rate-limit summary");
                summaries.push(Event::new(now, EventBody::AlertsSuppressed { category, count }));
            }
        }
        summaries
    }

    /// Deferred alerts whose quiet window has ended, in arrival order.
    pub fn release_deferred(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        let (due, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.state.deferred).into_iter().partition(|d| d.until <= now);
        self.state.deferred = waiting;
        due.into_iter().map(|d| d.event).collect()
    }

    /// Forget dedup keys older than the window.
    fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.config.dedup_window;
        self.state.recent.retain(|_, seen| now - *seen < window);
    }
}

fn category_from_str(name: &str) -> Option<AlertCategory> {
    [
        AlertCategory::Trade,
        AlertCategory::Order,
        AlertCategory::PriceLevel,
        AlertCategory::Advisory,
        AlertCategory::Risk,
        AlertCategory::System,
    ]
    .into_iter()
    .find(|c| c.as_str() == name)
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::differ::tests::{order, position, t0};
    use crate::models::{OrderType, RiskKind, Side};

    fn closed(ticket: u64) -> Event {
        Event::new(t0(), EventBody::PositionClosed {
            position:   position(ticket, "EURUSD", Side::Buy, 0.1, 1.1),
            by_request: false,
        })
    }

    fn placed(ticket: u64) -> Event {
        Event::new(t0(), EventBody::OrderPlaced {
            order: order(ticket, "EURUSD", OrderType::BuyLimit, 0.1, 1.09),
        })
    }

    fn risk() -> Event {
        Event::new(t0(), EventBody::RiskWarning {
            risk:     RiskKind::MarginCritical,
            severity: Priority::Critical,
            message:  "margin level 80%".into(),
        })
    }

    fn make_policy(config: PolicyConfig) -> AlertPolicy {
        AlertPolicy::new(config, PolicyState::default())
    }

    #[test]
    fn test_duplicate_within_window_suppressed() {
        let mut policy = make_policy(PolicyConfig::default());
        assert!(policy.decide(closed(1), t0()).is_deliver());
        assert_eq!(
            policy.decide(closed(1), t0() + Duration::seconds(5)).outcome,
            Outcome::Suppress(SuppressReason::Duplicate)
        );
        assert!(policy.decide(closed(1), t0() + Duration::seconds(11)).is_deliver());
    }

    #[test]
    fn test_distinct_modifications_are_not_duplicates() {
        let mut policy = make_policy(PolicyConfig::default());
        let modified = |sl: f64| {
            Event::new(t0(), EventBody::PositionModified {
                position: position(1, "EURUSD", Side::Buy, 0.1, 1.1),
                changes:  vec![crate::models::FieldChange {
                    field: crate::models::ModifiedField::StopLoss,
                    old:   None,
                    new:   Some(sl),
                }],
            })
        };
        assert!(policy.decide(modified(1.09), t0()).is_deliver());
        assert!(policy.decide(modified(1.08), t0()).is_deliver());
    }

    #[test]
    fn test_burst_delivers_capacity_then_one_summary() {
        let config = PolicyConfig { rate_per_window: 3, ..Default::default() };
        let mut policy = make_policy(config);

        let delivered = (1..=8)
            .map(|t| policy.decide(placed(t), t0()))
            .filter(AlertDecision::is_deliver)
            .count();
        assert_eq!(delivered, 3);

        assert!(policy.due_summaries(t0() + Duration::seconds(30)).is_empty());
        let summaries = policy.due_summaries(t0() + Duration::seconds(60));
        assert_eq!(summaries.len(), 1);
        assert!(matches!(
            summaries[0].body,
            EventBody::AlertsSuppressed { category: AlertCategory::Order, count: 5 }
        ));
        assert!(policy.due_summaries(t0() + Duration::seconds(120)).is_empty());
    }

    #[test]
    fn test_buckets_are_per_category_and_refill() {
        let config = PolicyConfig { rate_per_window: 1, ..Default::default() };
        let mut policy = make_policy(config);

        assert!(policy.decide(placed(1), t0()).is_deliver());
        assert!(policy.decide(closed(2), t0()).is_deliver());
        assert!(!policy.decide(placed(3), t0()).is_deliver());
        assert!(policy.decide(placed(4), t0() + Duration::seconds(60)).is_deliver());
    }

    #[test]
    fn test_risk_is_never_rate_limited() {
        let config = PolicyConfig { rate_per_window: 1, dedup_window: Duration::zero(), ..Default::default() };
        let mut policy = make_policy(config);
        for _ in 0..5 {
            assert!(policy.decide(risk(), t0()).is_deliver());
        }
    }

    #[test]
    fn test_hourly_cap_spans_categories() {
        let config = PolicyConfig { rate_per_window: 0, hourly_cap: 3, ..Default::default() };
        let mut policy = make_policy(config);

        assert!(policy.decide(placed(1), t0()).is_deliver());
        assert!(policy.decide(closed(2), t0()).is_deliver());
        assert!(policy.decide(placed(3), t0()).is_deliver());
        assert_eq!(
            policy.decide(closed(4), t0()).outcome,
            Outcome::Suppress(SuppressReason::RateLimited)
        );
        assert!(policy.decide(risk(), t0()).is_deliver());
        assert!(policy.decide(closed(5), t0() + Duration::hours(1)).is_deliver());
    }

    #[test]
    fn test_hourly_refusal_keeps_minute_tokens() {
        let config = PolicyConfig { rate_per_window: 2, hourly_cap: 1, ..Default::default() };
        let mut policy = make_policy(config);

        assert!(policy.decide(placed(1), t0()).is_deliver());
        assert!(!policy.decide(placed(2), t0()).is_deliver());
        let bucket = &policy.state().buckets["order"];
        assert_eq!(bucket.tokens, 1.0);
        assert_eq!(bucket.suppressed, 1);
    }

    #[test]
    fn test_disabled_category_suppressed() {
        let mut config = PolicyConfig::default();
        config.disabled.insert(AlertCategory::Order);
        config.disabled.insert(AlertCategory::Risk);
        let mut policy = make_policy(config);

        assert_eq!(
            policy.decide(placed(1), t0()).outcome,
            Outcome::Suppress(SuppressReason::CategoryDisabled)
        );
        assert!(policy.decide(risk(), t0()).is_deliver());
    }

    #[test]
    fn test_quiet_hours_span_midnight() {
        let quiet = QuietHours::parse("22:00-07:00", 0).unwrap();
        let at = |h, m| Utc.with_ymd_and_hms(2025, 3, 3, h, m, 0).unwrap();
        assert!(quiet.contains(at(23, 30)));
        assert!(quiet.contains(at(2, 0)));
        assert!(!quiet.contains(at(7, 0)));
        assert!(!quiet.contains(at(12, 0)));
        assert_eq!(quiet.next_end(at(23, 30)), Utc.with_ymd_and_hms(2025, 3, 4, 7, 0, 0).unwrap());
        assert_eq!(quiet.next_end(at(2, 0)), at(7, 0));
    }

    #[test]
    fn test_quiet_hours_respect_offset() {
        // 22:00-07:00 at UTC+7 is 15:00-00:00 UTC
        let quiet = QuietHours::parse("22:00-07:00", 7 * 60).unwrap();
        assert!(quiet.contains(Utc.with_ymd_and_hms(2025, 3, 3, 16, 0, 0).unwrap()));
        assert!(!quiet.contains(Utc.with_ymd_and_hms(2025, 3, 3, 1, 0, 0).unwrap()));
    }

    #[test]
    fn test_quiet_hours_parse_rejects_garbage() {
        assert!(QuietHours::parse("22-07", 0).is_err());
        assert!(QuietHours::parse("10:00-10:00", 0).is_err());
    }

    #[test]
    fn test_quiet_suppress_lets_critical_through() {
        let config = PolicyConfig {
            quiet_hours: Some(QuietHours::parse("00:00-23:59", 0).unwrap()),
            ..Default::default()
        };
        let mut policy = make_policy(config);
        assert_eq!(
            policy.decide(closed(1), t0()).outcome,
            Outcome::Suppress(SuppressReason::QuietHours)
        );
        assert!(policy.decide(risk(), t0()).is_deliver());
    }

    fn margin_warning() -> Event {
        Event::new(t0(), EventBody::RiskWarning {
            risk:     RiskKind::MarginWarning,
            severity: Priority::Important,
            message:  "margin level 140%".into(),
        })
    }

    #[test]
    fn test_quiet_hours_never_hold_back_risk() {
        for mode in [QuietMode::Suppress, QuietMode::Defer] {
            let config = PolicyConfig {
                quiet_hours: Some(QuietHours::parse("00:00-23:59", 0).unwrap()),
                quiet_mode: mode,
                ..Default::default()
            };
            let mut policy = make_policy(config);
            assert_eq!(policy.decide(margin_warning(), t0()).outcome, Outcome::Deliver, "{mode:?}");
            assert_eq!(policy.deferred_len(), 0);
        }
    }

    #[test]
    fn test_new_outage_streak_is_not_a_duplicate() {
        let degraded = |at: DateTime<Utc>| {
            Event::new(at, EventBody::RiskWarning {
                risk:     RiskKind::ConnectionDegraded,
                severity: Priority::Critical,
                message:  "terminal unreachable".into(),
            })
        };
        let mut policy = make_policy(PolicyConfig::default());
        assert!(policy.decide(degraded(t0()), t0()).is_deliver());
        // recovered and failed again inside the dedup window
        let again = t0() + Duration::seconds(4);
        assert!(policy.decide(degraded(again), again).is_deliver());
        assert!(!policy.decide(degraded(again), again).is_deliver());
    }

    #[test]
    fn test_quiet_defer_releases_after_window() {
        let config = PolicyConfig {
            quiet_hours: Some(QuietHours::parse("11:00-13:00", 0).unwrap()),
            quiet_mode: QuietMode::Defer,
            ..Default::default()
        };
        let mut policy = make_policy(config);
        let end = Utc.with_ymd_and_hms(2025, 3, 3, 13, 0, 0).unwrap();

        assert_eq!(policy.decide(closed(1), t0()).outcome, Outcome::Defer(end));
        assert_eq!(policy.deferred_len(), 1);
        assert!(policy.release_deferred(end - Duration::seconds(1)).is_empty());
        let released = policy.release_deferred(end);
        assert_eq!(released.len(), 1);
        assert_eq!(policy.deferred_len(), 0);
    }

    #[test]
    fn test_suppressed_duplicate_does_not_refresh_window() {
        let config = PolicyConfig {
            quiet_hours: Some(QuietHours::parse("00:00-23:59", 0).unwrap()),
            ..Default::default()
        };
        let mut policy = make_policy(config);
        // quiet-suppressed, so the key was never recorded
        policy.decide(closed(1), t0());
        assert!(policy.state().recent.is_empty());
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let config = PolicyConfig { rate_per_window: 1, ..Default::default() };
        let mut policy = make_policy(config.clone());
        policy.decide(placed(1), t0());
        policy.decide(placed(2), t0());

        let json = serde_json::to_string(policy.state()).unwrap();
        let restored: PolicyState = serde_json::from_str(&json).unwrap();
        let mut policy = AlertPolicy::new(config, restored);
        assert_eq!(
            policy.decide(placed(1), t0() + Duration::seconds(1)).outcome,
            Outcome::Suppress(SuppressReason::Duplicate)
        );
        assert_eq!(policy.due_summaries(t0() + Duration::seconds(60)).len(), 1);
    }
}
