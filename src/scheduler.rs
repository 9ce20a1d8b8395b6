//! # scheduler — Poll Scheduler
//!
//! Drives the whole pipeline on a fixed interval:
//!
//! ```text
//!  ┌──────────┐ fetch ok  ┌─────────┐  sleep(interval)
//!  │Connecting│ ────────▶ │ Polling │ ◀──────────────┐
//!  └──────────┘           └─────────┘ ───────────────┘
//!       │ fetch err            │ fetch err
//!       ▼                      ▼
//!  ┌──────────────────────────────┐  sleep(base·2ⁿ, capped)
//!  │           Backoff            │ ───────────▶ retry
//!  └──────────────────────────────┘
//!  shutdown signal (any state) ──▶ ShuttingDown ──▶ Stopped
//! ```
//!
//! ## One cycle
//! 1. fetch snapshot (no lock held)
//! 2. fetch prices for symbols with live levels (no lock held)
//! 3. lock engine → observe → advisor → policy → dispatch → commit → persist
//!
//! A failed fetch produces no events and leaves the baseline untouched, so
//! the next good cycle diffs against the last good snapshot.  Shutdown is
//! checked between cycles; an in-flight cycle always completes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::advisor::{advise, ProfitAdvisor, TradeFeatures};
use crate::engine::risk::risk_event;
use crate::engine::SharedEngine;
use crate::error::AppError;
use crate::models::{Event, EventBody, Priority, RiskKind, TradingSnapshot};
use crate::notify::{DeliveryReport, Dispatcher};
use crate::source::{fetch_prices, fetch_snapshot, SnapshotSource};
use crate::store::StateStore;

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval:   Duration,
    pub backoff_base:    Duration,
    pub backoff_max:     Duration,
    pub fetch_timeout:   Duration,
    /// How often the levels file's mtime is checked.
    pub levels_reload:   Duration,
    pub advisor_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval:   Duration::from_secs(5),
            backoff_base:    Duration::from_secs(2),
            backoff_max:     Duration::from_secs(120),
            fetch_timeout:   Duration::from_secs(5),
            levels_reload:   Duration::from_secs(30),
            advisor_timeout: Duration::from_secs(3),
        }
    }
}

// ─── Status ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Connecting,
    Polling,
    Backoff,
    ShuttingDown,
    Stopped,
}

/// Loop health, for `/api/status`.
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub state:            LoopState,
    pub cycles:           u64,
    pub failure_streak:   u32,
    pub last_success_at:  Option<DateTime<Utc>>,
    pub last_error:       Option<String>,
    pub events_observed:  u64,
    pub alerts_delivered: u64,
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self {
            state:            LoopState::Idle,
            cycles:           0,
            failure_streak:   0,
            last_success_at:  None,
            last_error:       None,
            events_observed:  0,
            alerts_delivered: 0,
        }
    }
}

pub type SharedStatus = Arc<RwLock<LoopStatus>>;

// ─── Backoff ──────────────────────────────────────────────────────────────────

/// `base · 2^(failures-1)`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Failure streak bookkeeping.  An outage is announced once, on its first
/// failed poll, and its end once, on the first good poll after it.
#[derive(Debug, Default)]
pub struct Outage {
    failures: u32,
}

impl Outage {
    /// Record a failure.  `true` only for the first failure of a streak.
    pub fn fail(&mut self) -> bool {
        self.failures += 1;
        self.failures == 1
    }

    /// Record a success.  Returns the length of the streak that just ended.
    pub fn recover(&mut self) -> Option<u32> {
        Some(std::mem::take(&mut self.failures)).filter(|f| *f > 0)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// What one successful cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub observed: usize,
    pub delivered: usize,
    pub delivery: DeliveryReport,
}

// ─── Scheduler ────────────────────────────────────────────────────────────────

pub struct Scheduler {
    source:     Arc<dyn SnapshotSource>,
    engine:     SharedEngine,
    dispatcher: Arc<Dispatcher>,
    store:      StateStore,
    advisor:    Option<Arc<dyn ProfitAdvisor>>,
    status:     SharedStatus,
    config:     SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        engine: SharedEngine,
        dispatcher: Arc<Dispatcher>,
        store: StateStore,
        advisor: Option<Arc<dyn ProfitAdvisor>>,
        status: SharedStatus,
        config: SchedulerConfig,
    ) -> Self {
        Self { source, engine, dispatcher, store, advisor, status, config }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn set_state(&self, state: LoopState) {
        self.status.write().await.state = state;
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.poll_interval.as_secs_f64(),
            backoff_max   = self.config.backoff_max.as_secs(),
            "🔄 Poll scheduler started"
        );
        self.set_state(LoopState::Connecting).await;

        let mut outage = Outage::default();
        let mut last_reload = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_reload.elapsed() >= self.config.levels_reload {
                last_reload = Instant::now();
                self.reload_levels().await;
            }

            let streak = Some(outage.failures()).filter(|f| *f > 0);
            let delay = match self.run_cycle(Utc::now(), streak).await {
                Ok(report) => {
                    outage.recover();
                    debug!(observed = report.observed, delivered = report.delivered, "Cycle complete");
                    self.set_state(LoopState::Polling).await;
                    self.config.poll_interval
                }
                Err(e) => {
                    if outage.fail() {
                        let message = format!("Terminal unreachable, retrying with backoff: {e}");
                        let event = risk_event(Utc::now(), RiskKind::ConnectionDegraded, Priority::Critical, message);
                        self.announce(vec![event], Utc::now()).await;
                    }
                    let delay = backoff_delay(self.config.backoff_base, self.config.backoff_max, outage.failures());
                    warn!(
                        error    = %e,
                        failures = outage.failures(),
                        retry_in = delay.as_secs_f64(),
                        "⏳ Poll failed — backing off"
                    );
                    {
                        let mut status = self.status.write().await;
                        status.state = LoopState::Backoff;
                        status.failure_streak = outage.failures();
                        status.last_error = Some(e.to_string());
                    }
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.set_state(LoopState::ShuttingDown).await;
        info!("🛑 Poll scheduler shutting down");
        {
            let engine = self.engine.lock().await;
            if let Err(e) = self.store.save(&engine.snapshot_state(Utc::now())) {
                error!(error = %e, "Final state save failed");
            }
        }
        self.set_state(LoopState::Stopped).await;
        info!("Poll scheduler stopped");
    }

    /// One poll cycle.  `streak` is the failure streak that preceded it, if
    /// any; a good cycle after one leads with a ConnectionRestored notice.
    pub async fn run_cycle(&self, now: DateTime<Utc>, streak: Option<u32>) -> Result<CycleReport, AppError> {
        // ── 1. Fetch (ยังไม่ถือ lock) ────────────────────────────────────────
        let snapshot = fetch_snapshot(self.source.as_ref(), self.config.fetch_timeout).await?;
        let symbols = self.engine.lock().await.levels.live_symbols();
        let prices = fetch_prices(self.source.as_ref(), &symbols, self.config.fetch_timeout).await;

        // ── 2. Compute, decide, dispatch, commit (ถือ lock ตลอด) ─────────────
        let mut engine = self.engine.lock().await;

        let mut events = Vec::new();
        if let Some(failed_cycles) = streak {
            info!(failed_cycles, "🔌 Connection restored");
            events.push(Event::new(now, EventBody::ConnectionRestored { failed_cycles }));
        }
        events.extend(engine.observe(&snapshot, &prices, now));
        self.enrich_suggestions(&mut events, &snapshot, now).await;
        let observed = events.len();

        let decisions = engine.decide(events, now);
        let deliver: Vec<Event> = decisions
            .into_iter()
            .filter(|d| d.is_deliver())
            .map(|d| d.event)
            .collect();
        let released = engine.policy.release_deferred(now);

        let mut delivery = self.dispatcher.dispatch(&deliver).await;
        let digest = self.dispatcher.dispatch_digest(&released).await;
        delivery.messages += digest.messages;
        delivery.delivered += digest.delivered;
        delivery.failed += digest.failed;

        engine.commit(snapshot);
        if let Err(e) = self.store.save(&engine.snapshot_state(now)) {
            error!(error = %e, "❌ Engine state save failed");
        }
        drop(engine);

        {
            let mut status = self.status.write().await;
            status.cycles += 1;
            status.failure_streak = 0;
            status.last_success_at = Some(now);
            status.last_error = None;
            status.events_observed += observed as u64;
            status.alerts_delivered += deliver.len() as u64;
        }

        Ok(CycleReport { observed, delivered: deliver.len(), delivery })
    }

    /// Push events that arise outside a poll cycle through policy and dispatch.
    pub async fn announce(&self, events: Vec<Event>, now: DateTime<Utc>) -> DeliveryReport {
        let mut engine = self.engine.lock().await;
        let deliver: Vec<Event> = engine
            .decide(events, now)
            .into_iter()
            .filter(|d| d.is_deliver())
            .map(|d| d.event)
            .collect();
        let report = self.dispatcher.dispatch(&deliver).await;
        if let Err(e) = self.store.save(&engine.snapshot_state(now)) {
            error!(error = %e, "❌ Engine state save failed");
        }
        report
    }

    async fn reload_levels(&self) {
        let mut engine = self.engine.lock().await;
        match engine.levels.reload_if_changed() {
            Ok(true) => info!(levels = engine.levels.len(), "📐 Levels file changed — reloaded"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Levels reload failed — keeping current levels"),
        }
    }

    /// Ask the advisor about every new profit suggestion, concurrently and
    /// within the advisor timeout.
    async fn enrich_suggestions(&self, events: &mut [Event], snapshot: &TradingSnapshot, now: DateTime<Utc>) {
        let Some(advisor) = self.advisor.as_deref() else { return };
        let timeout = self.config.advisor_timeout;

        let asks = events.iter_mut().filter_map(|event| {
            let EventBody::ProfitSuggestion { suggestion } = &mut event.body else { return None };
            let position = snapshot.position(suggestion.ticket)?;
            let features = TradeFeatures::from_position(position, suggestion, now);
            Some(async move {
                suggestion.recommendation = advise(advisor, &features, timeout).await;
            })
        });
        join_all(asks).await;
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
