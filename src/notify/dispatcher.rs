//! # notify::dispatcher
//!
//! **Alert Dispatcher** — renders delivered events and pushes them to every
//! configured channel.
//!
//! ## Delivery rules
//! - Each channel send is bounded by `timeout` and retried up to
//!   `max_attempts` times with a linear delay; then it is dropped and logged.
//! - Channels are independent: one failing channel never blocks the others.
//! - With grouping on, same-kind trade/order/level events for different
//!   symbols in one batch become one message.  Grouping only looks inside a
//!   batch, so it never delays anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::AppError;
use crate::models::{Event, EventBody};
use crate::notify::render::{render, render_digest, render_group};
use crate::notify::{Message, Notifier};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub grouping: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout:      Duration::from_secs(10),
            max_attempts: 3,
            retry_delay:  Duration::from_millis(500),
            grouping:     true,
        }
    }
}

/// Outcome of one dispatch call, counted per (message, channel) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub messages: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl DeliveryReport {
    fn merge(&mut self, other: DeliveryReport) {
        self.messages += other.messages;
        self.delivered += other.delivered;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryStats {
    pub channels: Vec<&'static str>,
    pub delivered: u64,
    pub failed: u64,
}

pub struct Dispatcher {
    notifiers: Vec<Arc<dyn Notifier>>,
    config:    DispatchConfig,
    delivered: AtomicU64,
    failed:    AtomicU64,
}

impl Dispatcher {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>, config: DispatchConfig) -> Self {
        Self { notifiers, config, delivered: AtomicU64::new(0), failed: AtomicU64::new(0) }
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            channels:  self.notifiers.iter().map(|n| n.name()).collect(),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed:    self.failed.load(Ordering::Relaxed),
        }
    }

    /// Messages for a batch, in event order, grouped where allowed.
    pub fn plan(&self, events: &[Event]) -> Vec<Message> {
        if !self.config.grouping {
            return events.iter().map(render).collect();
        }

        let mut batches: Vec<Vec<&Event>> = Vec::new();
        let mut slot_of: HashMap<&'static str, usize> = HashMap::new();
        for event in events {
            if groupable(event) {
                if let Some(&slot) = slot_of.get(event.kind()) {
                    batches[slot].push(event);
                    continue;
                }
                slot_of.insert(event.kind(), batches.len());
            }
            batches.push(vec![event]);
        }

        let mut messages = Vec::with_capacity(batches.len());
        for batch in batches {
            let mut symbols: Vec<&str> = batch.iter().filter_map(|e| e.symbol()).collect();
            symbols.sort_unstable();
            symbols.dedup();
            if batch.len() > 1 && symbols.len() > 1 {
                let owned: Vec<Event> = batch.into_iter().cloned().collect();
                messages.push(render_group(&owned));
            } else {
                messages.extend(batch.into_iter().map(render));
            }
        }
        messages
    }

    pub async fn dispatch(&self, events: &[Event]) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for message in self.plan(events) {
            report.merge(self.send_message(&message).await);
        }
        if report.messages > 0 {
            info!(
                messages  = report.messages,
                delivered = report.delivered,
                failed    = report.failed,
                "📨 Alerts dispatched"
            );
        }
        report
    }

    /// Flush alerts deferred by quiet hours as a single digest.
    pub async fn dispatch_digest(&self, events: &[Event]) -> DeliveryReport {
        if events.is_empty() {
            return DeliveryReport::default();
        }
        info!(count = events.len(), "🌅 Flushing quiet-hours digest");
        self.send_message(&render_digest(events)).await
    }

    /// Send one message to every channel concurrently.
    pub async fn send_message(&self, message: &Message) -> DeliveryReport {
        let sends = self.notifiers.iter().map(|n| self.send_with_retry(n.as_ref(), message));
        let results = join_all(sends).await;

        let mut report = DeliveryReport { messages: 1, ..Default::default() };
        for result in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(_) => report.failed += 1,
            }
        }
        self.delivered.fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
        report
    }

    async fn send_with_retry(&self, notifier: &dyn Notifier, message: &Message) -> Result<(), AppError> {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.config.timeout, notifier.send(message)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("timed out after {}ms", self.config.timeout.as_millis()),
            }
            warn!(channel = notifier.name(), attempt, error = %last_error, "Delivery attempt failed");
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay * attempt).await;
            }
        }

        error!(channel = notifier.name(), title = %message.title, error = %last_error, "❌ Alert dropped");
        Err(AppError::DeliveryFailed(format!("{}: {last_error}", notifier.name())))
    }
}

fn groupable(event: &Event) -> bool {
    matches!(
        event.body,
        EventBody::PositionOpened { .. }
            | EventBody::PositionClosed { .. }
            | EventBody::OrderPlaced { .. }
            | EventBody::OrderFilled { .. }
            | EventBody::OrderExpired { .. }
            | EventBody::OrderCancelled { .. }
            | EventBody::PriceLevelTriggered { .. }
    )
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    use crate::engine::differ::tests::{position, t0};
    use crate::models::Side;

    /// Records messages; fails the first `fail_first` sends.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<Message>>,
        pub fail_first: AtomicU32,
        pub delay: Option<Duration>,
    }

    impl RecordingNotifier {
        pub fn titles(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|m| m.title.clone()).collect()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send(&self, message: &Message) -> Result<(), AppError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(AppError::DeliveryFailed("flaky".into()));
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    pub fn fast_config() -> DispatchConfig {
        DispatchConfig {
            timeout:      Duration::from_millis(100),
            max_attempts: 3,
            retry_delay:  Duration::from_millis(1),
            grouping:     true,
        }
    }

    fn opened(ticket: u64, symbol: &str) -> Event {
        Event::new(t0(), EventBody::PositionOpened {
            position:   position(ticket, symbol, Side::Buy, 0.1, 1.1),
            from_order: None,
        })
    }

    fn closed(ticket: u64, symbol: &str) -> Event {
        Event::new(t0(), EventBody::PositionClosed {
            position:   position(ticket, symbol, Side::Buy, 0.1, 1.1),
            by_request: false,
        })
    }

    #[test]
    fn test_plan_groups_same_kind_across_symbols() {
        let dispatcher = Dispatcher::new(Vec::new(), fast_config());
        let events = vec![closed(1, "EURUSD"), closed(2, "GBPUSD"), opened(3, "EURUSD")];

        let messages = dispatcher.plan(&events);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].title.starts_with("🔴 Trade CLOSED ×2"));
        assert!(messages[1].title.starts_with("🟢 Trade OPENED"));
    }

    #[test]
    fn test_plan_keeps_same_symbol_separate() {
        let dispatcher = Dispatcher::new(Vec::new(), fast_config());
        let events = vec![opened(1, "EURUSD"), opened(2, "EURUSD")];
        assert_eq!(dispatcher.plan(&events).len(), 2);
    }

    #[test]
    fn test_plan_without_grouping_is_one_per_event() {
        let config = DispatchConfig { grouping: false, ..fast_config() };
        let dispatcher = Dispatcher::new(Vec::new(), config);
        let events = vec![closed(1, "EURUSD"), closed(2, "GBPUSD")];
        assert_eq!(dispatcher.plan(&events).len(), 2);
    }

    #[tokio::test]
    async fn test_retry_then_deliver() {
        let notifier = Arc::new(RecordingNotifier { fail_first: AtomicU32::new(2), ..Default::default() });
        let dispatcher = Dispatcher::new(vec![notifier.clone()], fast_config());

        let report = dispatcher.dispatch(&[closed(1, "EURUSD")]).await;
        assert_eq!(report, DeliveryReport { messages: 1, delivered: 1, failed: 0 });
        assert_eq!(notifier.titles(), vec!["🔴 Trade CLOSED".to_string()]);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let notifier = Arc::new(RecordingNotifier { fail_first: AtomicU32::new(10), ..Default::default() });
        let dispatcher = Dispatcher::new(vec![notifier.clone()], fast_config());

        let report = dispatcher.dispatch(&[closed(1, "EURUSD")]).await;
        assert_eq!(report.failed, 1);
        assert_eq!(notifier.fail_first.load(Ordering::SeqCst), 7);
        assert_eq!(dispatcher.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_slow_channel_times_out_without_blocking_others() {
        let slow = Arc::new(RecordingNotifier { delay: Some(Duration::from_secs(5)), ..Default::default() });
        let fast = Arc::new(RecordingNotifier::default());
        let config = DispatchConfig { max_attempts: 1, ..fast_config() };
        let dispatcher = Dispatcher::new(vec![slow.clone(), fast.clone()], config);

        let report = dispatcher.dispatch(&[closed(1, "EURUSD")]).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(fast.titles().len(), 1);
    }

    #[tokio::test]
    async fn test_digest_is_one_message() {
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = Dispatcher::new(vec![notifier.clone()], fast_config());

        dispatcher.dispatch_digest(&[closed(1, "EURUSD"), opened(2, "XAUUSD")]).await;
        assert_eq!(notifier.titles(), vec!["🌅 Quiet Hours Digest".to_string()]);
        assert!(dispatcher.dispatch_digest(&[]).await.messages == 0);
    }
}
