//! # source
//!
//! Where snapshots and prices come from, and where trade commands go.
//!
//! [`SnapshotSource`] is the seam between the engine and the terminal; the
//! production implementation is the HTTP bridge in [`mt5`], tests use an
//! in-memory fake.

pub mod mt5;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::models::{AccountSnapshot, Order, Position, TradingSnapshot};

/// Terminal's answer to an accepted command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandAck {
    pub retcode: u32,
    pub ticket: Option<u64>,
    pub comment: String,
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn account(&self) -> Result<AccountSnapshot, AppError>;
    async fn positions(&self) -> Result<Vec<Position>, AppError>;
    async fn orders(&self) -> Result<Vec<Order>, AppError>;
    /// Current mid price for `symbol`.
    async fn price(&self, symbol: &str) -> Result<f64, AppError>;

    async fn close_position(&self, ticket: u64) -> Result<CommandAck, AppError>;
    async fn modify_position(&self, ticket: u64, sl: Option<f64>, tp: Option<f64>) -> Result<CommandAck, AppError>;
    async fn partial_close(&self, ticket: u64, volume: f64) -> Result<CommandAck, AppError>;
}

/// Fetch account, positions and orders concurrently as one snapshot.
///
/// All three must succeed within `timeout`, and the account's position count
/// must agree with the position list; otherwise the whole snapshot is
/// rejected as `SourceUnavailable` so a half-read never looks like closes.
pub async fn fetch_snapshot(
    source: &dyn SnapshotSource,
    timeout: Duration,
) -> Result<TradingSnapshot, AppError> {
    let fetch = async { tokio::try_join!(source.account(), source.positions(), source.orders()) };

    let (account, positions, orders) = tokio::time::timeout(timeout, fetch)
        .await
        .map_err(|_| AppError::SourceUnavailable(format!("snapshot fetch exceeded {}s", timeout.as_secs_f64())))??;

    let snapshot = TradingSnapshot { account, positions, orders };
    if !snapshot.is_consistent() {
        return Err(AppError::SourceUnavailable(format!(
            "inconsistent snapshot: account reports {} positions, list has {}",
            snapshot.account.open_positions,
            snapshot.positions.len()
        )));
    }

    debug!(
        positions = snapshot.positions.len(),
        orders    = snapshot.orders.len(),
        equity    = snapshot.account.equity,
        "Snapshot fetched"
    );
    Ok(snapshot)
}

/// Fetch prices for `symbols` concurrently.  A failed symbol is logged and
/// left out; the others still come back.
pub async fn fetch_prices(
    source: &dyn SnapshotSource,
    symbols: &[String],
    timeout: Duration,
) -> HashMap<String, f64> {
    let lookups = symbols.iter().map(|symbol| async move {
        let result = tokio::time::timeout(timeout, source.price(symbol)).await;
        (symbol, result)
    });

    let mut prices = HashMap::with_capacity(symbols.len());
    for (symbol, result) in join_all(lookups).await {
        match result {
            Ok(Ok(price)) if price.is_finite() => {
                prices.insert(symbol.clone(), price);
            }
            Ok(Ok(price)) => warn!(symbol = %symbol, price, "Non-finite price ignored"),
            Ok(Err(e)) => warn!(symbol = %symbol, error = %e, "Price fetch failed"),
            Err(_) => warn!(symbol = %symbol, "Price fetch timed out"),
        }
    }
    prices
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use crate::engine::differ::tests::snapshot;

    /// Scriptable in-memory terminal.
    #[derive(Default)]
    pub struct FakeSource {
        pub snapshot: Mutex<Option<TradingSnapshot>>,
        pub prices: Mutex<HashMap<String, f64>>,
        pub down: AtomicBool,
        pub reject_commands: AtomicBool,
        pub commands: Mutex<Vec<String>>,
    }

    impl FakeSource {
        pub fn with_snapshot(snap: TradingSnapshot) -> Self {
            let source = Self::default();
            source.set_snapshot(snap);
            source
        }

        pub fn set_snapshot(&self, snap: TradingSnapshot) {
            *self.snapshot.lock().unwrap() = Some(snap);
        }

        pub fn set_price(&self, symbol: &str, price: f64) {
            self.prices.lock().unwrap().insert(symbol.to_string(), price);
        }

        pub fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn current(&self) -> Result<TradingSnapshot, AppError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(AppError::SourceUnavailable("bridge down".into()));
            }
            Ok(self.snapshot.lock().unwrap().clone().unwrap_or_else(|| snapshot(vec![], vec![])))
        }

        fn command(&self, text: String) -> Result<CommandAck, AppError> {
            self.commands.lock().unwrap().push(text);
            if self.reject_commands.load(Ordering::SeqCst) {
                return Err(AppError::CommandFailed("MT5 rejected: retcode=10006 comment=Request rejected".into()));
            }
            Ok(CommandAck { retcode: 10009, ticket: None, comment: "done".into() })
        }
    }

    #[async_trait]
    impl SnapshotSource for FakeSource {
        async fn account(&self) -> Result<AccountSnapshot, AppError> {
            Ok(self.current()?.account)
        }
        async fn positions(&self) -> Result<Vec<Position>, AppError> {
            Ok(self.current()?.positions)
        }
        async fn orders(&self) -> Result<Vec<Order>, AppError> {
            Ok(self.current()?.orders)
        }
        async fn price(&self, symbol: &str) -> Result<f64, AppError> {
            self.prices
                .lock()
                .unwrap()
                .get(symbol)
                .copied()
                .ok_or_else(|| AppError::SourceUnavailable(format!("no tick for {symbol}")))
        }
        async fn close_position(&self, ticket: u64) -> Result<CommandAck, AppError> {
            self.command(format!("close {ticket}"))
        }
        async fn modify_position(&self, ticket: u64, sl: Option<f64>, tp: Option<f64>) -> Result<CommandAck, AppError> {
            self.command(format!("modify {ticket} {sl:?} {tp:?}"))
        }
        async fn partial_close(&self, ticket: u64, volume: f64) -> Result<CommandAck, AppError> {
            self.command(format!("partial {ticket} {volume}"))
        }
    }

    #[tokio::test]
    async fn test_fetch_snapshot_rejects_inconsistent_count() {
        let mut snap = snapshot(vec![], vec![]);
        snap.account.open_positions = 2;
        let source = FakeSource::with_snapshot(snap);

        let result = fetch_snapshot(&source, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(AppError::SourceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_fetch_snapshot_propagates_outage() {
        let source = FakeSource::default();
        source.set_down(true);
        assert!(fetch_snapshot(&source, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_prices_isolates_failures() {
        let source = FakeSource::default();
        source.set_price("EURUSD", 1.1);
        source.set_price("BTCUSD", f64::NAN);

        let symbols = vec!["EURUSD".to_string(), "XAUUSD".to_string(), "BTCUSD".to_string()];
        let prices = fetch_prices(&source, &symbols, Duration::from_secs(1)).await;
        assert_eq!(prices.len(), 1);
        assert_eq!(prices.get("EURUSD"), Some(&1.1));
    }
}
