//! # source::mt5
//!
//! **MT5 Bridge client** — reads terminal state and sends position commands
//! over the EA's HTTP bridge.
//!
//! ## Bridge API Contract (MQL5 side)
//! ```text
//! GET  /account                  { balance, equity, margin, margin_level, positions_total }
//! GET  /positions                [ { ticket, symbol, type, volume, price_open, price_current,
//!                                    profit, sl, tp, time } ]
//! GET  /orders                   [ { ticket, symbol, type, volume_current, price_open,
//!                                    time_setup, time_expiration } ]
//! GET  /tick/{symbol}            { bid, ask }
//! POST /position/close           { ticket }                → { retcode, order, comment }
//! POST /position/modify          { ticket, sl, tp }        → { retcode, order, comment }
//! POST /position/close_partial   { ticket, volume }        → { retcode, order, comment }
//! ```
//! Times are Unix seconds; `sl`/`tp`/`time_expiration` of 0 mean "not set".
//! retcode 10009 = `TRADE_RETCODE_DONE`, the only success code.
//!
//! A base URL of `mock` short-circuits every call (empty account, commands
//! accepted) for running without a terminal.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::AppError;
use crate::models::{AccountSnapshot, Order, OrderType, Position, Side};
use crate::source::{CommandAck, SnapshotSource};

/// MT5 `TRADE_RETCODE_DONE`.
const RETCODE_DONE: u32 = 10009;

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireAccount {
    balance:         f64,
    equity:          f64,
    margin:          f64,
    #[serde(default)]
    margin_level:    Option<f64>,
    positions_total: usize,
}

#[derive(Debug, Deserialize)]
struct WirePosition {
    ticket:        u64,
    symbol:        String,
    #[serde(rename = "type")]
    kind:          u8,
    volume:        f64,
    price_open:    f64,
    price_current: f64,
    profit:        f64,
    #[serde(default)]
    sl:            f64,
    #[serde(default)]
    tp:            f64,
    time:          i64,
}

#[derive(Debug, Deserialize)]
struct WireOrder {
    ticket:          u64,
    symbol:          String,
    #[serde(rename = "type")]
    kind:            u8,
    volume_current:  f64,
    price_open:      f64,
    time_setup:      i64,
    #[serde(default)]
    time_expiration: i64,
}

#[derive(Debug, Deserialize)]
struct WireTick {
    bid: f64,
    ask: f64,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum CommandRequest {
    Close { ticket: u64 },
    Modify { ticket: u64, sl: f64, tp: f64 },
    Partial { ticket: u64, volume: f64 },
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    retcode: u32,
    order:   Option<u64>,
    comment: Option<String>,
}

// ─── Conversion ───────────────────────────────────────────────────────────────

fn unix(secs: i64) -> Result<DateTime<Utc>, AppError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| AppError::SourceUnavailable(format!("invalid timestamp {secs}")))
}

fn non_zero(value: f64) -> Option<f64> {
    (value != 0.0).then_some(value)
}

impl WirePosition {
    /// MT5 `POSITION_TYPE`: 0 = buy, 1 = sell.  Anything else fails the whole
    /// fetch; dropping the entry would read as a close.
    fn into_position(self) -> Result<Position, AppError> {
        let side = match self.kind {
            0 => Side::Buy,
            1 => Side::Sell,
            other => {
                return Err(AppError::SourceUnavailable(format!(
                    "position {} has unknown type {other}",
                    self.ticket
                )))
            }
        };
        Ok(Position {
            ticket:        self.ticket,
            symbol:        self.symbol,
            side,
            volume:        self.volume,
            open_price:    self.price_open,
            open_time:     unix(self.time)?,
            current_price: self.price_current,
            profit:        self.profit,
            stop_loss:     non_zero(self.sl),
            take_profit:   non_zero(self.tp),
        })
    }
}

impl WireOrder {
    /// MT5 `ORDER_TYPE` 2..=7 are the pending types.  Market orders (0/1) in
    /// flight are not pending orders and are skipped.
    fn into_order(self) -> Result<Option<Order>, AppError> {
        let order_type = match self.kind {
            2 => OrderType::BuyLimit,
            3 => OrderType::SellLimit,
            4 => OrderType::BuyStop,
            5 => OrderType::SellStop,
            6 => OrderType::BuyStopLimit,
            7 => OrderType::SellStopLimit,
            other => {
                warn!(ticket = self.ticket, order_type = other, "Non-pending order type skipped");
                return Ok(None);
            }
        };
        let expiration = match self.time_expiration {
            0 => None,
            secs => Some(unix(secs)?),
        };
        Ok(Some(Order {
            ticket: self.ticket,
            symbol: self.symbol,
            order_type,
            volume: self.volume_current,
            price: self.price_open,
            setup_time: unix(self.time_setup)?,
            expiration,
        }))
    }
}

// ─── Mt5Bridge ────────────────────────────────────────────────────────────────

pub struct Mt5Bridge {
    client:          reqwest::Client,
    base_url:        String,
    fetch_timeout:   Duration,
    command_timeout: Duration,
}

impl Mt5Bridge {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, fetch_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            fetch_timeout,
            command_timeout,
        }
    }

    fn is_mock(&self) -> bool {
        self.base_url == "mock"
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, AppError> {
        let url = format!("{}{path}", self.base_url);

        let response = self
            .client
            .get(&url)
            .timeout(self.fetch_timeout)
            .send()
            .await
            .map_err(|e| AppError::SourceUnavailable(format!("MT5 unreachable: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::SourceUnavailable(format!("MT5 HTTP {status} on {path}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::SourceUnavailable(format!("MT5 response parse error on {path}: {e}")))
    }

    async fn command(&self, path: &str, request: CommandRequest) -> Result<CommandAck, AppError> {
        if self.is_mock() {
            info!(path, request = ?request, "🎭 [BRIDGE] MOCK mode — simulating MT5 success");
            return Ok(CommandAck { retcode: RETCODE_DONE, ticket: None, comment: "Mock command".into() });
        }

        let url = format!("{}{path}", self.base_url);
        info!(request = ?request, mt5_url = %url, "🚀 [BRIDGE] Sending command to MT5");

        // ── HTTP POST ─────────────────────────────────────────────────────────
        let response = self
            .client
            .post(&url)
            .json(&request)
            .timeout(self.command_timeout)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "MT5 unreachable");
                AppError::CommandFailed(format!("MT5 unreachable: {e}"))
            })?;

        // ── HTTP Status ───────────────────────────────────────────────────────
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(http_status = %status, body = %body, "MT5 returned HTTP error");
            return Err(AppError::CommandFailed(format!("MT5 HTTP {status}: {body}")));
        }

        // ── Parse Response ────────────────────────────────────────────────────
        let resp: CommandResponse = response.json().await.map_err(|e| {
            error!(error = %e, "MT5 response parse failed");
            AppError::CommandFailed(format!("MT5 response parse error: {e}"))
        })?;

        // ── Check retcode ─────────────────────────────────────────────────────
        let comment = resp.comment.unwrap_or_default();
        if resp.retcode != RETCODE_DONE {
            let msg = format!("MT5 rejected: retcode={} comment={}", resp.retcode, comment);
            warn!("{msg}");
            return Err(AppError::CommandFailed(msg));
        }

        info!(ticket = ?resp.order, "✅ [BRIDGE] MT5 accepted command");
        Ok(CommandAck { retcode: resp.retcode, ticket: resp.order, comment })
    }
}

#[async_trait]
impl SnapshotSource for Mt5Bridge {
    async fn account(&self) -> Result<AccountSnapshot, AppError> {
        if self.is_mock() {
            return Ok(AccountSnapshot {
                balance:        0.0,
                equity:         0.0,
                margin:         0.0,
                margin_level:   None,
                open_positions: 0,
                timestamp:      Utc::now(),
            });
        }
        let wire: WireAccount = self.get("/account").await?;
        Ok(AccountSnapshot {
            balance:        wire.balance,
            equity:         wire.equity,
            margin:         wire.margin,
            // MT5 ส่ง 0 มาเมื่อไม่มี margin ใช้งานอยู่
            margin_level:   wire.margin_level.filter(|l| *l > 0.0),
            open_positions: wire.positions_total,
            timestamp:      Utc::now(),
        })
    }

    async fn positions(&self) -> Result<Vec<Position>, AppError> {
        if self.is_mock() {
            return Ok(Vec::new());
        }
        let wire: Vec<WirePosition> = self.get("/positions").await?;
        wire.into_iter().map(WirePosition::into_position).collect()
    }

    async fn orders(&self) -> Result<Vec<Order>, AppError> {
        if self.is_mock() {
            return Ok(Vec::new());
        }
        let wire: Vec<WireOrder> = self.get("/orders").await?;
        let mut orders = Vec::with_capacity(wire.len());
        for entry in wire {
            if let Some(order) = entry.into_order()? {
                orders.push(order);
            }
        }
        Ok(orders)
    }

    async fn price(&self, symbol: &str) -> Result<f64, AppError> {
        if self.is_mock() {
            return Err(AppError::SourceUnavailable("no ticks in mock mode".into()));
        }
        let tick: WireTick = self.get(&format!("/tick/{symbol}")).await?;
        Ok((tick.bid + tick.ask) / 2.0)
    }

    async fn close_position(&self, ticket: u64) -> Result<CommandAck, AppError> {
        self.command("/position/close", CommandRequest::Close { ticket }).await
    }

    async fn modify_position(&self, ticket: u64, sl: Option<f64>, tp: Option<f64>) -> Result<CommandAck, AppError> {
        let request = CommandRequest::Modify { ticket, sl: sl.unwrap_or(0.0), tp: tp.unwrap_or(0.0) };
        self.command("/position/modify", request).await
    }

    async fn partial_close(&self, ticket: u64, volume: f64) -> Result<CommandAck, AppError> {
        self.command("/position/close_partial", CommandRequest::Partial { ticket, volume }).await
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_position_conversion() {
        let wire: WirePosition = serde_json::from_str(
            r#"{ "ticket": 5, "symbol": "EURUSD", "type": 1, "volume": 0.2,
                 "price_open": 1.1, "price_current": 1.09, "profit": 20.0,
                 "sl": 0.0, "tp": 1.08, "time": 1740990000 }"#,
        )
        .unwrap();
        let position = wire.into_position().unwrap();
        assert_eq!(position.side, Side::Sell);
        assert_eq!(position.stop_loss, None);
        assert_eq!(position.take_profit, Some(1.08));
        assert_eq!(position.open_time.timestamp(), 1_740_990_000);
    }

    #[test]
    fn test_unknown_position_type_fails_fetch() {
        let wire: WirePosition = serde_json::from_str(
            r#"{ "ticket": 5, "symbol": "EURUSD", "type": 9, "volume": 0.2,
                 "price_open": 1.1, "price_current": 1.09, "profit": 20.0, "time": 0 }"#,
        )
        .unwrap();
        assert!(matches!(wire.into_position(), Err(AppError::SourceUnavailable(_))));
    }

    #[test]
    fn test_wire_order_conversion() {
        let wire: WireOrder = serde_json::from_str(
            r#"{ "ticket": 8, "symbol": "XAUUSD", "type": 4, "volume_current": 0.5,
                 "price_open": 2050.0, "time_setup": 1740990000, "time_expiration": 1741000000 }"#,
        )
        .unwrap();
        let order = wire.into_order().unwrap().unwrap();
        assert_eq!(order.order_type, OrderType::BuyStop);
        assert_eq!(order.expiration.map(|e| e.timestamp()), Some(1_741_000_000));
    }

    #[test]
    fn test_market_order_skipped() {
        let wire: WireOrder = serde_json::from_str(
            r#"{ "ticket": 8, "symbol": "XAUUSD", "type": 0, "volume_current": 0.5,
                 "price_open": 2050.0, "time_setup": 1740990000 }"#,
        )
        .unwrap();
        assert!(wire.into_order().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mock_mode_accepts_commands() {
        let bridge = Mt5Bridge::new(reqwest::Client::new(), "mock", Duration::from_secs(1), Duration::from_secs(1));
        let ack = bridge.close_position(1).await.unwrap();
        assert_eq!(ack.retcode, RETCODE_DONE);
        assert!(bridge.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_bridge_is_source_unavailable() {
        // port 9 (discard) is closed on test machines
        let bridge = Mt5Bridge::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            Duration::from_millis(500),
            Duration::from_millis(500),
        );
        assert!(matches!(bridge.account().await, Err(AppError::SourceUnavailable(_))));
        assert!(matches!(bridge.close_position(1).await, Err(AppError::CommandFailed(_))));
    }
}
