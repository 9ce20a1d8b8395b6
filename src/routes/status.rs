//! # routes::status
//!
//! Health, loop status and the last committed snapshot.

use axum::{extract::State, Json};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;

use crate::state::SharedState;

/// GET /api/health — liveness check, never behind the API key
pub async fn health(State(state): State<SharedState>) -> Json<Value> {
    let status = state.status.read().await;
    Json(json!({
        "ok":      true,
        "status":  "healthy",
        "service": "sentinel",
        "loop":    status.state,
    }))
}

/// GET /api/status — loop health, delivery counters, risk and policy state
pub async fn get_status(State(state): State<SharedState>) -> Json<Value> {
    let status = state.status.read().await.clone();
    let engine = state.engine.lock().await;

    Json(json!({
        "ok":          true,
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
        "loop":        status,
        "delivery":    state.dispatcher.stats(),
        "commands":    state.command_count.load(Ordering::Relaxed),
        "levels":      engine.levels.len(),
        "deferred":    engine.policy.deferred_len(),
        "risk":        engine.risk.status(),
        "baseline_at": engine.differ.previous().map(|s| s.account.timestamp),
    }))
}

/// GET /api/positions — positions and orders as of the last good poll
pub async fn get_positions(State(state): State<SharedState>) -> Json<Value> {
    let engine = state.engine.lock().await;
    match engine.differ.previous() {
        Some(snapshot) => Json(json!({
            "ok":        true,
            "account":   snapshot.account,
            "positions": snapshot.positions,
            "orders":    snapshot.orders,
        })),
        None => Json(json!({
            "ok":        true,
            "account":   null,
            "positions": [],
            "orders":    [],
        })),
    }
}
