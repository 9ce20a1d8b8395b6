//! # routes::commands
//!
//! Trade commands forwarded to the terminal.
//!
//! | Method | Path                      | Body                                   |
//! |--------|---------------------------|----------------------------------------|
//! | POST   | `/api/commands/close`     | `{ "ticket": 123 }`                    |
//! | POST   | `/api/commands/modify`    | `{ "ticket": 123, "sl": 1.09, "tp": null }` |
//! | POST   | `/api/commands/partial`   | `{ "ticket": 123, "volume": 0.05 }`    |
//!
//! Each handler holds the engine lock for the whole command, so it never
//! interleaves with a poll cycle.  A close marks the ticket as requested; the
//! next cycle still reports the disappearance as an ordinary close.
//! Every outcome is also announced as a `CommandResult` alert.

use std::future::Future;

use axum::{extract::State, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::EngineState;
use crate::error::AppError;
use crate::models::{Event, EventBody, Position};
use crate::source::CommandAck;
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct CloseBody {
    pub ticket: u64,
}

#[derive(Debug, Deserialize)]
pub struct ModifyBody {
    pub ticket: u64,
    #[serde(default)]
    pub sl: Option<f64>,
    #[serde(default)]
    pub tp: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBody {
    pub ticket: u64,
    pub volume: f64,
}

/// POST /api/commands/close
pub async fn close_position(
    State(state): State<SharedState>,
    Json(body): Json<CloseBody>,
) -> Result<Json<Value>, AppError> {
    let mut engine = state.engine.lock().await;
    known_position(&engine, body.ticket)?;

    let result = run_command(&state, state.source.close_position(body.ticket)).await;
    if result.is_ok() {
        engine.requested_closes.insert(body.ticket);
    }
    finish(&state, &mut engine, format!("close #{}", body.ticket), result).await
}

/// POST /api/commands/modify
pub async fn modify_position(
    State(state): State<SharedState>,
    Json(body): Json<ModifyBody>,
) -> Result<Json<Value>, AppError> {
    if body.sl.is_none() && body.tp.is_none() {
        return Err(AppError::BadRequest("nothing to modify: give sl and/or tp".into()));
    }
    for value in [body.sl, body.tp].into_iter().flatten() {
        if !value.is_finite() || value < 0.0 {
            return Err(AppError::BadRequest(format!("invalid price {value}")));
        }
    }

    let mut engine = state.engine.lock().await;
    known_position(&engine, body.ticket)?;

    let result = run_command(&state, state.source.modify_position(body.ticket, body.sl, body.tp)).await;
    let command = format!("modify #{} sl={} tp={}", body.ticket, show(body.sl), show(body.tp));
    finish(&state, &mut engine, command, result).await
}

/// POST /api/commands/partial
pub async fn partial_close(
    State(state): State<SharedState>,
    Json(body): Json<PartialBody>,
) -> Result<Json<Value>, AppError> {
    if !body.volume.is_finite() || body.volume <= 0.0 {
        return Err(AppError::BadRequest("volume must be positive".into()));
    }

    let mut engine = state.engine.lock().await;
    if let Some(position) = known_position(&engine, body.ticket)? {
        if body.volume >= position.volume {
            return Err(AppError::BadRequest(format!(
                "volume {} must be below the position's {} (use close instead)",
                body.volume, position.volume
            )));
        }
    }

    let result = run_command(&state, state.source.partial_close(body.ticket, body.volume)).await;
    finish(&state, &mut engine, format!("partial #{} {} lots", body.ticket, body.volume), result).await
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

/// The ticket's last observed position.  Without a baseline nothing can be
/// checked and the terminal gets to decide.
fn known_position(engine: &EngineState, ticket: u64) -> Result<Option<Position>, AppError> {
    match engine.differ.previous() {
        None => Ok(None),
        Some(snapshot) => snapshot
            .position(ticket)
            .cloned()
            .map(Some)
            .ok_or_else(|| AppError::NotFound(format!("no open position #{ticket}"))),
    }
}

async fn run_command(
    state: &SharedState,
    command: impl Future<Output = Result<CommandAck, AppError>>,
) -> Result<CommandAck, AppError> {
    tokio::time::timeout(state.command_timeout, command)
        .await
        .map_err(|_| {
            AppError::CommandFailed(format!("no answer from terminal within {}s", state.command_timeout.as_secs_f64()))
        })?
}

/// Announce the outcome, persist, and turn it into the HTTP response.
async fn finish(
    state: &SharedState,
    engine: &mut EngineState,
    command: String,
    result: Result<CommandAck, AppError>,
) -> Result<Json<Value>, AppError> {
    let request_id = Uuid::new_v4();
    let seq = state.next_command();

    let (ok, message) = match &result {
        Ok(ack) => {
            info!(%request_id, seq, command = %command, retcode = ack.retcode, "✅ Command accepted");
            (true, format!("Accepted (retcode {}) {}", ack.retcode, ack.comment).trim_end().to_string())
        }
        Err(e) => {
            warn!(%request_id, seq, command = %command, error = %e, "❌ Command failed");
            (false, e.to_string())
        }
    };

    let now = Utc::now();
    let event = Event::new(now, EventBody::CommandResult { request_id, command: command.clone(), ok, message });
    let deliver: Vec<Event> = engine
        .decide(vec![event], now)
        .into_iter()
        .filter(|d| d.is_deliver())
        .map(|d| d.event)
        .collect();
    state.dispatcher.dispatch(&deliver).await;
    state.persist(engine);

    let ack = result?;
    Ok(Json(json!({
        "ok":         true,
        "request_id": request_id,
        "command":    command,
        "ack":        ack,
    })))
}

fn show(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

// ─── Tests ────────────────────────────────────────────────────────────────────
