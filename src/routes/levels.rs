//! # routes::levels
//!
//! Price-level management.  Edits go through [`LevelStore`] which rewrites
//! the levels file atomically; engine state is persisted afterwards so the
//! new level's trigger state survives a restart.
//!
//! [`LevelStore`]: crate::store::LevelStore

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::SharedState;
use crate::store::levels::parse_level;

/// A level in file format plus its symbol.  `id` may be omitted.
#[derive(Debug, Deserialize)]
pub struct AddLevelBody {
    pub symbol: String,
    #[serde(flatten)]
    pub entry: Map<String, Value>,
}

/// GET /api/levels — every level with its trigger state
pub async fn list_levels(State(state): State<SharedState>) -> Json<Value> {
    let engine = state.engine.lock().await;
    Json(json!({
        "ok":     true,
        "count":  engine.levels.len(),
        "levels": engine.levels.all(),
    }))
}

/// POST /api/levels
pub async fn add_level(
    State(state): State<SharedState>,
    Json(body): Json<AddLevelBody>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let mut entry = body.entry;
    entry
        .entry("id")
        .or_insert_with(|| Value::String(Uuid::new_v4().simple().to_string()[..8].to_string()));
    let level = parse_level(&body.symbol, Value::Object(entry))?;

    let mut engine = state.engine.lock().await;
    engine.levels.add(level.clone())?;
    state.persist(&engine);

    Ok((StatusCode::CREATED, Json(json!({ "ok": true, "level": level }))))
}

/// DELETE /api/levels/:symbol/:id
pub async fn remove_level(
    State(state): State<SharedState>,
    Path((symbol, id)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    let mut engine = state.engine.lock().await;
    let removed = engine.levels.remove(&symbol, &id)?;
    state.persist(&engine);

    Ok(Json(json!({ "ok": true, "removed": removed })))
}

/// POST /api/levels/reload — re-read the file now
pub async fn reload_levels(State(state): State<SharedState>) -> Result<Json<Value>, AppError> {
    let mut engine = state.engine.lock().await;
    let count = engine.levels.reload()?;
    state.persist(&engine);

    Ok(Json(json!({ "ok": true, "count": count })))
}
