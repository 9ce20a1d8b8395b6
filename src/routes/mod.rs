//! # routes
//!
//! HTTP surface: trade commands, price-level management and status.
//!
//! | Method | Path                          | Handler                       |
//! |--------|-------------------------------|-------------------------------|
//! | GET    | `/api/health`                 | [`status::health`] (no auth)  |
//! | GET    | `/api/status`                 | [`status::get_status`]        |
//! | GET    | `/api/positions`              | [`status::get_positions`]     |
//! | POST   | `/api/commands/close`         | [`commands::close_position`]  |
//! | POST   | `/api/commands/modify`        | [`commands::modify_position`] |
//! | POST   | `/api/commands/partial`       | [`commands::partial_close`]   |
//! | GET    | `/api/levels`                 | [`levels::list_levels`]       |
//! | POST   | `/api/levels`                 | [`levels::add_level`]         |
//! | DELETE | `/api/levels/:symbol/:id`     | [`levels::remove_level`]      |
//! | POST   | `/api/levels/reload`          | [`levels::reload_levels`]     |

pub mod commands;
pub mod levels;
pub mod status;

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::auth::require_api_key;
use crate::state::SharedState;

/// All routes plus the API-key middleware, bound to `state`.
pub fn router(state: SharedState) -> Router {
    Router::new()
        // ── Status ───────────────────────────────────────────────────────────
        .route("/api/health",             get(status::health))
        .route("/api/status",             get(status::get_status))
        .route("/api/positions",          get(status::get_positions))
        // ── Commands ─────────────────────────────────────────────────────────
        .route("/api/commands/close",     post(commands::close_position))
        .route("/api/commands/modify",    post(commands::modify_position))
        .route("/api/commands/partial",   post(commands::partial_close))
        // ── Levels ───────────────────────────────────────────────────────────
        .route("/api/levels",             get(levels::list_levels).post(levels::add_level))
        .route("/api/levels/reload",      post(levels::reload_levels))
        .route("/api/levels/:symbol/:id", delete(levels::remove_level))
        .layer(axum::middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}
