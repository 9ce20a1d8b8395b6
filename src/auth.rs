//! # auth — API Key Middleware
//!
//! Guards the command and level-management surface with an `X-API-Key` header.
//!
//! ## Mode
//! - `API_KEY` ไม่ได้ตั้ง (หรือว่าง) → **Allow All** (dev mode)
//! - `API_KEY` ตั้งไว้ → ทุก request ต้องส่ง `X-API-Key: <key>`
//!
//! ## Exempt
//! `/api/health` ไม่ต้องใช้ key เพื่อให้ health check ของ orchestrator ทำงานได้
//!
//! ## Usage
//! ```bash
//! curl -H "X-API-Key: super-secret-key-here" \
//!      -d '{"ticket": 123456}' -H 'content-type: application/json' \
//!      http://localhost:3000/api/commands/close
//! ```

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use crate::state::SharedState;

const EXEMPT_PATHS: &[&str] = &["/api/health"];

pub async fn require_api_key(
    State(state): State<SharedState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    // ── Dev Mode: no API_KEY → everything passes ─────────────────────────────
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };

    let path = request.uri().path();
    if EXEMPT_PATHS.contains(&path) {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if provided == expected {
        next.run(request).await
    } else {
        warn!(path, "❌ Unauthorized request — invalid or missing X-API-Key");
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "ok":    false,
                "error": "Unauthorized: invalid or missing X-API-Key header",
                "hint":  "Set X-API-Key header with your API key"
            })),
        )
            .into_response()
    }
}
