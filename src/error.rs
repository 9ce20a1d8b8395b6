//! # error
//!
//! Centralised application error type.
//!
//! The first five variants are the engine's failure taxonomy; each one has a
//! fixed recovery rule applied by its caller:
//!
//! | Variant             | Recovery                                              |
//! |---------------------|-------------------------------------------------------|
//! | `SourceUnavailable` | scheduler backs off and retries, no events produced   |
//! | `ConfigInvalid`     | that level entry is skipped, the rest still load      |
//! | `DeliveryFailed`    | bounded retries, then dropped with an error log       |
//! | `StateCorrupt`      | fall back to "all levels armed, no history"           |
//! | `CommandFailed`     | reported back to the requester, never swallowed       |
//!
//! Route handlers return `Result<_, AppError>`; the `IntoResponse` impl turns
//! every variant into a `{ "ok": false, "error": ... }` JSON body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Snapshot or price fetch from the terminal bridge failed or timed out.
    #[error("Snapshot source unavailable: {0}")]
    SourceUnavailable(String),

    /// A single price-level entry is malformed.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A notification channel did not accept the message.
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    /// Persisted trigger/dedup state could not be read back.
    #[error("Persisted state corrupt: {0}")]
    StateCorrupt(String),

    /// A close/modify/partial command was rejected or never reached MT5.
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// The request payload was syntactically correct but semantically invalid.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The requested resource (ticket, level) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Catch-all for unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::BadRequest(_) | AppError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::SourceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::CommandFailed(_) | AppError::DeliveryFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::StateCorrupt(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "ok":    false,
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}
