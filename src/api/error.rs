//! Control API error handling.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Errors surfaced by control API handlers.
///
/// Endpoint-specific failure bodies (unknown message targets, for example)
/// are built in the handlers themselves; this type covers the generic
/// cases. A handler failure must never crash the server.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

/// Structured error body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = self.to_string();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("control API error: {message}");
        }
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

/// Categorize service errors by message, the way the rest of the stack
/// raises them: validation failures become 400s, everything else is a 500.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{err:#}");
        if message.to_lowercase().contains("invalid") {
            ApiError::BadRequest(message)
        } else {
            ApiError::Internal(message)
        }
    }
}
