//! Mapping of orchestrator errors onto HTTP responses.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::orchestrator::{QueryError, RunNotFound, StartError};
use crate::runlog::LogError;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }
}

/// Malformed or mistyped request bodies are validation failures.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(kind = self.kind, error = %self.message, "request failed");
        }
        let body = Json(json!({
            "error": {
                "kind": self.kind,
                "message": self.message,
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<StartError> for ApiError {
    fn from(e: StartError) -> Self {
        let (status, kind) = match &e {
            StartError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            StartError::UnknownDevice(_) => (StatusCode::NOT_FOUND, "unknown_device"),
            StartError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
            StartError::Mount(_) => (StatusCode::LOCKED, "mount"),
            StartError::Log(_) => (StatusCode::INTERNAL_SERVER_ERROR, "log"),
        };
        Self::new(status, kind, e.to_string())
    }
}

impl From<RunNotFound> for ApiError {
    fn from(e: RunNotFound) -> Self {
        Self::not_found(e.to_string())
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::UnknownDevice(_) => Self::new(StatusCode::NOT_FOUND, "unknown_device", e.to_string()),
            QueryError::Health(_) => Self::new(StatusCode::BAD_GATEWAY, "health", e.to_string()),
        }
    }
}

impl From<LogError> for ApiError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::InvalidName(_) => Self::new(StatusCode::BAD_REQUEST, "invalid_name", e.to_string()),
            LogError::NotFound(_) => Self::not_found(e.to_string()),
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "log", e.to_string()),
        }
    }
}
