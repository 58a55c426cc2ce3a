//! API error envelope.
//!
//! Every unsuccessful response carries the same JSON shape:
//!
//! ```json
//! { "status": "fail", "message": "...", "code": "...",
//!   "details": { }, "timestamp": "2026-08-01T12:34:56.789Z" }
//! ```
//!
//! `status` is `"fail"` for client errors (4xx) and `"error"` for server
//! errors (5xx). `code` is a stable machine-readable slug; commit errors
//! reuse the pipeline's own codes (`signature-invalid`, `tip-moved`, ...).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use ledger::mining::{CommitError, PrepareError};
use ledger::store::StoreError;

/// Error type returned by every route handler.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    message: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
    timestamp: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not-found", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status_word = if self.status.is_server_error() {
            "error"
        } else {
            "fail"
        };
        let body = ErrorBody {
            status: status_word,
            message: self.message,
            code: self.code,
            details: self.details,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(what) => Self::conflict(what),
            StoreError::Database(msg) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "database", msg)
            }
            StoreError::Corrupted(msg) => Self::internal(msg),
        }
    }
}

impl From<PrepareError> for ApiError {
    fn from(e: PrepareError) -> Self {
        match e {
            PrepareError::CreatorMissing => {
                Self::new(StatusCode::NOT_FOUND, "creator-missing", e.to_string())
            }
            PrepareError::DataTooLarge { .. } => Self::validation(e.to_string()),
            PrepareError::Store(inner) => inner.into(),
        }
    }
}

impl From<CommitError> for ApiError {
    fn from(e: CommitError) -> Self {
        let message = e.to_string();
        let code = e.code();
        let status = match &e {
            CommitError::CreatorMissing => StatusCode::NOT_FOUND,
            CommitError::SignatureInvalid
            | CommitError::HashMismatch
            | CommitError::PowFailed
            | CommitError::TipMoved
            | CommitError::ShapeInvalid(_)
            | CommitError::InvalidPayload(_)
            | CommitError::Rejected(_) => StatusCode::BAD_REQUEST,
            CommitError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, code, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_errors_map_to_the_documented_statuses() {
        let err: ApiError = CommitError::TipMoved.into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "tip-moved");

        let err: ApiError = CommitError::CreatorMissing.into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err: ApiError = CommitError::Store(StoreError::Database("down".into())).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn conflict_store_errors_are_409() {
        let err: ApiError = StoreError::Conflict("display-name-taken".into()).into();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "conflict");
    }
}
