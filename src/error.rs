// src/error.rs
//
// =============================================================================
// REELFORGE: ERROR TAXONOMY (v 0.1 )
// =============================================================================
//
// A single closed ErrorKind (persisted in job.error_kind and surfaced over
// HTTP) plus an AppError wrapper used at component boundaries. Internal,
// "can't happen but propagate with context if it does" failures stay as
// anyhow::Result and only cross into AppError where the API or reconciler
// need to classify them.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Generator,
    Oom,
    Timeout,
    Lost,
    Cancelled,
    StoreUnavailable,
}

impl ErrorKind {
    /// Whether a job that failed with this kind is eligible for one retry
    /// (§7: "oom (may retry once)").
    pub fn retryable_once(&self) -> bool {
        matches!(self, ErrorKind::Oom)
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation failed: {0:?}")]
    Validation(Vec<String>),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("conflict: job {0} is not in the expected state")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            AppError::Validation(_) => Some(ErrorKind::Validation),
            AppError::StoreUnavailable(_) => Some(ErrorKind::StoreUnavailable),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error_kind: Option<ErrorKind>,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match &self {
            AppError::Validation(errs) => errs.join("; "),
            other => other.to_string(),
        };

        let body = ErrorBody {
            error_kind: self.kind(),
            message,
        };

        (status, Json(body)).into_response()
    }
}
