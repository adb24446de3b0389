//! Engine error taxonomy and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::model::ScheduleStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad zone spec, settings patch or config value. Never enters state.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("schedule '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ScheduleStatus,
        to: ScheduleStatus,
    },

    /// Weather provider failure. Downgraded to "no weather data" by callers.
    #[error("external service unavailable: {0}")]
    ExternalUnavailable(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn zone_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "zone",
            id: id.to_string(),
        }
    }

    pub fn schedule_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "schedule",
            id: id.to_string(),
        }
    }

    /// Join a list of violations into a single validation error.
    pub fn from_violations(errors: Vec<String>) -> Self {
        Self::Validation(errors.join("; "))
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ExternalUnavailable(_) => "EXTERNAL_UNAVAILABLE",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::ExternalUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

// ---------------------------------------------------------------------------
// JSON error body
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::debug!(code = self.code(), "request rejected: {self}");
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
