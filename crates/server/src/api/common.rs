// Common DTOs and error mapping for the HTTP API

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::Json;
use leaseflow_durable::CoordinatorError;
use serde::{Deserialize, Serialize};

/// Kind of failure reported in [`ErrorResponse`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    General,
    /// Input rejected by the workflow; `path` names the offending field
    Validate,
}

/// Standard error response for API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong.
    pub msg: String,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            kind: ErrorKind::General,
            path: None,
        }
    }

    pub fn validate(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            kind: ErrorKind::Validate,
            path: Some(path.into()),
        }
    }

    /// Convert to axum response tuple
    pub fn into_response(self, status: StatusCode) -> ApiError {
        (status, Json(self))
    }
}

/// Status code of a coordinator failure
pub fn status_of(err: &CoordinatorError) -> StatusCode {
    match err {
        CoordinatorError::Interpreter { source, .. } if source.is_retryable() => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        CoordinatorError::Interpreter { .. } => StatusCode::BAD_REQUEST,
        CoordinatorError::UnknownWorkflowType(_) | CoordinatorError::NotFound(_) => {
            StatusCode::NOT_FOUND
        }
        CoordinatorError::AlreadyExists(_) => StatusCode::CONFLICT,
        CoordinatorError::SignatureInvalid => StatusCode::FORBIDDEN,
        CoordinatorError::LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
        CoordinatorError::Persistence(_) | CoordinatorError::InvalidState { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<CoordinatorError> for ErrorResponse {
    fn from(err: CoordinatorError) -> Self {
        match err.validation() {
            Some((path, message)) => Self::validate(path, message),
            None => Self::new(err.to_string()),
        }
    }
}

/// Map a coordinator failure to its response, logging server-side faults
pub fn coordinator_error(err: CoordinatorError) -> ApiError {
    let status = status_of(&err);
    if status.is_server_error() {
        tracing::error!(error = %err, status = status.as_u16(), "request failed");
    } else {
        tracing::debug!(error = %err, status = status.as_u16(), "request rejected");
    }
    ErrorResponse::from(err).into_response(status)
}

/// Malformed JSON bodies are always the caller's fault
pub fn body_error(rejection: JsonRejection) -> ApiError {
    ErrorResponse::new(rejection.body_text()).into_response(StatusCode::BAD_REQUEST)
}
