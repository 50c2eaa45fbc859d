use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use fieldsync_core::Error;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{message}")]
    Conflict {
        message: String,
        stored_version: i64,
        incoming_version: i64,
    },
    /// The record exists under another owner or entity type
    #[error("{0}")]
    Rejected(String),
    #[error("Service unavailable: {message}")]
    Unavailable { message: String, retry_after: Duration },
    #[error("{0}")]
    DeadlineExceeded(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stored_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    incoming_version: Option<i64>,
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        if let Error::Constraint(reason) = err.root() {
            return Self::Rejected(reason.clone());
        }
        match &err {
            Error::InvalidRecord(_) | Error::Serialization(_) => Self::BadRequest(message),
            Error::NotFound(_) => Self::NotFound(message),
            Error::Conflict {
                stored_version,
                incoming_version,
                ..
            } => Self::Conflict {
                message,
                stored_version: *stored_version,
                incoming_version: *incoming_version,
            },
            Error::CircuitOpen { retry_after } => Self::Unavailable {
                message,
                retry_after: *retry_after,
            },
            Error::Connection { .. } => Self::Unavailable {
                message,
                retry_after: Duration::from_secs(1),
            },
            Error::DeadlineExceeded(_) => Self::DeadlineExceeded(message),
            _ => {
                tracing::error!(error = %err, "Request failed");
                Self::Internal(message)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict { .. } | Self::Rejected(_) => StatusCode::CONFLICT,
            Self::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let (stored_version, incoming_version) = match &self {
            Self::Conflict {
                stored_version,
                incoming_version,
                ..
            } => (Some(*stored_version), Some(*incoming_version)),
            _ => (None, None),
        };
        let retry_after = match &self {
            Self::Unavailable { retry_after, .. } => Some(retry_after_secs(*retry_after)),
            _ => None,
        };
        let body = ErrorBody {
            error: self.to_string(),
            stored_version,
            incoming_version,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from(secs));
        }
        response
    }
}

/// Whole seconds, rounded up, never zero
fn retry_after_secs(delay: Duration) -> u64 {
    let secs = delay.as_secs() + u64::from(delay.subsec_nanos() > 0);
    secs.max(1)
}
