use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, UpstreamError};

pub type ServerResult<T> = Result<T, ServerError>;

/// Server error types
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Metrics are disabled")]
    MetricsDisabled,

    #[error("Not found")]
    NotFound,
}

/// API error response structure
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ServerError {
    /// Get HTTP status code for this error
    fn status_code(&self) -> StatusCode {
        match self {
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound | ServerError::MetricsDisabled => StatusCode::NOT_FOUND,
            ServerError::Api(err) => match err {
                ApiError::Validation(_) => StatusCode::BAD_REQUEST,
                ApiError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                ApiError::CircuitOpen { .. } | ApiError::QueueReset => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                ApiError::Upstream(UpstreamError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
                ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            },
        }
    }

    /// Get error code string
    fn error_code(&self) -> &'static str {
        match self {
            ServerError::BadRequest(_) => "BAD_REQUEST",
            ServerError::MetricsDisabled => "METRICS_DISABLED",
            ServerError::NotFound => "NOT_FOUND",
            ServerError::Api(err) => match err {
                ApiError::Validation(_) => "VALIDATION_ERROR",
                ApiError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
                ApiError::CircuitOpen { .. } => "CIRCUIT_OPEN",
                ApiError::QueueReset => "QUEUE_RESET",
                ApiError::Upstream(UpstreamError::Timeout(_)) => "UPSTREAM_TIMEOUT",
                ApiError::Upstream(_) => "UPSTREAM_ERROR",
            },
        }
    }

    fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            ServerError::Api(err) => err.retry_after(),
            _ => None,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = self.retry_after();
        let body = Json(ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.to_string(),
                retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
            },
        });

        let mut response = (status, body).into_response();
        if let Some(retry_after) = retry_after {
            // Whole seconds, rounded up so clients never retry early.
            let secs = retry_after.as_millis().div_ceil(1000);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
