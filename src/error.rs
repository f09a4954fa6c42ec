use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::resilience::BreakerStatus;

/// Failures reaching (or trying to reach) an upstream endpoint.
///
/// These are the only errors that count against a circuit breaker.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UpstreamError {
    /// The endpoint answered with a non-2xx status.
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    /// Connection, DNS or TLS failure before a response arrived.
    #[error("network error: {0}")]
    Network(String),
    /// The request was aborted because it exceeded its deadline.
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    /// The body could not be decoded as JSON.
    #[error("invalid JSON response: {0}")]
    Decode(String),
}

impl UpstreamError {
    /// HTTP status carried by the failure, if the endpoint produced one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            UpstreamError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors surfaced by [`ApiService::fetch`](crate::ApiService::fetch).
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or disallowed URL / request options. Nothing else was touched.
    #[error("invalid request: {0}")]
    Validation(String),
    /// Admission denied by the sliding-window limiter.
    #[error("rate limit exceeded for '{identifier}', retry in {}ms", .retry_after.as_millis())]
    RateLimitExceeded {
        identifier: String,
        retry_after: Duration,
        reset_at: Instant,
    },
    /// The category's breaker is open and its cooldown has not elapsed.
    #[error("circuit breaker is open for '{category}'")]
    CircuitOpen {
        category: String,
        status: Box<BreakerStatus>,
    },
    /// The upstream call itself failed.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    /// The request was still queued when the service was reset.
    #[error("request queue was reset before the request could run")]
    QueueReset,
}

impl ApiError {
    /// Short machine-readable label, used for metrics and JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation",
            ApiError::RateLimitExceeded { .. } => "rate_limited",
            ApiError::CircuitOpen { .. } => "circuit_open",
            ApiError::Upstream(UpstreamError::Timeout(_)) => "timeout",
            ApiError::Upstream(_) => "upstream",
            ApiError::QueueReset => "queue_reset",
        }
    }

    /// How long a caller should back off before trying again, when known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            ApiError::CircuitOpen { status, .. } => {
                status.next_attempt_in_ms.map(Duration::from_millis)
            }
            _ => None,
        }
    }

    /// Whether repeating the same call later could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Validation(_) => false,
            ApiError::RateLimitExceeded { .. }
            | ApiError::CircuitOpen { .. }
            | ApiError::QueueReset => true,
            ApiError::Upstream(UpstreamError::Status { status, .. }) => {
                *status == 429 || *status >= 500
            }
            ApiError::Upstream(UpstreamError::Decode(_)) => false,
            ApiError::Upstream(_) => true,
        }
    }

    /// Upstream HTTP status, if the failure carried one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApiError::Upstream(err) => err.status_code(),
            _ => None,
        }
    }
}

/// Failure to assemble an [`ApiService`](crate::ApiService).
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigLoadError),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
