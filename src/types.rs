use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::cache::CacheStats;
use crate::error::ApiError;
use crate::resilience::{BreakerStatus, ConcurrencyStats, RateLimitStats};

/// Longest TTL, timeout or window accepted from callers and configuration.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `start + after`, clamped instead of overflowing.
pub(crate) fn instant_after(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .or_else(|| start.checked_add(MAX_DURATION))
        .unwrap_or(start)
}

/// Per-call options for [`ApiService::fetch`](crate::ApiService::fetch).
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOptions {
    pub method: Method,
    /// Header names are stored lowercased.
    pub headers: BTreeMap<String, String>,
    /// Deadline for the network call. Falls back to the service default.
    pub timeout: Option<Duration>,
    /// How long a successful response stays cached. Falls back to the cache default.
    pub cache_ttl: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: BTreeMap::new(),
            timeout: None,
            cache_ttl: None,
        }
    }
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        check_duration("timeout", self.timeout)?;
        check_duration("cache_ttl", self.cache_ttl)?;
        for (name, value) in &self.headers {
            if HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(ApiError::Validation(format!("invalid header name '{name}'")));
            }
            if HeaderValue::from_str(value).is_err() {
                return Err(ApiError::Validation(format!(
                    "invalid value for header '{name}'"
                )));
            }
        }
        Ok(())
    }

    /// Cache key for `url` under these options.
    ///
    /// Headers take part in the key (in sorted order) so responses that vary
    /// by, say, `accept-language` do not collide. The method does not.
    pub fn cache_key(&self, url: &str) -> String {
        let mut key = String::from(url);
        for (name, value) in &self.headers {
            key.push('\n');
            key.push_str(name);
            key.push(':');
            key.push_str(value);
        }
        key
    }
}

fn check_duration(field: &str, value: Option<Duration>) -> Result<(), ApiError> {
    match value {
        Some(d) if d.is_zero() => Err(ApiError::Validation(format!(
            "{field} must be greater than zero"
        ))),
        Some(d) if d > MAX_DURATION => Err(ApiError::Validation(format!(
            "{field} must not exceed {} days",
            MAX_DURATION.as_secs() / 86_400
        ))),
        _ => Ok(()),
    }
}

/// Serializable snapshot returned by
/// [`ApiService::health_status`](crate::ApiService::health_status).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub circuit_breakers: BTreeMap<String, BreakerStatus>,
    pub cache: CacheStats,
    pub concurrency: ConcurrencyStats,
    pub rate_limiter: RateLimitStats,
}

impl HealthStatus {
    /// True while every breaker is closed.
    pub fn is_healthy(&self) -> bool {
        self.circuit_breakers
            .values()
            .all(|status| status.state == crate::resilience::CircuitState::Closed)
    }
}

/// What one maintenance pass cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expired_cache_entries: usize,
    pub idle_rate_windows: usize,
}
