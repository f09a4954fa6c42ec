//! Upstream resilience patterns: circuit breaking, rate limiting and bounded
//! concurrency.
//!
//! These keep a flaky or overloaded provider from taking the dashboard down
//! with it, and keep the dashboard from hammering a provider that is already
//! struggling.

mod circuit_breaker;
mod concurrency;
mod rate_limit;

pub use circuit_breaker::{
    BreakerStatus, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitState,
    StateChange,
};
pub use concurrency::{ConcurrencyConfig, ConcurrencyLimiter, ConcurrencyPermit, ConcurrencyStats};
pub use rate_limit::{RateDecision, RateLimitConfig, RateLimitStats, RateLimiter};
