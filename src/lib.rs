//! Roadcast: a resilient client for flaky weather and traffic APIs.
//!
//! The dashboard talks to a handful of third-party providers that rate-limit
//! hard, go down for maintenance, or just hang. Everything goes through
//! [`ApiService::fetch`], which layers four protections around the network
//! call:
//!
//! - **Cache** - TTL + LRU, keyed by URL and headers. Hits skip everything else.
//! - **Rate limiter** - sliding window per upstream host.
//! - **Circuit breaker** - one per endpoint category (weather, traffic, ...).
//!   Stops hammering a provider that keeps failing, then probes it with a
//!   single trial call once the cooldown is over.
//! - **Request queue** - caps in-flight calls and queues the rest in order.
//!
//! [`ApiService::health_status`] reports all of it without side effects.
//!
//! ## Quick example
//!
//! ```no_run
//! use roadcast::{ApiService, FetchOptions, RoadcastConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = ApiService::new(RoadcastConfig::default())?;
//!
//!     let forecast = service
//!         .fetch(
//!             "https://api.open-meteo.com/v1/forecast?latitude=52.52&longitude=13.41",
//!             FetchOptions::new().with_cache_ttl(Duration::from_secs(600)),
//!         )
//!         .await?;
//!     println!("{forecast}");
//!
//!     let health = service.health_status();
//!     println!("{}", serde_json::to_string_pretty(&health)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `server` (default) - the `roadcast` binary: an axum proxy exposing
//!   `fetch`, health and Prometheus metrics over HTTP.

pub mod cache;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod metrics;
pub mod resilience;
pub mod security;
mod serde_millis;
mod service;
pub mod transport;
mod types;

#[cfg(feature = "server")]
pub mod server;

pub use cache::{CacheConfig, CacheService, CacheStats};
pub use config::{ConfigLoadError, RoadcastConfig};
pub use endpoint::{default_categories, CategoryConfig, EndpointClassifier, DEFAULT_CATEGORY};
pub use error::{ApiError, BuildError, UpstreamError};
pub use metrics::{MetricsSink, NoopMetrics, PrometheusMetrics, TrackedCall};
pub use resilience::{
    BreakerStatus, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitState,
    ConcurrencyConfig, ConcurrencyLimiter, RateLimitConfig, RateLimiter,
};
pub use security::{DefaultUrlValidator, UrlValidator, UrlVerdict};
pub use service::{ApiService, ApiServiceBuilder};
pub use transport::{HttpTransport, Transport, UpstreamRequest, UpstreamResponse};
pub use types::{FetchOptions, HealthStatus, MaintenanceReport, MAX_DURATION};
