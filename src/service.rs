//! The upstream client: one `fetch` entry point wrapping cache, rate limiting,
//! circuit breaking and bounded concurrency around a [`Transport`].
//!
//! Order per call is fixed: validate, cache, rate limit, breaker, network.
//! Cache hits never reach the limiter or the breaker.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::cache::CacheService;
use crate::config::RoadcastConfig;
use crate::endpoint::EndpointClassifier;
use crate::error::{ApiError, BuildError, UpstreamError};
use crate::metrics::{MetricsSink, PrometheusMetrics, TrackedCall};
use crate::resilience::{CircuitBreakerManager, ConcurrencyLimiter, RateLimiter};
use crate::security::{hostname, DefaultUrlValidator, UrlValidator};
use crate::transport::{HttpTransport, Transport, UpstreamRequest, UpstreamResponse};
use crate::types::{FetchOptions, HealthStatus, MaintenanceReport};

/// Resilient client for third-party JSON APIs.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct ApiService {
    config: RoadcastConfig,
    classifier: EndpointClassifier,
    breakers: CircuitBreakerManager,
    cache: CacheService,
    rate_limiter: RateLimiter,
    concurrency: ConcurrencyLimiter,
    validator: Arc<dyn UrlValidator>,
    metrics: Arc<dyn MetricsSink>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for ApiService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiService")
            .field("config", &self.config)
            .field("concurrency", &self.concurrency.stats())
            .finish_non_exhaustive()
    }
}

impl ApiService {
    /// Service with the default validator, Prometheus metrics and HTTP transport.
    pub fn new(config: RoadcastConfig) -> Result<Self, BuildError> {
        Self::builder(config).build()
    }

    pub fn builder(config: RoadcastConfig) -> ApiServiceBuilder {
        ApiServiceBuilder::new(config)
    }

    pub fn config(&self) -> &RoadcastConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheService {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn breakers(&self) -> &CircuitBreakerManager {
        &self.breakers
    }

    pub fn concurrency(&self) -> &ConcurrencyLimiter {
        &self.concurrency
    }

    /// Endpoint category `url` is classified into.
    pub fn category_for(&self, url: &str) -> &str {
        self.classifier.classify(url)
    }

    /// Fetch `url` and return its JSON body.
    ///
    /// Successful responses are cached under `(url, headers)` for
    /// `options.cache_ttl` (or the configured default) and served from the
    /// cache until they expire.
    pub async fn fetch(&self, url: &str, options: FetchOptions) -> Result<Value, ApiError> {
        options.validate()?;
        let verdict = self.validator.validate_url(url);
        if !verdict.is_valid {
            let reason = verdict
                .error
                .unwrap_or_else(|| format!("URL '{url}' was rejected"));
            tracing::debug!(url, reason = %reason, "URL rejected");
            return Err(ApiError::Validation(reason));
        }
        let host = hostname(url)
            .ok_or_else(|| ApiError::Validation(format!("URL '{url}' has no host")))?;

        let category = self.classifier.classify(url).to_string();
        let key = options.cache_key(url);

        if let Some(value) = self.cache.get(&key) {
            tracing::debug!(url, category = %category, "served from cache");
            self.track(TrackedCall {
                endpoint: category,
                method: options.method.to_string(),
                url: url.to_string(),
                status_code: None,
                duration: Duration::ZERO,
                cached: true,
                error: None,
                circuit_state: None,
            });
            return Ok(value);
        }

        let started = Instant::now();
        let result = self.fetch_upstream(url, &host, &category, &options).await;
        let breaker_state = self.breakers.get_or_create(&category).state();

        let call = TrackedCall {
            endpoint: category.clone(),
            method: options.method.to_string(),
            url: url.to_string(),
            status_code: match &result {
                Ok(response) => Some(response.status),
                Err(err) => err.status_code(),
            },
            duration: started.elapsed(),
            cached: false,
            error: result.as_ref().err().map(ToString::to_string),
            circuit_state: Some(breaker_state),
        };
        self.track(call);

        match result {
            Ok(UpstreamResponse { body, .. }) => {
                let ttl = options.cache_ttl.unwrap_or(self.config.cache.default_ttl);
                self.cache.set(key, body.clone(), ttl);
                Ok(body)
            }
            Err(err) => {
                tracing::debug!(
                    url,
                    category = %category,
                    kind = err.kind(),
                    error = %err,
                    "upstream fetch failed"
                );
                Err(err)
            }
        }
    }

    async fn fetch_upstream(
        &self,
        url: &str,
        host: &str,
        category: &str,
        options: &FetchOptions,
    ) -> Result<UpstreamResponse, ApiError> {
        let limits = self.config.rate_limit;
        let decision = self
            .rate_limiter
            .is_allowed(host, limits.max_requests, limits.window);
        if !decision.allowed {
            let reset_at = decision.reset_at.unwrap_or_else(Instant::now);
            return Err(ApiError::RateLimitExceeded {
                identifier: host.to_string(),
                retry_after: reset_at.saturating_duration_since(Instant::now()),
                reset_at,
            });
        }

        let breaker = self.breakers.get_or_create(category);
        let request = UpstreamRequest {
            url: url.to_string(),
            method: options.method.clone(),
            headers: options.headers.clone(),
        };
        let deadline = options.timeout.unwrap_or(self.config.request_timeout);

        let _permit = self.concurrency.admit().await?;
        breaker
            .execute(|| async {
                match tokio::time::timeout(deadline, self.transport.send(&request)).await {
                    Ok(result) => result.map_err(ApiError::from),
                    Err(_) => Err(ApiError::from(UpstreamError::Timeout(deadline))),
                }
            })
            .await
    }

    fn track(&self, call: TrackedCall) {
        if let Err(err) = self.metrics.track_call(&call) {
            tracing::warn!(error = %err, url = %call.url, "metrics sink rejected call event");
        }
    }

    /// Snapshot of every subsystem. Does not change any state.
    pub fn health_status(&self) -> HealthStatus {
        HealthStatus {
            circuit_breakers: self.breakers.statuses(),
            cache: self.cache.stats(),
            concurrency: self.concurrency.stats(),
            rate_limiter: self.rate_limiter.stats(),
        }
    }

    /// Close every breaker, empty the cache, forget rate windows and fail
    /// queued requests with [`ApiError::QueueReset`].
    pub fn reset(&self) {
        self.breakers.reset_all();
        self.cache.clear();
        self.rate_limiter.reset();
        self.concurrency.reset();
        tracing::info!("upstream client state reset");
    }

    /// Drop expired cache entries and idle rate windows.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            expired_cache_entries: self.cache.purge_expired(),
            idle_rate_windows: self.rate_limiter.purge_idle(self.config.rate_limit.window),
        };
        if report != MaintenanceReport::default() {
            tracing::debug!(
                expired_cache_entries = report.expired_cache_entries,
                idle_rate_windows = report.idle_rate_windows,
                "maintenance pass"
            );
        }
        report
    }
}

/// Composition root for [`ApiService`].
pub struct ApiServiceBuilder {
    config: RoadcastConfig,
    validator: Option<Arc<dyn UrlValidator>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    transport: Option<Arc<dyn Transport>>,
}

impl ApiServiceBuilder {
    pub fn new(config: RoadcastConfig) -> Self {
        Self {
            config,
            validator: None,
            metrics: None,
            transport: None,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn UrlValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<ApiService, BuildError> {
        let config = self.config;
        config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new()?),
        };
        let validator = self.validator.unwrap_or_else(|| {
            Arc::new(DefaultUrlValidator::new().with_allowed_hosts(config.allowed_hosts.clone()))
        });
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(PrometheusMetrics));

        let breakers = config.categories.iter().fold(
            CircuitBreakerManager::new(config.circuit_breaker),
            |manager, category| manager.with_category(&category.name, category.circuit_breaker),
        );

        Ok(ApiService {
            classifier: EndpointClassifier::new(&config.categories),
            breakers,
            cache: CacheService::new(config.cache),
            rate_limiter: RateLimiter::new(),
            concurrency: ConcurrencyLimiter::new(config.concurrency),
            validator,
            metrics,
            transport,
            config,
        })
    }
}
