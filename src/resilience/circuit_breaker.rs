//! Circuit breaker pattern for upstream resilience.
//!
//! One breaker guards each endpoint category (weather, traffic, ...). After
//! `failure_threshold` consecutive failures the breaker opens and callers fail
//! fast without touching the network. Once `reset_timeout` has passed, the next
//! call is let through as a single trial: success closes the breaker, failure
//! reopens it with a fresh deadline.
//!
//! The OPEN -> HALF_OPEN transition is lazy. Nothing runs in the background;
//! the check happens when [`CircuitBreaker::execute`] is called.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ApiError;
use crate::types::instant_after;

/// Entries kept in the per-breaker state change log.
const STATE_LOG_CAPACITY: usize = 50;

/// States of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests allowed.
    Closed,
    /// Failing fast - requests immediately rejected.
    Open,
    /// Testing if the upstream recovered - one trial request allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(label)
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed, in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

/// One entry of the state change log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Point-in-time snapshot of a breaker, as reported by health checks and
/// carried by [`ApiError::CircuitOpen`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStatus {
    pub category: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_response_ms: f64,
    pub uptime_percentage: f64,
    pub last_failure_ms_ago: Option<u64>,
    pub next_attempt_in_ms: Option<u64>,
    pub state_changes: Vec<StateChange>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    // Some(..) exactly while Open.
    next_attempt_at: Option<Instant>,
    trial_in_flight: bool,
    // Bumped by `reset`; calls admitted under an older generation are ignored.
    generation: u64,
    total: u64,
    successful: u64,
    failed: u64,
    avg_response_ms: f64,
    state_changes: VecDeque<StateChange>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            next_attempt_at: None,
            trial_in_flight: false,
            generation: 0,
            total: 0,
            successful: 0,
            failed: 0,
            avg_response_ms: 0.0,
            state_changes: VecDeque::new(),
        }
    }
}

/// Circuit breaker for a single endpoint category.
#[derive(Debug)]
pub struct CircuitBreaker {
    category: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(category: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            category: category.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `operation` under the breaker.
    ///
    /// While the circuit is open and its cooldown has not elapsed this returns
    /// [`ApiError::CircuitOpen`] without calling `operation`. Otherwise the
    /// operation runs; its outcome is recorded and the original result is
    /// returned unchanged.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let admission = self.admit()?;

        let started = Instant::now();
        let result = operation().await;
        if admission.is_current() {
            match &result {
                Ok(_) => self.on_success(started.elapsed()),
                Err(err) => self.on_failure(err),
            }
        } else {
            tracing::debug!(category = %self.category, "breaker was reset during call, outcome not recorded");
        }
        result
    }

    /// Decide whether a call may proceed.
    fn admit(&self) -> Result<Admission<'_>, ApiError> {
        let mut inner = self.lock();
        let now = Instant::now();
        let state = inner.state;
        let generation = inner.generation;

        match state {
            CircuitState::Closed => Ok(Admission {
                breaker: self,
                generation,
                trial: false,
            }),
            CircuitState::Open => {
                if let Some(next_attempt_at) = inner.next_attempt_at {
                    if now < next_attempt_at {
                        return Err(self.open_error(&inner, now));
                    }
                }
                self.transition(&mut inner, CircuitState::HalfOpen, "reset timeout elapsed");
                inner.trial_in_flight = true;
                Ok(Admission {
                    breaker: self,
                    generation,
                    trial: true,
                })
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(self.open_error(&inner, now));
                }
                inner.trial_in_flight = true;
                Ok(Admission {
                    breaker: self,
                    generation,
                    trial: true,
                })
            }
        }
    }

    fn open_error(&self, inner: &BreakerInner, now: Instant) -> ApiError {
        tracing::debug!(category = %self.category, state = %inner.state, "circuit breaker rejected call");
        ApiError::CircuitOpen {
            category: self.category.clone(),
            status: Box::new(self.snapshot(inner, now)),
        }
    }

    /// Record a successful call that took `response_time`.
    pub fn on_success(&self, response_time: Duration) {
        let mut inner = self.lock();
        inner.total += 1;
        inner.successful += 1;

        let elapsed_ms = response_time.as_secs_f64() * 1000.0;
        inner.avg_response_ms += (elapsed_ms - inner.avg_response_ms) / inner.successful as f64;

        let state = inner.state;
        match state {
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Closed, "trial call succeeded");
            }
            CircuitState::Closed => {
                // Only consecutive failures count towards the threshold.
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn on_failure(&self, error: &ApiError) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.total += 1;
        inner.failed += 1;
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(now);

        tracing::debug!(
            category = %self.category,
            failures = inner.failure_count,
            error = %error,
            "upstream call failed"
        );

        let state = inner.state;
        match state {
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                self.transition(&mut inner, CircuitState::Open, "failure threshold reached");
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open, "trial call failed");
            }
            _ => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, reason: &str) {
        let from = inner.state;
        inner.state = to;

        match to {
            CircuitState::Open => {
                let failed_at = inner.last_failure_at.unwrap_or_else(Instant::now);
                inner.next_attempt_at = Some(instant_after(failed_at, self.config.reset_timeout));
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.next_attempt_at = None;
            }
            CircuitState::HalfOpen => {
                inner.next_attempt_at = None;
            }
        }

        if inner.state_changes.len() == STATE_LOG_CAPACITY {
            inner.state_changes.pop_front();
        }
        inner.state_changes.push_back(StateChange {
            from,
            to,
            at: Utc::now(),
            reason: reason.to_string(),
        });

        match to {
            CircuitState::Open => tracing::warn!(
                category = %self.category,
                %from,
                failures = inner.failure_count,
                retry_in_ms = self.config.reset_timeout.as_millis() as u64,
                reason,
                "circuit breaker opened"
            ),
            _ => tracing::info!(category = %self.category, %from, %to, reason, "circuit breaker state change"),
        }
    }

    /// Restore the breaker to a fresh closed state.
    ///
    /// Calls still in flight finish normally but their outcomes are not
    /// recorded.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let generation = inner.generation.wrapping_add(1);
        *inner = BreakerInner::new();
        inner.generation = generation;
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.lock().last_failure_at
    }

    pub fn next_attempt_at(&self) -> Option<Instant> {
        self.lock().next_attempt_at
    }

    /// Current status snapshot. Never changes breaker state.
    pub fn status(&self) -> BreakerStatus {
        let inner = self.lock();
        self.snapshot(&inner, Instant::now())
    }

    fn snapshot(&self, inner: &BreakerInner, now: Instant) -> BreakerStatus {
        let uptime_percentage = if inner.total == 0 {
            100.0
        } else {
            inner.successful as f64 / inner.total as f64 * 100.0
        };

        BreakerStatus {
            category: self.category.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            reset_timeout_ms: self.config.reset_timeout.as_millis() as u64,
            total_requests: inner.total,
            successful_requests: inner.successful,
            failed_requests: inner.failed,
            avg_response_ms: inner.avg_response_ms,
            uptime_percentage,
            last_failure_ms_ago: inner
                .last_failure_at
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            next_attempt_in_ms: inner
                .next_attempt_at
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
            state_changes: inner.state_changes.iter().cloned().collect(),
        }
    }
}

/// A call let through by [`CircuitBreaker::admit`].
///
/// Dropping the half-open trial marks it settled, including when the caller
/// abandons the trial future midway. Admissions from before a reset leave
/// the current state alone.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
}

impl Admission<'_> {
    fn is_current(&self) -> bool {
        self.breaker.lock().generation == self.generation
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.trial {
            return;
        }
        let mut inner = self.breaker.lock();
        if inner.generation == self.generation {
            inner.trial_in_flight = false;
        }
    }
}

/// Manager for the per-category breakers.
#[derive(Debug)]
pub struct CircuitBreakerManager {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
}

impl CircuitBreakerManager {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            default_config,
            overrides: HashMap::new(),
        }
    }

    /// Use `config` for `category` instead of the default, and register the
    /// breaker eagerly so it shows up in health reports before first use.
    pub fn with_category(mut self, category: &str, config: Option<CircuitBreakerConfig>) -> Self {
        let config = config.unwrap_or(self.default_config);
        self.overrides.insert(category.to_string(), config);
        self.breakers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                category.to_string(),
                Arc::new(CircuitBreaker::new(category, config)),
            );
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get or create the breaker for a category.
    pub fn get_or_create(&self, category: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock();
        breakers
            .entry(category.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(category)
                    .copied()
                    .unwrap_or(self.default_config);
                Arc::new(CircuitBreaker::new(category, config))
            })
            .clone()
    }

    /// Status of every known breaker, keyed by category.
    pub fn statuses(&self) -> BTreeMap<String, BreakerStatus> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        breakers
            .into_iter()
            .map(|cb| (cb.category().to_string(), cb.status()))
            .collect()
    }

    /// Reset every breaker back to closed. Breakers stay registered.
    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        for cb in breakers {
            cb.reset();
        }
    }

    /// A category is healthy unless its breaker has left the closed state.
    pub fn is_healthy(&self, category: &str) -> bool {
        self.lock()
            .get(category)
            .map(|cb| cb.state() == CircuitState::Closed)
            .unwrap_or(true)
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
