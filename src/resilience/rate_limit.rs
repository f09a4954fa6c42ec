//! Rate limiting for upstream hosts.
//!
//! Sliding-window admission per identifier (normally the upstream hostname).
//! Each identifier keeps the timestamps of its admitted calls inside the
//! trailing window; the window is pruned lazily on every check.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::types::instant_after;

/// Configuration for rate limiting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum admitted calls per identifier inside one window.
    pub max_requests: u32,
    /// Length of the sliding window in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn with_max_requests(mut self, max: u32) -> Self {
        self.max_requests = max;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Calls still available in the current window after this one.
    pub remaining: u32,
    /// When the oldest call leaves the window. Only set on denial.
    pub reset_at: Option<Instant>,
}

impl RateDecision {
    /// Time left until a denied caller can be admitted again.
    pub fn retry_after(&self) -> Option<Duration> {
        self.reset_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Statistics for the rate limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RateLimitStats {
    pub identifiers: usize,
    pub total_allowed: u64,
    pub total_denied: u64,
}

impl RateLimitStats {
    /// Calculate rejection rate (0.0 to 1.0).
    pub fn rejection_rate(&self) -> f64 {
        let total = self.total_allowed + self.total_denied;
        if total == 0 {
            0.0
        } else {
            self.total_denied as f64 / total as f64
        }
    }
}

/// Sliding-window rate limiter keyed by identifier.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
    total_allowed: AtomicU64,
    total_denied: AtomicU64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one call for `identifier` if fewer than `max` calls happened in
    /// the trailing `window`.
    pub fn is_allowed(&self, identifier: &str, max: u32, window: Duration) -> RateDecision {
        let now = Instant::now();
        let mut entry = self.windows.entry(identifier.to_string()).or_default();
        let timestamps = entry.value_mut();
        prune(timestamps, now, window);

        if timestamps.len() >= max as usize {
            self.total_denied.fetch_add(1, Ordering::Relaxed);
            let reset_at = timestamps
                .front()
                .map(|oldest| instant_after(*oldest, window))
                .unwrap_or_else(|| instant_after(now, window));
            tracing::debug!(identifier, max, in_window = timestamps.len(), "rate limit denied call");
            return RateDecision {
                allowed: false,
                remaining: 0,
                reset_at: Some(reset_at),
            };
        }

        timestamps.push_back(now);
        self.total_allowed.fetch_add(1, Ordering::Relaxed);
        RateDecision {
            allowed: true,
            remaining: max.saturating_sub(timestamps.len() as u32),
            reset_at: None,
        }
    }

    /// Number of timestamps currently stored for `identifier`, without pruning.
    pub fn window_len(&self, identifier: &str) -> usize {
        self.windows
            .get(identifier)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }

    /// Calls admitted for `identifier` that are still inside `window`.
    pub fn usage(&self, identifier: &str, window: Duration) -> usize {
        let now = Instant::now();
        self.windows
            .get(identifier)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|at| now.saturating_duration_since(**at) < window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drop identifiers whose windows are empty once pruned. Returns how many
    /// were removed.
    pub fn purge_idle(&self, window: Duration) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, timestamps| {
            prune(timestamps, now, window);
            !timestamps.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            identifiers: self.windows.len(),
            total_allowed: self.total_allowed.load(Ordering::Relaxed),
            total_denied: self.total_denied.load(Ordering::Relaxed),
        }
    }

    /// Forget every window and counter.
    pub fn reset(&self) {
        self.windows.clear();
        self.total_allowed.store(0, Ordering::Relaxed);
        self.total_denied.store(0, Ordering::Relaxed);
    }
}

fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = timestamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}
