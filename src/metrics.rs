//! Per-call metric events.
//!
//! The service reports every fetch, cached or not, to a [`MetricsSink`].
//! Sink failures are logged and dropped; they never fail a fetch.

use serde::Serialize;
use std::time::Duration;

use crate::resilience::CircuitState;

/// One completed (or rejected) upstream call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedCall {
    /// Endpoint category the URL was classified into.
    pub endpoint: String,
    pub method: String,
    pub url: String,
    pub status_code: Option<u16>,
    #[serde(with = "crate::serde_millis")]
    pub duration: Duration,
    pub cached: bool,
    pub error: Option<String>,
    pub circuit_state: Option<CircuitState>,
}

impl TrackedCall {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Destination for call metrics.
pub trait MetricsSink: Send + Sync {
    fn track_call(&self, call: &TrackedCall) -> anyhow::Result<()>;
}

/// Records calls through the `metrics` facade.
///
/// Nothing is exported unless a recorder is installed; the server installs a
/// Prometheus one.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetrics;

pub const CALLS_TOTAL: &str = "roadcast_upstream_calls_total";
pub const CALL_DURATION_SECONDS: &str = "roadcast_upstream_call_duration_seconds";

impl MetricsSink for PrometheusMetrics {
    fn track_call(&self, call: &TrackedCall) -> anyhow::Result<()> {
        let outcome = match (&call.error, call.cached) {
            (Some(_), _) => "error",
            (None, true) => "cached",
            (None, false) => "success",
        };
        metrics::counter!(
            CALLS_TOTAL,
            "endpoint" => call.endpoint.clone(),
            "method" => call.method.clone(),
            "outcome" => outcome
        )
        .increment(1);

        if !call.cached {
            metrics::histogram!(
                CALL_DURATION_SECONDS,
                "endpoint" => call.endpoint.clone()
            )
            .record(call.duration.as_secs_f64());
        }
        Ok(())
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn track_call(&self, _call: &TrackedCall) -> anyhow::Result<()> {
        Ok(())
    }
}
