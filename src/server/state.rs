use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Instant;

use super::config::ServerConfig;
use crate::ApiService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<ServerConfig>,

    /// The upstream client every request goes through
    pub service: Arc<ApiService>,

    /// Renders `/metrics`. `None` when metrics are disabled.
    pub prometheus: Option<PrometheusHandle>,

    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        service: Arc<ApiService>,
        prometheus: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            service,
            prometheus,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
