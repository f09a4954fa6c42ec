//! HTTP front for the upstream client.
//!
//! The dashboard calls this instead of the providers directly, so every
//! browser tab shares one cache, one set of breakers and one rate budget.
//!
//! ```rust,no_run
//! use roadcast::server::{self, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::load()?;
//!     server::start_server(config).await?;
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod middleware;
mod routes;
mod state;

pub use config::ServerConfig;
pub use error::{ErrorDetail, ErrorResponse, ServerError, ServerResult};
pub use state::AppState;

use axum::http::StatusCode;
use axum::middleware::from_fn;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::{ApiService, RoadcastConfig};

/// Build the Axum router with all routes and middleware
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = if state.config.enable_cors {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(routes::health_check))
        .route("/metrics", get(routes::metrics))
        .route("/api/v1/health", get(routes::upstream_health))
        .route("/api/v1/fetch", get(routes::fetch))
        .route("/api/v1/reset", post(routes::reset))
        .fallback(routes::not_found)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            state.config.timeout(),
        ))
        .layer(cors)
        .layer(from_fn(middleware::log_requests))
        .layer(from_fn(middleware::request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the roadcast HTTP server
///
/// Installs JSON logging and the Prometheus recorder, builds the upstream
/// client from `core_config_path` (or defaults), and serves until SIGTERM or
/// Ctrl+C.
pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(config.log_level.as_str())
        .with_target(false)
        .with_thread_ids(true)
        .json()
        .init();

    let core = match &config.core_config_path {
        Some(path) => RoadcastConfig::from_file(path)?,
        None => RoadcastConfig::default(),
    };
    let service = Arc::new(ApiService::new(core)?);

    let prometheus = if config.metrics_enabled {
        Some(PrometheusBuilder::new().install_recorder()?)
    } else {
        None
    };

    let maintenance = config.maintenance_interval().map(|period| {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                service.run_maintenance();
            }
        })
    });

    let addr: SocketAddr = config.socket_addr()?;
    tracing::info!(
        %addr,
        timeout_secs = config.timeout_secs,
        cors = config.enable_cors,
        metrics = config.metrics_enabled,
        "starting roadcast server"
    );

    let state = Arc::new(AppState::new(config, service, prometheus));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(task) = maintenance {
        task.abort();
    }
    tracing::info!("server shutdown complete");
    Ok(())
}

/// Shutdown signal handler
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
