//! HTTP handlers.
//!
//! - `GET /health` - liveness
//! - `GET /api/v1/health` - breaker, cache, queue and rate-limit snapshot
//! - `GET /api/v1/fetch?url=..&ttl_ms=..&timeout_ms=..` - proxy through the client
//! - `POST /api/v1/reset` - reset all client state
//! - `GET /metrics` - Prometheus text exposition

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::error::{ServerError, ServerResult};
use super::state::AppState;
use crate::{FetchOptions, HealthStatus};

/// Health check endpoint (liveness)
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "roadcast",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
    }))
}

pub async fn upstream_health(State(state): State<Arc<AppState>>) -> Json<HealthStatus> {
    Json(state.service.health_status())
}

#[derive(Debug, Deserialize)]
pub struct FetchQuery {
    pub url: String,
    /// Cache TTL for this response, in milliseconds.
    pub ttl_ms: Option<u64>,
    /// Network deadline, in milliseconds.
    pub timeout_ms: Option<u64>,
}

pub async fn fetch(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FetchQuery>,
) -> ServerResult<Json<Value>> {
    if query.url.trim().is_empty() {
        return Err(ServerError::BadRequest("query parameter 'url' is required".into()));
    }

    let mut options = FetchOptions::new();
    if let Some(ttl) = query.ttl_ms {
        options = options.with_cache_ttl(Duration::from_millis(ttl));
    }
    if let Some(timeout) = query.timeout_ms {
        options = options.with_timeout(Duration::from_millis(timeout));
    }

    let value = state.service.fetch(&query.url, options).await?;
    Ok(Json(value))
}

pub async fn reset(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.service.reset();
    Json(json!({ "status": "reset" }))
}

/// Prometheus metrics endpoint
pub async fn metrics(State(state): State<Arc<AppState>>) -> ServerResult<impl IntoResponse> {
    let handle = state
        .prometheus
        .as_ref()
        .ok_or(ServerError::MetricsDisabled)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    ))
}

/// 404 Not Found handler
pub async fn not_found() -> ServerError {
    ServerError::NotFound
}
