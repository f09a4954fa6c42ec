//! HTTP transport used for upstream calls.
//!
//! The service wraps every [`Transport::send`] in its own deadline, so
//! implementations need not enforce timeouts themselves.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::UpstreamError;

/// Longest upstream error body kept in [`UpstreamError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Fully resolved request handed to a [`Transport`].
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    pub url: String,
    pub method: Method,
    /// Lowercased header names.
    pub headers: BTreeMap<String, String>,
}

impl UpstreamRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            headers: BTreeMap::new(),
        }
    }
}

/// Successful upstream answer.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    /// 2xx status code.
    pub status: u16,
    pub body: Value,
}

impl UpstreamResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }
}

/// Performs the network call for a fetch and decodes the JSON body.
///
/// Non-2xx answers must come back as [`UpstreamError::Status`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>;
}

/// [`Transport`] backed by a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(32)
            .user_agent(concat!("roadcast/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .header(reqwest::header::ACCEPT, "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            let message = if body.is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                body
            };
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;
        Ok(UpstreamResponse {
            status: status.as_u16(),
            body,
        })
    }
}
