//! YAML configuration for the upstream client.
//!
//! Every section is optional; anything left out takes its default. Durations
//! are written in milliseconds.
//!
//! ## Example YAML Configuration
//!
//! ```yaml
//! version: "1.0"
//! request_timeout: 8000
//!
//! circuit_breaker:
//!   failure_threshold: 5
//!   reset_timeout: 60000
//!
//! categories:
//!   - name: weather
//!     patterns: ["open-meteo.com", "api.weather.gov"]
//!   - name: traffic
//!     patterns: ["tomtom.com"]
//!     circuit_breaker:
//!       failure_threshold: 3
//!       reset_timeout: 30000
//!
//! cache:
//!   max_size: 200
//!   default_ttl: 300000
//!
//! rate_limit:
//!   max_requests: 60
//!   window: 60000
//!
//! concurrency:
//!   max_concurrent: 6
//!
//! allowed_hosts: ["open-meteo.com", "api.weather.gov", "tomtom.com"]
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheConfig;
use crate::endpoint::{default_categories, CategoryConfig, DEFAULT_CATEGORY};
use crate::resilience::{CircuitBreakerConfig, ConcurrencyConfig, RateLimitConfig};
use crate::types::MAX_DURATION;

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported config version: {0}")]
    UnsupportedVersion(String),
}

/// Top-level configuration for [`ApiService`](crate::ApiService).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoadcastConfig {
    /// Configuration format version.
    pub version: String,

    /// Breaker settings for categories without their own override.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Endpoint categories, matched in order.
    pub categories: Vec<CategoryConfig>,

    pub cache: CacheConfig,

    pub rate_limit: RateLimitConfig,

    pub concurrency: ConcurrencyConfig,

    /// Network deadline for calls that do not set their own.
    #[serde(with = "crate::serde_millis")]
    pub request_timeout: Duration,

    /// Hosts (and their subdomains) that may be fetched. Empty allows any
    /// public host; internal addresses must always be listed here.
    pub allowed_hosts: Vec<String>,
}

impl Default for RoadcastConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            circuit_breaker: CircuitBreakerConfig::default(),
            categories: default_categories(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            request_timeout: Duration::from_secs(10),
            allowed_hosts: Vec::new(),
        }
    }
}

impl RoadcastConfig {
    /// Load a YAML configuration file from the given path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse YAML configuration from a string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigLoadError> {
        let config: RoadcastConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        match self.version.as_str() {
            "1.0" | "1" => {}
            v => return Err(ConfigLoadError::UnsupportedVersion(v.to_string())),
        }

        validate_breaker("circuit_breaker", &self.circuit_breaker)?;

        let mut seen = HashSet::new();
        for category in &self.categories {
            if category.name.trim().is_empty() {
                return Err(ConfigLoadError::Validation(
                    "categories[].name must not be empty".to_string(),
                ));
            }
            if category.name == DEFAULT_CATEGORY {
                return Err(ConfigLoadError::Validation(format!(
                    "category name '{DEFAULT_CATEGORY}' is reserved"
                )));
            }
            if !seen.insert(category.name.as_str()) {
                return Err(ConfigLoadError::Validation(format!(
                    "duplicate category '{}'",
                    category.name
                )));
            }
            if let Some(cb) = &category.circuit_breaker {
                validate_breaker(&format!("categories.{}.circuit_breaker", category.name), cb)?;
            }
        }

        if self.cache.max_size == 0 {
            return Err(ConfigLoadError::Validation(
                "cache.max_size must be >= 1".to_string(),
            ));
        }
        validate_duration("cache.default_ttl", self.cache.default_ttl)?;
        if self.rate_limit.max_requests == 0 {
            return Err(ConfigLoadError::Validation(
                "rate_limit.max_requests must be >= 1".to_string(),
            ));
        }
        validate_duration("rate_limit.window", self.rate_limit.window)?;
        if self.concurrency.max_concurrent == 0 {
            return Err(ConfigLoadError::Validation(
                "concurrency.max_concurrent must be >= 1".to_string(),
            ));
        }
        validate_duration("request_timeout", self.request_timeout)?;
        Ok(())
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn with_categories(mut self, categories: Vec<CategoryConfig>) -> Self {
        self.categories = categories;
        self
    }

    pub fn with_cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    pub fn with_concurrency(mut self, config: ConcurrencyConfig) -> Self {
        self.concurrency = config;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_allowed_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }
}

fn validate_breaker(field: &str, config: &CircuitBreakerConfig) -> Result<(), ConfigLoadError> {
    if config.failure_threshold == 0 {
        return Err(ConfigLoadError::Validation(format!(
            "{field}.failure_threshold must be >= 1"
        )));
    }
    validate_duration(&format!("{field}.reset_timeout"), config.reset_timeout)
}

fn validate_duration(field: &str, value: Duration) -> Result<(), ConfigLoadError> {
    if value.is_zero() {
        return Err(ConfigLoadError::Validation(format!("{field} must be > 0")));
    }
    if value > MAX_DURATION {
        return Err(ConfigLoadError::Validation(format!(
            "{field} must be <= {} ms",
            MAX_DURATION.as_millis()
        )));
    }
    Ok(())
}
