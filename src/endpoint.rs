//! Static classification of upstream URLs into endpoint categories.
//!
//! Each category owns one circuit breaker, so a failing traffic provider
//! cannot trip the breaker that guards weather calls.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::resilience::CircuitBreakerConfig;

/// Category for URLs that match no configured pattern.
pub const DEFAULT_CATEGORY: &str = "default";

/// One endpoint category and the URL substrings that select it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryConfig {
    pub name: String,
    /// Case-insensitive substrings matched against the full URL.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Breaker settings for this category. Falls back to the service default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl CategoryConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            patterns: Vec::new(),
            circuit_breaker: None,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }
}

/// Built-in weather and traffic categories.
///
/// Traffic providers are less forgiving, so their breaker opens after three
/// failures and cools down for thirty seconds.
pub fn default_categories() -> Vec<CategoryConfig> {
    vec![
        CategoryConfig::new("weather")
            .with_pattern("weather")
            .with_pattern("openweathermap.org")
            .with_pattern("open-meteo.com")
            .with_pattern("api.weather.gov"),
        CategoryConfig::new("traffic")
            .with_pattern("traffic")
            .with_pattern("tomtom.com")
            .with_pattern("here.com")
            .with_circuit_breaker(
                CircuitBreakerConfig::default()
                    .with_failure_threshold(3)
                    .with_reset_timeout(Duration::from_secs(30)),
            ),
    ]
}

/// Maps a URL to the first category with a matching pattern.
#[derive(Debug, Clone)]
pub struct EndpointClassifier {
    categories: Vec<(String, Vec<String>)>,
}

impl EndpointClassifier {
    pub fn new(categories: &[CategoryConfig]) -> Self {
        let categories = categories
            .iter()
            .map(|category| {
                let patterns = category
                    .patterns
                    .iter()
                    .filter(|p| !p.is_empty())
                    .map(|p| p.to_ascii_lowercase())
                    .collect();
                (category.name.clone(), patterns)
            })
            .collect();
        Self { categories }
    }

    pub fn classify(&self, url: &str) -> &str {
        let url = url.to_ascii_lowercase();
        self.categories
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|p| url.contains(p.as_str())))
            .map(|(name, _)| name.as_str())
            .unwrap_or(DEFAULT_CATEGORY)
    }

    /// Names of every configured category, in match order.
    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(|(name, _)| name.as_str())
    }
}

impl Default for EndpointClassifier {
    fn default() -> Self {
        Self::new(&default_categories())
    }
}
