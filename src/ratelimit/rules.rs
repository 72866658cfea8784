//! Per-endpoint rate limit rules.
//!
//! Rules are keyed by the normalized endpoint identifier. An endpoint without
//! a rule is not limited at all.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{duration_format, format_duration};
use crate::error::{Result, SlidegateError};

/// Default maximum requests per window.
pub const DEFAULT_MAX_REQUESTS: u64 = 100;
/// Default retention horizon.
pub const DEFAULT_TIME_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
/// Default bucket granularity.
pub const DEFAULT_SLIDING_WINDOW_INTERVAL: Duration = Duration::from_secs(60);

/// Limits applied to one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Maximum admitted requests per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
    /// Duration over which `max_requests` applies
    #[serde(default = "default_time_window", with = "duration_format")]
    pub time_window: Duration,
    /// Width of a single counting bucket
    #[serde(default = "default_sliding_window_interval", with = "duration_format")]
    pub sliding_window_interval: Duration,
}

fn default_max_requests() -> u64 {
    DEFAULT_MAX_REQUESTS
}

fn default_time_window() -> Duration {
    DEFAULT_TIME_WINDOW
}

fn default_sliding_window_interval() -> Duration {
    DEFAULT_SLIDING_WINDOW_INTERVAL
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            time_window: DEFAULT_TIME_WINDOW,
            sliding_window_interval: DEFAULT_SLIDING_WINDOW_INTERVAL,
        }
    }
}

impl EndpointConfig {
    pub fn new(max_requests: u64, time_window: Duration, sliding_window_interval: Duration) -> Self {
        Self {
            max_requests,
            time_window,
            sliding_window_interval,
        }
    }

    /// Check the limits for `endpoint`.
    ///
    /// An interval wider than the window is accepted with a warning; each
    /// bucket then simply outlives its own interval by less than it spans.
    pub fn validate(&self, endpoint: &str) -> Result<()> {
        if self.max_requests == 0 {
            return Err(SlidegateError::Config(format!(
                "endpoint '{endpoint}': max_requests must be greater than zero"
            )));
        }
        if self.time_window.is_zero() {
            return Err(SlidegateError::Config(format!(
                "endpoint '{endpoint}': time_window must be greater than zero"
            )));
        }
        if self.sliding_window_interval < Duration::from_millis(1) {
            return Err(SlidegateError::Config(format!(
                "endpoint '{endpoint}': sliding_window_interval must be at least 1ms"
            )));
        }
        if self.sliding_window_interval > self.time_window {
            warn!(
                endpoint = %endpoint,
                time_window = %format_duration(self.time_window),
                sliding_window_interval = %format_duration(self.sliding_window_interval),
                "Sliding window interval exceeds the time window"
            );
        }
        Ok(())
    }
}

/// Mapping from normalized endpoint to its limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,
}

impl RateLimiterConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the limits for `endpoint`.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>, config: EndpointConfig) -> Self {
        self.endpoints.insert(endpoint.into(), config);
        self
    }

    /// The demo rules used when no rules file is configured.
    pub fn demo() -> Self {
        Self::new()
            .with_endpoint("/", EndpointConfig::default())
            .with_endpoint(
                "/ping",
                EndpointConfig::new(5, Duration::from_secs(60), Duration::from_secs(5)),
            )
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateLimiterConfig = serde_yaml::from_str(yaml)
            .map_err(|e| SlidegateError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every endpoint.
    pub fn validate(&self) -> Result<()> {
        for (endpoint, config) in &self.endpoints {
            config.validate(endpoint)?;
        }
        Ok(())
    }

    /// Limits for `endpoint`, or `None` when it is not limited.
    pub fn get(&self, endpoint: &str) -> Option<&EndpointConfig> {
        self.endpoints.get(endpoint)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
