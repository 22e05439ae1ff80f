//! File-based engine configuration.
//!
//! JSON with millisecond durations, every field optional:
//!
//! ```json
//! {
//!   "retry": { "max_attempts": 3, "initial_backoff_ms": 100, "backoff_multiplier": 2.0 },
//!   "activity_timeout_ms": 30000,
//!   "activity_timeouts_ms": { "StoreMetadata": 5000 },
//!   "logging": { "format": "json", "level": "debug" }
//! }
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::logging::LoggingConfig;
use crate::runtime::retry::{BackoffStrategy, RetryPolicy};
use crate::runtime::RuntimeOptions;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryConfig,
    pub activity_timeout_ms: u64,
    pub activity_timeouts_ms: HashMap<String, u64>,
    pub timeout_is_transient: bool,
    pub worker_concurrency: usize,
    pub report_retry_delay_ms: u64,
    pub logging: Option<LoggingConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            activity_timeout_ms: 30_000,
            activity_timeouts_ms: HashMap::new(),
            timeout_is_transient: true,
            worker_concurrency: 8,
            report_retry_delay_ms: 50,
            logging: None,
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn into_runtime_options(self) -> Result<RuntimeOptions, ConfigError> {
        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.backoff_multiplier must be at least 1".into()));
        }
        if self.activity_timeout_ms == 0 {
            return Err(ConfigError::Invalid("activity_timeout_ms must be positive".into()));
        }
        let backoff = if retry.initial_backoff_ms == 0 {
            BackoffStrategy::None
        } else {
            BackoffStrategy::Exponential {
                base: Duration::from_millis(retry.initial_backoff_ms),
                multiplier: retry.backoff_multiplier,
                max: Duration::from_millis(retry.max_backoff_ms.max(retry.initial_backoff_ms)),
            }
        };
        Ok(RuntimeOptions {
            retry: RetryPolicy::new(retry.max_attempts).with_backoff(backoff),
            default_activity_timeout: Duration::from_millis(self.activity_timeout_ms),
            activity_timeouts: self
                .activity_timeouts_ms
                .into_iter()
                .map(|(name, ms)| (name, Duration::from_millis(ms)))
                .collect(),
            timeout_is_transient: self.timeout_is_transient,
            worker_concurrency: self.worker_concurrency.max(1),
            report_retry_delay: Duration::from_millis(self.report_retry_delay_ms),
            logging: self.logging,
            ..RuntimeOptions::default()
        })
    }
}
