use std::env;
use std::time::Duration;

use thiserror::Error;

pub const ENV_BASE_URL: &str = "OPENAGENTS_RUN_MONITOR_BASE_URL";
pub const ENV_API_KEY: &str = "OPENAGENTS_RUN_MONITOR_API_KEY";
pub const ENV_POLL_INTERVAL_MS: &str = "OPENAGENTS_RUN_MONITOR_POLL_INTERVAL_MS";
pub const ENV_TIMEOUT_MS: &str = "OPENAGENTS_RUN_MONITOR_TIMEOUT_MS";
pub const ENV_REQUEST_ATTEMPTS: &str = "OPENAGENTS_RUN_MONITOR_REQUEST_ATTEMPTS";

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_REQUEST_ATTEMPTS: usize = 2;

const MIN_POLL_INTERVAL_MS: u64 = 50;
const MIN_TIMEOUT_MS: u64 = 250;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid OPENAGENTS_RUN_MONITOR_POLL_INTERVAL_MS: {0}")]
    InvalidPollIntervalMs(String),
    #[error("invalid OPENAGENTS_RUN_MONITOR_TIMEOUT_MS: {0}")]
    InvalidTimeoutMs(String),
    #[error("invalid OPENAGENTS_RUN_MONITOR_REQUEST_ATTEMPTS: {0}")]
    InvalidRequestAttempts(String),
}

#[derive(Clone)]
pub struct MonitorConfig {
    pub base_url: String,
    /// Sent as a bearer header, never in a query string.
    pub api_key: Option<String>,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    pub request_attempts: usize,
}

impl MonitorConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let base_url = read(ENV_BASE_URL).unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let api_key = read(ENV_API_KEY);
        let poll_interval_ms = read(ENV_POLL_INTERVAL_MS)
            .map(|raw| raw.parse::<u64>())
            .transpose()
            .map_err(|error| ConfigError::InvalidPollIntervalMs(error.to_string()))?
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        let timeout_ms = read(ENV_TIMEOUT_MS)
            .map(|raw| raw.parse::<u64>())
            .transpose()
            .map_err(|error| ConfigError::InvalidTimeoutMs(error.to_string()))?
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        let request_attempts = read(ENV_REQUEST_ATTEMPTS)
            .map(|raw| raw.parse::<usize>())
            .transpose()
            .map_err(|error| ConfigError::InvalidRequestAttempts(error.to_string()))?
            .unwrap_or(DEFAULT_REQUEST_ATTEMPTS);
        if request_attempts == 0 {
            return Err(ConfigError::InvalidRequestAttempts(
                "must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            base_url,
            api_key,
            poll_interval_ms,
            timeout_ms,
            request_attempts,
        })
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into()).filter(|key| !key.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(MIN_TIMEOUT_MS))
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl std::fmt::Debug for MonitorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("timeout_ms", &self.timeout_ms)
            .field("request_attempts", &self.request_attempts)
            .finish()
    }
}
