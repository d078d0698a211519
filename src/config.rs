//! Client configuration

use crate::error::{ApiError, Result};
use std::time::Duration;

/// Base URL used when nothing else is configured
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Configuration for the API client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server root; endpoint paths are appended verbatim
    pub base_url: String,

    /// Timeout for one JSON request attempt (send + body read)
    /// Default: 15 seconds
    pub request_timeout: Duration,

    /// Timeout for multipart photo uploads
    /// Default: 20 seconds
    pub upload_timeout: Duration,

    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(15),
            upload_timeout: Duration::from_secs(20),
            user_agent: concat!("chronos-client/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::default().with_base_url(base_url)
    }

    /// Build from `CHRONOS_API_URL`, `CHRONOS_REQUEST_TIMEOUT_SECS` and
    /// `CHRONOS_UPLOAD_TIMEOUT_SECS`, falling back to the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("CHRONOS_API_URL") {
            config = config.with_base_url(url);
        }
        if let Some(secs) = env_secs("CHRONOS_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = secs;
        }
        if let Some(secs) = env_secs("CHRONOS_UPLOAD_TIMEOUT_SECS")? {
            config.upload_timeout = secs;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ApiError::Configuration(format!(
                "base URL must start with http:// or https://, got {:?}",
                self.base_url
            )));
        }
        if self.request_timeout.is_zero() || self.upload_timeout.is_zero() {
            return Err(ApiError::Configuration("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn env_secs(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|e| ApiError::Configuration(format!("{name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
