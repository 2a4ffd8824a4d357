//! Process-wide orchestrator settings.
//!
//! These are deployment knobs shared by every run in the process, read from
//! `EVALFORGE_*` environment variables.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Settings validation failed: {0}")]
    ValidationFailed(String),
}

/// Settings for provider access, rate limiting and event delivery.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Base URL of the OpenAI-compatible chat endpoint.
    pub provider_base_url: String,
    pub api_key: Option<String>,
    /// Burst size of each per-provider token bucket.
    pub rate_limit_capacity: u32,
    /// Tokens added per second to each bucket.
    pub rate_limit_refill_per_sec: f64,
    /// Events buffered per run before a slow subscriber lags.
    pub event_buffer: usize,
    pub connect_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            provider_base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            rate_limit_capacity: 10,
            rate_limit_refill_per_sec: 2.0,
            event_buffer: 256,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl OrchestratorSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates settings from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `EVALFORGE_BASE_URL`: provider base URL (default: OpenAI)
    /// - `EVALFORGE_API_KEY`: provider API key, falls back to `OPENAI_API_KEY`
    /// - `EVALFORGE_RATE_LIMIT_CAPACITY`: bucket size per provider (default: 10)
    /// - `EVALFORGE_RATE_LIMIT_REFILL`: tokens per second (default: 2.0)
    /// - `EVALFORGE_EVENT_BUFFER`: per-run event buffer (default: 256)
    /// - `EVALFORGE_CONNECT_TIMEOUT_SECS`: HTTP connect timeout (default: 10)
    ///
    /// # Errors
    ///
    /// Returns `SettingsError` if a variable cannot be parsed or the result
    /// fails validation.
    pub fn from_env() -> Result<Self, SettingsError> {
        let mut settings = Self::default();

        if let Ok(val) = std::env::var("EVALFORGE_BASE_URL") {
            settings.provider_base_url = val;
        }

        settings.api_key = std::env::var("EVALFORGE_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok()
            .filter(|k| !k.is_empty());

        if let Ok(val) = std::env::var("EVALFORGE_RATE_LIMIT_CAPACITY") {
            settings.rate_limit_capacity = parse_env_value(&val, "EVALFORGE_RATE_LIMIT_CAPACITY")?;
        }

        if let Ok(val) = std::env::var("EVALFORGE_RATE_LIMIT_REFILL") {
            settings.rate_limit_refill_per_sec =
                parse_env_value(&val, "EVALFORGE_RATE_LIMIT_REFILL")?;
        }

        if let Ok(val) = std::env::var("EVALFORGE_EVENT_BUFFER") {
            settings.event_buffer = parse_env_value(&val, "EVALFORGE_EVENT_BUFFER")?;
        }

        if let Ok(val) = std::env::var("EVALFORGE_CONNECT_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "EVALFORGE_CONNECT_TIMEOUT_SECS")?;
            settings.connect_timeout = Duration::from_secs(secs);
        }

        settings.validate()?;
        Ok(settings)
    }

    /// # Errors
    ///
    /// Returns `SettingsError::ValidationFailed` naming the first bad value.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.provider_base_url.is_empty() {
            return Err(SettingsError::ValidationFailed(
                "provider_base_url cannot be empty".to_string(),
            ));
        }

        if self.rate_limit_capacity == 0 {
            return Err(SettingsError::ValidationFailed(
                "rate_limit_capacity must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit_refill_per_sec <= 0.0 || !self.rate_limit_refill_per_sec.is_finite() {
            return Err(SettingsError::ValidationFailed(
                "rate_limit_refill_per_sec must be a positive number".to_string(),
            ));
        }

        if self.event_buffer == 0 {
            return Err(SettingsError::ValidationFailed(
                "event_buffer must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_provider_base_url(mut self, url: impl Into<String>) -> Self {
        self.provider_base_url = url.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_rate_limit(mut self, capacity: u32, refill_per_sec: f64) -> Self {
        self.rate_limit_capacity = capacity;
        self.rate_limit_refill_per_sec = refill_per_sec;
        self
    }

    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size;
        self
    }
}

fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, SettingsError> {
    value.parse().map_err(|_| SettingsError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = OrchestratorSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.rate_limit_capacity, 10);
        assert_eq!(settings.event_buffer, 256);
    }

    #[test]
    fn test_builder() {
        let settings = OrchestratorSettings::new()
            .with_provider_base_url("http://localhost:8080/v1")
            .with_api_key("sk-test")
            .with_rate_limit(5, 0.5)
            .with_event_buffer(16);
        assert_eq!(settings.provider_base_url, "http://localhost:8080/v1");
        assert_eq!(settings.api_key.as_deref(), Some("sk-test"));
        assert_eq!(settings.rate_limit_capacity, 5);
        assert_eq!(settings.event_buffer, 16);
    }

    #[test]
    fn test_validation_failures() {
        let err = OrchestratorSettings::new()
            .with_rate_limit(0, 1.0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("rate_limit_capacity"));

        let err = OrchestratorSettings::new()
            .with_rate_limit(1, 0.0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("rate_limit_refill_per_sec"));

        let err = OrchestratorSettings::new()
            .with_event_buffer(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("event_buffer"));
    }

    #[test]
    fn test_parse_env_value_error() {
        let err = parse_env_value::<u32>("ten", "EVALFORGE_EVENT_BUFFER").unwrap_err();
        assert!(err.to_string().contains("EVALFORGE_EVENT_BUFFER"));
        assert!(err.to_string().contains("ten"));
    }
}
