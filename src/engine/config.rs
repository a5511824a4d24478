//! Engine configuration.
//!
//! Values come from defaults, `FORGE_*` environment variables, or the
//! builder methods, and are checked by [`EngineConfig::validate`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::llm::ModelParams;
use crate::review::DEFAULT_MAX_RETRIES;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the orchestration engine and its worker.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Upper bound on a single stage operation before the task is marked
    /// as errored.
    pub stage_timeout: Duration,
    /// Retries allowed per stage per peer-review run.
    pub max_retries: u32,
    /// Tasks at this depth or deeper are not decomposed further.
    pub max_decomposition_depth: u32,
    /// Root of the task store and feedback logs.
    pub data_dir: PathBuf,

    // Completion settings
    /// Model identifier; empty uses the completion service default.
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            stage_timeout: Duration::from_secs(300),
            max_retries: DEFAULT_MAX_RETRIES,
            max_decomposition_depth: 2,
            data_dir: PathBuf::from("./forge-data"),
            model: String::new(),
            temperature: 0.2,
            max_tokens: 4000,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FORGE_POLL_INTERVAL_MS`: worker poll interval (default: 500)
    /// - `FORGE_STAGE_TIMEOUT_SECS`: per-stage timeout (default: 300)
    /// - `FORGE_MAX_RETRIES`: retries per stage per run (default: 2)
    /// - `FORGE_MAX_DECOMPOSITION_DEPTH`: decomposition depth limit (default: 2)
    /// - `FORGE_DATA_DIR`: data directory (default: ./forge-data)
    /// - `FORGE_MODEL`: model identifier (default: service default)
    /// - `FORGE_TEMPERATURE`: sampling temperature (default: 0.2)
    /// - `FORGE_MAX_TOKENS`: completion token limit (default: 4000)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the resulting
    /// configuration is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("FORGE_POLL_INTERVAL_MS") {
            let millis: u64 = parse_env_value(&val, "FORGE_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(millis);
        }

        if let Ok(val) = std::env::var("FORGE_STAGE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "FORGE_STAGE_TIMEOUT_SECS")?;
            config.stage_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("FORGE_MAX_RETRIES") {
            config.max_retries = parse_env_value(&val, "FORGE_MAX_RETRIES")?;
        }

        if let Ok(val) = std::env::var("FORGE_MAX_DECOMPOSITION_DEPTH") {
            config.max_decomposition_depth =
                parse_env_value(&val, "FORGE_MAX_DECOMPOSITION_DEPTH")?;
        }

        if let Ok(val) = std::env::var("FORGE_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("FORGE_MODEL") {
            config.model = val;
        }

        if let Ok(val) = std::env::var("FORGE_TEMPERATURE") {
            config.temperature = parse_env_value(&val, "FORGE_TEMPERATURE")?;
        }

        if let Ok(val) = std::env::var("FORGE_MAX_TOKENS") {
            config.max_tokens = parse_env_value(&val, "FORGE_MAX_TOKENS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.stage_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "stage_timeout must be greater than 0".to_string(),
            ));
        }

        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "data_dir cannot be empty".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationFailed(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        if self.max_tokens == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_tokens must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Completion parameters shared by every stage agent.
    pub fn model_params(&self) -> ModelParams {
        ModelParams::default()
            .with_model(self.model.clone())
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn feedback_dir(&self) -> PathBuf {
        self.data_dir.join("feedback")
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_decomposition_depth(mut self, depth: u32) -> Self {
        self.max_decomposition_depth = depth;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.max_decomposition_depth, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_poll_interval(Duration::from_millis(50))
            .with_stage_timeout(Duration::from_secs(10))
            .with_max_retries(4)
            .with_data_dir("/tmp/forge")
            .with_model("gpt-4o")
            .with_temperature(0.7);

        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.feedback_dir(), PathBuf::from("/tmp/forge/feedback"));

        let params = config.model_params();
        assert_eq!(params.model, "gpt-4o");
        assert!((params.temperature - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn test_validation_zero_poll_interval() {
        let result = EngineConfig::default()
            .with_poll_interval(Duration::ZERO)
            .validate();
        assert!(result.unwrap_err().to_string().contains("poll_interval"));
    }

    #[test]
    fn test_validation_invalid_temperature() {
        let result = EngineConfig::default().with_temperature(3.0).validate();
        assert!(result.unwrap_err().to_string().contains("temperature"));
    }

    #[test]
    fn test_validation_zero_max_tokens() {
        let result = EngineConfig::default().with_max_tokens(0).validate();
        assert!(result.unwrap_err().to_string().contains("max_tokens"));
    }

    #[test]
    fn test_parse_env_value_error() {
        let err = parse_env_value::<u64>("abc", "FORGE_MAX_TOKENS").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert_eq!(parse_env_value::<u32>(" 3 ", "FORGE_MAX_RETRIES").unwrap(), 3);
    }
}
