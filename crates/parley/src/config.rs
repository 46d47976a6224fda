//! Engine configuration.

use parley_core::{FlowError, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine-wide defaults. Dialogue steps may override the timeout, the
/// retry cap and the context policy.
///
/// # Examples
///
/// ```
/// use parley::EngineConfig;
///
/// let config = EngineConfig::from_toml_str(
///     r#"
///     generation_timeout_ms = 5000
///     max_retries = 2
///     "#,
/// )?;
/// assert_eq!(config.max_retries, 2);
/// assert_eq!(config.context_window, 10);
/// # Ok::<(), parley::FlowError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Deadline of a single generation attempt.
    pub generation_timeout_ms: u64,
    /// Retries after a transient generation failure.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: u32,
    /// Default N of the `recent` context policy.
    pub context_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            generation_timeout_ms: 30_000,
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2,
            context_window: 10,
        }
    }
}

impl EngineConfig {
    /// Parses and validates a TOML document. Missing keys keep defaults.
    ///
    /// # Errors
    ///
    /// [`FlowError::Configuration`] on malformed TOML or invalid values.
    pub fn from_toml_str(source: &str) -> Result<Self, FlowError> {
        let config: Self =
            toml::from_str(source).map_err(|e| FlowError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FlowError> {
        if self.generation_timeout_ms == 0 {
            return Err(FlowError::Configuration(
                "generation_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.context_window == 0 {
            return Err(FlowError::Configuration(
                "context_window must be greater than 0".into(),
            ));
        }
        self.retry_policy().map(|_| ())
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }

    /// The exponential backoff policy described by this configuration.
    pub fn retry_policy(&self) -> Result<RetryPolicy, FlowError> {
        let policy = RetryPolicy::exponential_capped(
            self.max_retries,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.backoff_multiplier,
        )
        .map_err(|e| FlowError::Configuration(e.to_string()))?;
        Ok(policy.with_max_retries(self.max_retries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.generation_timeout(), Duration::from_secs(30));
        let policy = config.retry_policy().unwrap();
        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.backoff(1), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_from_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            generation_timeout_ms = 250
            max_retries = 0
            context_window = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.generation_timeout(), Duration::from_millis(250));
        assert_eq!(config.retry_policy().unwrap(), RetryPolicy::None);
        assert_eq!(config.context_window, 4);
        assert_eq!(config.backoff_multiplier, 2);
    }

    #[test]
    fn test_invalid_values() {
        let err = EngineConfig::from_toml_str("backoff_multiplier = 0").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid engine configuration: backoff multiplier must be at least 1"
        );
        assert!(EngineConfig::from_toml_str("generation_timeout_ms = 0").is_err());
        assert!(EngineConfig::from_toml_str("max_backoff_ms = 10").is_err());
        assert!(EngineConfig::from_toml_str("unknown_key = 1").is_err());
        assert!(EngineConfig::from_toml_str("max_retries = \"three\"").is_err());
    }
}
