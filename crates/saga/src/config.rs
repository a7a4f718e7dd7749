//! Engine defaults loaded from environment variables.

use std::time::Duration;

use crate::definition::SagaDefinition;
use crate::types::{RetryPolicy, SagaType};

/// Engine-wide defaults applied to definitions that leave them unset.
///
/// Reads from environment variables:
/// - `SAGA_DEFAULT_TIMEOUT_SECS` (default: `3600`)
/// - `SAGA_DEFAULT_STEP_TIMEOUT_SECS` (default: `30`)
/// - `SAGA_DEFAULT_MAX_RETRIES` (default: `3`)
/// - `SAGA_DEFAULT_RETRY_INTERVAL_MS` (default: `30000`)
/// - `SAGA_DEFAULT_BACKOFF_FACTOR` (default: `2.0`)
/// - `SAGA_DEFAULT_MAX_RETRY_INTERVAL_MS` (default: `300000`)
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub default_timeout: Duration,
    pub default_step_timeout: Duration,
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub backoff_factor: f64,
    pub max_retry_interval: Duration,
}

impl EngineConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|value| value.trim().parse().ok())
        }

        let defaults = Self::default();
        Self {
            default_timeout: parsed(&lookup, "SAGA_DEFAULT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_timeout),
            default_step_timeout: parsed(&lookup, "SAGA_DEFAULT_STEP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_step_timeout),
            max_retries: parsed(&lookup, "SAGA_DEFAULT_MAX_RETRIES")
                .unwrap_or(defaults.max_retries),
            retry_interval: parsed(&lookup, "SAGA_DEFAULT_RETRY_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_interval),
            backoff_factor: parsed::<f64>(&lookup, "SAGA_DEFAULT_BACKOFF_FACTOR")
                .filter(|factor| factor.is_finite() && *factor >= 1.0)
                .unwrap_or(defaults.backoff_factor),
            max_retry_interval: parsed(&lookup, "SAGA_DEFAULT_MAX_RETRY_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_retry_interval),
        }
    }

    /// Retry policy built from these defaults, retrying the standard transient codes.
    pub fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            interval: self.retry_interval,
            backoff_factor: self.backoff_factor,
            max_interval: self.max_retry_interval.max(self.retry_interval),
            ..RetryPolicy::default()
        }
    }

    /// Starts an empty definition carrying these defaults.
    pub fn definition(&self, name: impl Into<String>, saga_type: SagaType) -> SagaDefinition {
        SagaDefinition::new(name, saga_type)
            .default_timeout(self.default_timeout)
            .default_step_timeout(self.default_step_timeout)
            .default_retry_policy(self.default_retry_policy())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(3600),
            default_step_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_interval: Duration::from_millis(30_000),
            backoff_factor: 2.0,
            max_retry_interval: Duration::from_millis(300_000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.default_timeout, Duration::from_secs(3600));
        assert_eq!(config.default_step_timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_interval, Duration::from_secs(30));
        assert_eq!(config.backoff_factor, 2.0);
        assert_eq!(config.max_retry_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_empty_environment_uses_defaults() {
        assert_eq!(EngineConfig::from_lookup(lookup(&[])), EngineConfig::default());
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("SAGA_DEFAULT_TIMEOUT_SECS", "120"),
            ("SAGA_DEFAULT_MAX_RETRIES", "5"),
            ("SAGA_DEFAULT_RETRY_INTERVAL_MS", "not-a-number"),
            ("SAGA_DEFAULT_BACKOFF_FACTOR", "0.5"),
        ]));
        assert_eq!(config.default_timeout, Duration::from_secs(120));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_interval, Duration::from_secs(30));
        assert_eq!(config.backoff_factor, 2.0);
    }

    #[test]
    fn test_default_retry_policy() {
        let policy = EngineConfig::default().default_retry_policy();
        assert_eq!(policy, RetryPolicy::default());
    }

    #[test]
    fn test_definition_carries_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[("SAGA_DEFAULT_STEP_TIMEOUT_SECS", "5")]));
        let definition = config.definition("top-up", SagaType::WalletTopUp);
        assert_eq!(definition.default_step_timeout, Duration::from_secs(5));
        assert_eq!(definition.default_timeout, Duration::from_secs(3600));
    }
}
