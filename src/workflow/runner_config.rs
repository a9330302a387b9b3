//! Runner configuration
//!
//! Engine settings for local runs, loaded from a YAML file:
//!
//! ```yaml
//! parallel: 8
//!
//! retry:
//!   max_attempts: 3
//!   delay: 500
//!   backoff_multiplier: 2.0
//!   max_delay: 10000
//!
//! env:
//!   SIEM_URL: https://siem.internal
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use super::LoadError;

/// Retry policy applied around action dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_retry_delay")]
    pub delay: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound on any single delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay: u64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay: default_retry_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryConfig {
    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.delay as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum concurrent dispatches
    #[serde(default = "default_parallel")]
    pub parallel: usize,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Bindings for the `ENV` namespace
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_parallel() -> usize {
    4
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            retry: RetryConfig::default(),
            env: BTreeMap::new(),
        }
    }
}

impl RunnerConfig {
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: RunnerConfig = serde_yaml::from_str(&content).map_err(|e| LoadError::Yaml {
            file: path.display().to_string(),
            error: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LoadError> {
        if self.parallel == 0 {
            return Err(LoadError::Config("parallel must be at least 1".to_string()));
        }
        if self.parallel > Semaphore::MAX_PERMITS {
            return Err(LoadError::Config(format!(
                "parallel must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(LoadError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(LoadError::Config(
                "retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunnerConfig::default();
        assert_eq!(config.parallel, 4);
        assert_eq!(config.retry.max_attempts, 1);
        assert!(config.env.is_empty());
    }

    #[test]
    fn test_parse_config() {
        let yaml = r#"
parallel: 8
retry:
  max_attempts: 3
  delay: 10
env:
  REGION: eu
"#;
        let config: RunnerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.parallel, 8);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.delay, 10);
        assert_eq!(config.retry.backoff_multiplier, 2.0);
        assert_eq!(config.env.get("REGION"), Some(&"eu".to_string()));
    }

    #[test]
    fn test_parse_minimal_config() {
        let config: RunnerConfig = serde_yaml::from_str("parallel: 2").unwrap();
        assert_eq!(config.parallel, 2);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_delay_backoff_is_capped() {
        let retry = RetryConfig {
            max_attempts: 5,
            delay: 100,
            backoff_multiplier: 3.0,
            max_delay: 500,
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(300));
        assert_eq!(retry.delay_for(3), Duration::from_millis(500));
    }

    #[test]
    fn test_validate_rejects_zero_parallel() {
        let config = RunnerConfig {
            parallel: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LoadError::Config(_))));
    }
}
