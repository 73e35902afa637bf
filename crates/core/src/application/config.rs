// Engine configuration (typed, validated before any job is accepted)

use crate::application::circuit_breaker::CircuitBreakerConfig;
use crate::application::confidence::DEFAULT_SUCCESS_THRESHOLD;
use crate::application::degradation::DegradationConfig;
use crate::application::retry::RetryConfig;
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Workers per batch when the caller does not ask for a number
    pub default_concurrency: usize,
    pub max_concurrency: usize,
    /// Batches running at the same time; further jobs wait PENDING
    pub max_concurrent_jobs: usize,
    pub max_questions_per_batch: usize,
    /// Per external call, retries excluded
    pub call_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 3,
            max_concurrency: 10,
            max_concurrent_jobs: 5,
            max_questions_per_batch: 500,
            call_timeout_ms: 30_000,
        }
    }
}

impl ExecutionConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub success_threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub execution: ExecutionConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub degradation: DegradationConfig,
    pub scoring: ScoringConfig,
}

impl EngineConfig {
    /// Reject out-of-range values and inconsistent combinations
    pub fn validate(&self) -> Result<()> {
        let execution = &self.execution;
        if execution.max_concurrency == 0 {
            return Err(AppError::Config(
                "execution.max_concurrency must be at least 1".to_string(),
            ));
        }
        if execution.default_concurrency == 0
            || execution.default_concurrency > execution.max_concurrency
        {
            return Err(AppError::Config(format!(
                "execution.default_concurrency ({}) must be within 1..={}",
                execution.default_concurrency, execution.max_concurrency
            )));
        }
        if execution.max_concurrent_jobs == 0 {
            return Err(AppError::Config(
                "execution.max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if execution.max_questions_per_batch == 0 {
            return Err(AppError::Config(
                "execution.max_questions_per_batch must be at least 1".to_string(),
            ));
        }
        if execution.call_timeout_ms == 0 {
            return Err(AppError::Config(
                "execution.call_timeout_ms must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.scoring.success_threshold) {
            return Err(AppError::Config(format!(
                "scoring.success_threshold must be within [0, 1], got {}",
                self.scoring.success_threshold
            )));
        }
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.degradation.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.execution.call_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_default_concurrency_must_fit_max() {
        let mut config = EngineConfig::default();
        config.execution.default_concurrency = 20;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_nested_sections_are_validated() {
        let mut config = EngineConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.scoring.success_threshold = 2.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "execution": { "max_concurrent_jobs": 2 },
            "retry": { "jitter": false }
        }))
        .unwrap();
        assert_eq!(config.execution.max_concurrent_jobs, 2);
        assert_eq!(config.execution.max_concurrency, 10);
        assert!(!config.retry.jitter);
        assert_eq!(config.retry.base_delay_ms, 1_000);
    }
}
