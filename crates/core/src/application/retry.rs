// Retry logic - bounded exponential backoff around a single external call
use crate::error::{AppError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    /// Scale each delay by a uniform factor in (0, 1]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.exponential_base.is_finite() || self.exponential_base < 1.0 {
            return Err(AppError::Config(format!(
                "retry.exponential_base must be >= 1.0, got {}",
                self.exponential_base
            )));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(AppError::Config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the call after the given delay
    Retry(Duration),
    /// Do not retry, surface the error
    GiveUp,
}

/// Result of a retried call together with the attempts it took
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

/// Retry policy
///
/// Stateless; one instance is shared by every caller of a dependency.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a new retry policy
    ///
    /// # Example
    /// ```text
    /// let policy = RetryPolicy::new(RetryConfig::default())?;
    /// let reply = policy.retry_with_backoff("send", || client.send(&handle, text)).await?;
    /// ```
    pub fn new(config: RetryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Single attempt, never retries
    pub fn no_retry() -> Self {
        Self {
            config: RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            },
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries + 1
    }

    /// Delay after failed attempt `attempt` (0-based), before jitter
    ///
    /// delay = min(base_delay * exponential_base ^ attempt, max_delay)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let max = self.config.max_delay_ms as f64;
        let raw = self.config.base_delay_ms as f64
            * self.config.exponential_base.powi(attempt.min(i32::MAX as u32) as i32);
        Duration::from_millis(raw.min(max) as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.config.jitter {
            return delay;
        }
        // gen::<f64>() is in [0, 1), so the factor is in (0, 1]
        let factor = 1.0 - rand::thread_rng().gen::<f64>();
        delay.mul_f64(factor)
    }

    /// Determine whether failed attempt `attempt` (0-based) should be retried
    pub fn decide(&self, error: &AppError, attempt: u32) -> RetryDecision {
        if !error.is_retryable() || attempt >= self.config.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.jittered(self.backoff(attempt)))
    }

    /// Run `operation` until it succeeds, fails terminally or the budget is spent
    pub async fn retry_with_backoff<F, Fut, T>(&self, operation: &'static str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute(operation, op).await.result
    }

    /// Same as `retry_with_backoff`, also reporting how many attempts were made
    pub async fn execute<F, Fut, T>(&self, operation: &'static str, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let error = match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(operation, attempts = attempt + 1, "Call succeeded after retry");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt + 1,
                    };
                }
                Err(e) => e,
            };

            match self.decide(&error, attempt) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after transient failure"
                    );
                    metrics::counter!("retry_attempts_total", "operation" => operation)
                        .increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => {
                    if error.is_retryable() {
                        warn!(
                            operation,
                            attempts = attempt + 1,
                            error = %error,
                            "Retry budget exhausted"
                        );
                    }
                    return RetryOutcome {
                        result: Err(error),
                        attempts: attempt + 1,
                    };
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy(max_retries: u32, base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            base_delay_ms: base_ms,
            max_delay_ms: max_ms,
            exponential_base: 2.0,
            jitter: false,
        })
        .unwrap()
    }

    #[test]
    fn test_backoff_formula() {
        let policy = policy(10, 1_000, 60_000);
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(5), Duration::from_secs(32));
        assert_eq!(policy.backoff(6), Duration::from_secs(60));
        assert_eq!(policy.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            exponential_base: 2.0,
            jitter: true,
        })
        .unwrap();
        let error = AppError::TransientExternal("503".into());
        for _ in 0..200 {
            match policy.decide(&error, 1) {
                RetryDecision::Retry(delay) => {
                    assert!(delay <= Duration::from_secs(2));
                }
                RetryDecision::GiveUp => panic!("expected a retry"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_max_retries_plus_one_attempts() {
        let policy = policy(3, 100, 1_000);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let outcome = policy
            .execute("send", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AppError::TransientExternal(format!(
                    "503 on call {}",
                    counter.load(Ordering::SeqCst)
                )))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.attempts, 4);
        // The last failure is the one surfaced
        match outcome.result {
            Err(AppError::TransientExternal(msg)) => assert_eq!(msg, "503 on call 4"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_errors_are_not_retried() {
        let policy = policy(3, 100, 1_000);
        let terminal = [
            AppError::Validation("bad question".into()),
            AppError::PermanentExternal("404".into()),
            AppError::CircuitOpen {
                service: "workspace_service".into(),
                retry_after: Duration::from_secs(30),
            },
        ];

        for error in terminal {
            let kind = error.kind();
            let mut pending = Some(error);
            let calls = AtomicU32::new(0);
            let counter = &calls;
            let outcome = policy
                .execute("send", || {
                    let error = pending.take();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        match error {
                            Some(e) => Err::<(), _>(e),
                            None => Ok(()),
                        }
                    }
                })
                .await;
            assert_eq!(calls.load(Ordering::SeqCst), 1, "{} was retried", kind);
            assert_eq!(outcome.attempts, 1);
            assert!(outcome.result.is_err());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_follow_exponential_schedule() {
        let policy = policy(3, 1_000, 60_000);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let started = Instant::now();

        let value = policy
            .retry_with_backoff("send", move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= 2 {
                    Err(AppError::Timeout(format!("attempt {}", n)))
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        // 1s before attempt 2, 2s before attempt 3
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());
        let shrinking = RetryConfig {
            exponential_base: 0.5,
            ..RetryConfig::default()
        };
        assert!(RetryPolicy::new(shrinking).is_err());
        let inverted = RetryConfig {
            base_delay_ms: 10_000,
            max_delay_ms: 1_000,
            ..RetryConfig::default()
        };
        assert!(matches!(inverted.validate(), Err(AppError::Config(_))));
    }
}
