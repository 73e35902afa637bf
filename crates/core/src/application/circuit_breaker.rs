// Circuit Breaker - per-dependency failure gate

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker name for the LLM workspace service
pub const WORKSPACE_SERVICE: &str = "workspace_service";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected without reaching the dependency
    Open,
    /// Probing whether the dependency recovered
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in CLOSED before opening
    pub failure_threshold: u32,
    /// Time spent OPEN before a probe is allowed
    pub open_timeout_ms: u64,
    /// Consecutive successes in HALF_OPEN before closing
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_ms: 60_000,
            half_open_success_threshold: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Opens quickly, for dependencies where failing fast matters most
    pub fn sensitive() -> Self {
        Self {
            failure_threshold: 3,
            open_timeout_ms: 30_000,
            half_open_success_threshold: 2,
        }
    }

    /// Tolerates bursts of failures before opening
    pub fn resilient() -> Self {
        Self {
            failure_threshold: 10,
            open_timeout_ms: 120_000,
            half_open_success_threshold: 5,
        }
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(AppError::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.half_open_success_threshold == 0 {
            return Err(AppError::Config(
                "circuit_breaker.half_open_success_threshold must be at least 1".to_string(),
            ));
        }
        if self.open_timeout_ms == 0 {
            return Err(AppError::Config(
                "circuit_breaker.open_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of a breaker for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub transition_count: u64,
    /// Remaining OPEN time, if currently open
    pub retry_after_ms: Option<u64>,
    pub config: CircuitBreakerConfig,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    transition_count: u64,
}

/// Circuit breaker protecting one external dependency
///
/// State lives behind a synchronous mutex that is only held for bookkeeping,
/// never across the protected operation.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                transition_count: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without applying the OPEN timeout
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Run `operation` through the breaker
    ///
    /// While OPEN and inside the timeout the operation is not invoked and
    /// `AppError::CircuitOpen` is returned.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;
        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    fn admit(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let elapsed = inner
            .last_failure
            .map(|at| at.elapsed())
            .unwrap_or(Duration::MAX);
        let timeout = self.config.open_timeout();
        if elapsed < timeout {
            return Err(AppError::CircuitOpen {
                service: self.name.clone(),
                retry_after: timeout - elapsed,
            });
        }

        self.transition(&mut inner, CircuitState::HalfOpen);
        Ok(())
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // A call admitted before another caller opened the circuit
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, error: &AppError) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                debug!(
                    breaker = %self.name,
                    failure_count = inner.failure_count,
                    error = %error,
                    "Protected call failed"
                );
                if inner.failure_count >= self.config.failure_threshold {
                    inner.last_failure = Some(Instant::now());
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.last_failure = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            // Admitted before the circuit opened; the OPEN window is not extended
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.transition_count += 1;
        match to {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                info!(breaker = %self.name, from = %from, "Circuit breaker closed");
            }
            CircuitState::Open => {
                inner.success_count = 0;
                warn!(
                    breaker = %self.name,
                    from = %from,
                    failure_count = inner.failure_count,
                    open_timeout_ms = self.config.open_timeout_ms,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.success_count = 0;
                info!(breaker = %self.name, "Circuit breaker half-open, probing dependency");
            }
        }
        metrics::counter!(
            "circuit_breaker_transitions_total",
            "breaker" => self.name.clone(),
            "to" => to.as_str()
        )
        .increment(1);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.lock();
        let retry_after_ms = match (inner.state, inner.last_failure) {
            (CircuitState::Open, Some(at)) => Some(
                self.config
                    .open_timeout()
                    .saturating_sub(at.elapsed())
                    .as_millis() as u64,
            ),
            _ => None,
        };
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            transition_count: inner.transition_count,
            retry_after_ms,
            config: self.config.clone(),
        }
    }

    /// Force the breaker back to CLOSED
    pub fn reset(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
    }

    /// Force the breaker OPEN for a full timeout
    pub fn trip(&self) {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());
        if inner.state != CircuitState::Open {
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // Bookkeeping never panics while holding the lock; recover the data if it did
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Owns one breaker per dependency name
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker for `name`, created with the default config on first use
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.default_config.clone())
    }

    /// Breaker for `name`; `config` only applies if the breaker is new
    pub fn get_or_create_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock();
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config))),
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(name).cloned()
    }

    /// Stats for every breaker, ordered by name
    pub fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<CircuitBreakerStats> =
            self.lock().values().map(|breaker| breaker.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn reset(&self, name: &str) -> Result<()> {
        let breaker = self
            .get(name)
            .ok_or_else(|| AppError::NotFound(format!("Circuit breaker {}", name)))?;
        breaker.reset();
        info!(breaker = %name, "Circuit breaker reset");
        Ok(())
    }

    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
