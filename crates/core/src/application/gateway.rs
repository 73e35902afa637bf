// External Gateway - the only path to the workspace service

use crate::application::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, WORKSPACE_SERVICE};
use crate::application::retry::RetryPolicy;
use crate::error::{AppError, Result};
use crate::port::{ConversationHandle, WorkspaceClient, WorkspaceError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Response to a message sent through the gateway
#[derive(Debug, Clone)]
pub struct GatewayReply {
    pub response: String,
    /// Wall time of the whole exchange, retries and backoff included
    pub latency: Duration,
    pub attempts: u32,
}

/// Failed exchange, with the attempts spent before giving up
#[derive(Debug)]
pub struct GatewayFailure {
    pub error: AppError,
    pub latency: Duration,
    pub attempts: u32,
}

/// Workspace service access wrapped in retry, circuit breaker and timeout
///
/// Every open/send runs as `retry(breaker(timeout(raw_call)))`. An open
/// circuit is terminal for the retry layer.
pub struct ExternalGateway {
    client: Arc<dyn WorkspaceClient>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl ExternalGateway {
    pub fn new(
        client: Arc<dyn WorkspaceClient>,
        breakers: &CircuitBreakerRegistry,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            client,
            breaker: breakers.get_or_create(WORKSPACE_SERVICE),
            retry,
            call_timeout,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn open_conversation(
        &self,
        workspace_id: &str,
        name: &str,
    ) -> Result<ConversationHandle> {
        let client = &self.client;
        let handle = self
            .retry
            .retry_with_backoff("open_conversation", move || {
                self.guarded("open_conversation", move || {
                    client.open_conversation(workspace_id, name)
                })
            })
            .await?;
        debug!(
            workspace_id = %workspace_id,
            thread_id = %handle.thread_id,
            "Conversation opened"
        );
        Ok(handle)
    }

    /// Send a message, reporting latency and attempts on both outcomes
    pub async fn send(
        &self,
        handle: &ConversationHandle,
        text: &str,
    ) -> std::result::Result<GatewayReply, GatewayFailure> {
        let client = &self.client;
        let started = Instant::now();
        let outcome = self
            .retry
            .execute("send", move || {
                self.guarded("send", move || client.send(handle, text))
            })
            .await;
        let latency = started.elapsed();

        match outcome.result {
            Ok(response) => Ok(GatewayReply {
                response,
                latency,
                attempts: outcome.attempts,
            }),
            Err(error) => Err(GatewayFailure {
                error,
                latency,
                attempts: outcome.attempts,
            }),
        }
    }

    /// Best effort: goes through the breaker but is never retried
    pub async fn close_conversation(&self, handle: &ConversationHandle) -> Result<()> {
        let client = &self.client;
        let closed = self
            .guarded("close_conversation", move || client.close_conversation(handle))
            .await;
        if let Err(e) = &closed {
            warn!(
                thread_id = %handle.thread_id,
                error = %e,
                "Failed to close conversation"
            );
        }
        closed
    }

    async fn guarded<F, Fut, T>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, WorkspaceError>>,
    {
        let call_timeout = self.call_timeout;
        self.breaker
            .call(move || async move {
                let started = Instant::now();
                let outcome = match tokio::time::timeout(call_timeout, call()).await {
                    Ok(result) => result.map_err(AppError::from),
                    Err(_) => Err(AppError::Timeout(format!(
                        "{} exceeded {}ms",
                        operation,
                        call_timeout.as_millis()
                    ))),
                };
                let label = match &outcome {
                    Ok(_) => "ok",
                    Err(e) => e.kind(),
                };
                metrics::histogram!(
                    "workspace_call_latency_seconds",
                    "operation" => operation,
                    "outcome" => label
                )
                .record(started.elapsed().as_secs_f64());
                outcome
            })
            .await
    }
}
