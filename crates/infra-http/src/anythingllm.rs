// AnythingLLM workspace client
// One HTTP round trip per call; retries and breaking live in the gateway

use async_trait::async_trait;
use docqa_core::error::{AppError, Result};
use docqa_core::port::{ConversationHandle, WorkspaceClient, WorkspaceError};
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const API_BASE: &str = "/api/v1";
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnythingLlmConfig {
    pub base_url: String,
    pub api_key: String,
    /// Transport-level ceiling; the engine applies its own per-call timeout
    pub request_timeout_ms: u64,
    /// "query" answers from workspace documents only, "chat" may improvise
    pub chat_mode: String,
}

impl Default for AnythingLlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3001".to_string(),
            api_key: String::new(),
            request_timeout_ms: 120_000,
            chat_mode: "query".to_string(),
        }
    }
}

#[derive(Serialize)]
struct NewThreadRequest<'a> {
    name: &'a str,
}

#[derive(Deserialize)]
struct NewThreadResponse {
    thread: ThreadInfo,
}

#[derive(Deserialize)]
struct ThreadInfo {
    slug: Option<String>,
    id: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    mode: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(rename = "textResponse", alias = "response")]
    text_response: Option<String>,
    error: Option<String>,
}

/// Counts a request as an active connection for as long as it lives
struct InFlight(Arc<AtomicU64>);

impl InFlight {
    fn start(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Map an error status to transient or permanent
fn classify_status(status: StatusCode, body: &str) -> WorkspaceError {
    let message = format!("{} - {}", status.as_u16(), error_detail(body));
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        WorkspaceError::Transient(message)
    } else {
        WorkspaceError::Permanent(message)
    }
}

fn classify_transport(err: reqwest::Error) -> WorkspaceError {
    if err.is_timeout() {
        WorkspaceError::Timeout(err.to_string())
    } else if err.is_decode() || err.is_builder() {
        WorkspaceError::Permanent(err.to_string())
    } else {
        WorkspaceError::Transient(err.to_string())
    }
}

/// Pull the message out of a JSON error body, or fall back to the raw text
fn error_detail(body: &str) -> String {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let from_json = parsed.as_ref().and_then(|value| {
        value
            .get("error")
            .or_else(|| value.get("message"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    });
    from_json.unwrap_or_else(|| body.chars().take(MAX_ERROR_BODY).collect())
}

/// WorkspaceClient for the AnythingLLM REST API
pub struct AnythingLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    chat_mode: String,
    in_flight: Arc<AtomicU64>,
}

impl AnythingLlmClient {
    pub fn new(config: &AnythingLlmConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(AppError::Config("workspace.base_url must be set".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            chat_mode: config.chat_mode.clone(),
            in_flight: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Share the in-flight request count, e.g. with a resource sampler
    pub fn with_connection_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.in_flight = counter;
        self
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_BASE, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        if self.api_key.is_empty() {
            request
        } else {
            request.bearer_auth(&self.api_key)
        }
    }

    /// Send the request and return the body of a successful response
    async fn execute(&self, request: RequestBuilder) -> std::result::Result<String, WorkspaceError> {
        let _in_flight = InFlight::start(&self.in_flight);
        let response = self
            .authorized(request)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let body = response.text().await.map_err(classify_transport)?;
        if status.is_success() {
            Ok(body)
        } else {
            let error = classify_status(status, &body);
            warn!(status = status.as_u16(), error = %error, "Workspace request failed");
            Err(error)
        }
    }

    fn parse<T: for<'de> Deserialize<'de>>(
        body: &str,
        what: &str,
    ) -> std::result::Result<T, WorkspaceError> {
        serde_json::from_str(body)
            .map_err(|e| WorkspaceError::Permanent(format!("Malformed {} response: {}", what, e)))
    }
}

#[async_trait]
impl WorkspaceClient for AnythingLlmClient {
    async fn open_conversation(
        &self,
        workspace_id: &str,
        name: &str,
    ) -> std::result::Result<ConversationHandle, WorkspaceError> {
        let request = self
            .http
            .post(self.url(&format!("/workspace/{}/thread/new", workspace_id)))
            .json(&NewThreadRequest { name });
        let body = self.execute(request).await?;
        let created: NewThreadResponse = Self::parse(&body, "thread")?;

        let thread_id = created
            .thread
            .slug
            .or_else(|| {
                created.thread.id.map(|id| match id {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
            })
            .ok_or_else(|| {
                WorkspaceError::Permanent("Thread response carries no slug or id".to_string())
            })?;

        debug!(workspace_id, thread_id = %thread_id, "Conversation opened");
        Ok(ConversationHandle {
            workspace_id: workspace_id.to_string(),
            thread_id,
        })
    }

    async fn send(
        &self,
        handle: &ConversationHandle,
        text: &str,
    ) -> std::result::Result<String, WorkspaceError> {
        let request = self
            .http
            .post(self.url(&format!(
                "/workspace/{}/thread/{}/chat",
                handle.workspace_id, handle.thread_id
            )))
            .json(&ChatRequest {
                message: text,
                mode: &self.chat_mode,
            });
        let body = self.execute(request).await?;
        let chat: ChatResponse = Self::parse(&body, "chat")?;

        if let Some(error) = chat.error.filter(|e| !e.is_empty()) {
            return Err(WorkspaceError::Permanent(format!(
                "Workspace reported an error: {}",
                error
            )));
        }
        chat.text_response
            .ok_or_else(|| WorkspaceError::Permanent("Chat response has no text".to_string()))
    }

    async fn close_conversation(
        &self,
        handle: &ConversationHandle,
    ) -> std::result::Result<(), WorkspaceError> {
        let request = self.http.delete(self.url(&format!(
            "/workspace/{}/thread/{}",
            handle.workspace_id, handle.thread_id
        )));
        self.execute(request).await?;
        debug!(thread_id = %handle.thread_id, "Conversation closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            WorkspaceError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            WorkspaceError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, ""),
            WorkspaceError::Permanent(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            WorkspaceError::Permanent(_)
        ));
    }

    #[test]
    fn test_error_detail_prefers_json_message() {
        assert_eq!(error_detail(r#"{"error":"Invalid API Key"}"#), "Invalid API Key");
        assert_eq!(error_detail(r#"{"message":"busy"}"#), "busy");
        assert_eq!(error_detail("gateway down"), "gateway down");
        assert_eq!(error_detail(&"x".repeat(500)).len(), MAX_ERROR_BODY);
    }

    #[test]
    fn test_empty_base_url_rejected() {
        let config = AnythingLlmConfig {
            base_url: " ".to_string(),
            ..Default::default()
        };
        assert!(matches!(AnythingLlmClient::new(&config), Err(AppError::Config(_))));
    }

    #[test]
    fn test_url_trims_trailing_slash() {
        let config = AnythingLlmConfig {
            base_url: "http://llm.local:3001/".to_string(),
            ..Default::default()
        };
        let client = AnythingLlmClient::new(&config).unwrap();
        assert_eq!(
            client.url("/workspace/docs/thread/new"),
            "http://llm.local:3001/api/v1/workspace/docs/thread/new"
        );
    }
}
