// Workspace Service Port (external LLM workspace)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reference to a conversation thread opened inside a workspace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationHandle {
    pub workspace_id: String,
    pub thread_id: String,
}

/// Failure reported by the workspace service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceError {
    /// 5xx, 429, connection resets: worth retrying
    #[error("Transient workspace error: {0}")]
    Transient(String),

    /// 4xx and malformed responses: retrying will not help
    #[error("Permanent workspace error: {0}")]
    Permanent(String),

    #[error("Workspace call timed out: {0}")]
    Timeout(String),
}

impl WorkspaceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkspaceError::Transient(_) | WorkspaceError::Timeout(_))
    }
}

/// Raw client for the workspace service
///
/// Implementations perform exactly one network round trip per call. Retries,
/// circuit breaking and timeouts are layered on top by the gateway.
#[async_trait]
pub trait WorkspaceClient: Send + Sync {
    /// Open a new conversation thread in the workspace
    async fn open_conversation(
        &self,
        workspace_id: &str,
        name: &str,
    ) -> Result<ConversationHandle, WorkspaceError>;

    /// Send a message and return the response text
    async fn send(&self, handle: &ConversationHandle, text: &str)
        -> Result<String, WorkspaceError>;

    /// Delete the conversation thread
    async fn close_conversation(&self, handle: &ConversationHandle) -> Result<(), WorkspaceError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Hook = Arc<dyn Fn() + Send + Sync>;

    /// Workspace client driven by per-message scripts
    ///
    /// Each message text can be given a queue of outcomes; once the queue is
    /// drained (or for unscripted messages) the default response is returned.
    pub struct ScriptedWorkspaceClient {
        default_response: String,
        scripts: Mutex<HashMap<String, VecDeque<Result<String, WorkspaceError>>>>,
        hooks: Mutex<HashMap<String, Hook>>,
        open_error: Option<WorkspaceError>,
        delay: Duration,
        sent: Mutex<Vec<String>>,
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    impl ScriptedWorkspaceClient {
        pub fn new(default_response: impl Into<String>) -> Self {
            Self {
                default_response: default_response.into(),
                scripts: Mutex::new(HashMap::new()),
                hooks: Mutex::new(HashMap::new()),
                open_error: None,
                delay: Duration::ZERO,
                sent: Mutex::new(Vec::new()),
                opened: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            }
        }

        /// Fixed response for a given message
        pub fn with_response(self, text: &str, response: impl Into<String>) -> Self {
            self.push(text, Ok(response.into()));
            self
        }

        /// Fail the given message with each error in turn, then fall back
        /// to the default response
        pub fn with_failures(self, text: &str, errors: Vec<WorkspaceError>) -> Self {
            for error in errors {
                self.push(text, Err(error));
            }
            self
        }

        /// Run `hook` when the given message is dispatched
        pub fn with_hook(self, text: &str, hook: impl Fn() + Send + Sync + 'static) -> Self {
            self.hooks
                .lock()
                .unwrap()
                .insert(text.to_string(), Arc::new(hook));
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn failing_open(mut self, error: WorkspaceError) -> Self {
            self.open_error = Some(error);
            self
        }

        fn push(&self, text: &str, outcome: Result<String, WorkspaceError>) {
            self.scripts
                .lock()
                .unwrap()
                .entry(text.to_string())
                .or_default()
                .push_back(outcome);
        }

        pub fn sent_messages(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }

        pub fn send_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        pub fn opened_count(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }

        pub fn closed_count(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WorkspaceClient for ScriptedWorkspaceClient {
        async fn open_conversation(
            &self,
            workspace_id: &str,
            name: &str,
        ) -> Result<ConversationHandle, WorkspaceError> {
            if let Some(error) = &self.open_error {
                return Err(error.clone());
            }
            let n = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(ConversationHandle {
                workspace_id: workspace_id.to_string(),
                thread_id: format!("{}-{}", name.replace(' ', "-").to_lowercase(), n),
            })
        }

        async fn send(
            &self,
            _handle: &ConversationHandle,
            text: &str,
        ) -> Result<String, WorkspaceError> {
            self.sent.lock().unwrap().push(text.to_string());
            let hook = self.hooks.lock().unwrap().get(text).cloned();
            if let Some(hook) = hook {
                hook();
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let scripted = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(text)
                .and_then(|queue| queue.pop_front());
            scripted.unwrap_or_else(|| Ok(self.default_response.clone()))
        }

        async fn close_conversation(
            &self,
            _handle: &ConversationHandle,
        ) -> Result<(), WorkspaceError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
