// DocQA Infrastructure - HTTP Adapter
// Implements: WorkspaceClient (AnythingLLM REST API)

mod anythingllm;

pub use anythingllm::{AnythingLlmClient, AnythingLlmConfig};
