// AnythingLLM client against a mock HTTP server

use docqa_core::port::{ConversationHandle, WorkspaceClient, WorkspaceError};
use docqa_infra_http::{AnythingLlmClient, AnythingLlmConfig};
use mockito::{Matcher, Server};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn client_for(server: &Server) -> AnythingLlmClient {
    AnythingLlmClient::new(&AnythingLlmConfig {
        base_url: server.url(),
        api_key: "test-key".to_string(),
        request_timeout_ms: 2_000,
        ..Default::default()
    })
    .unwrap()
}

fn handle() -> ConversationHandle {
    ConversationHandle {
        workspace_id: "docs".to_string(),
        thread_id: "thread-1".to_string(),
    }
}

#[tokio::test]
async fn test_open_conversation_returns_thread_slug() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v1/workspace/docs/thread/new")
        .match_header("authorization", "Bearer test-key")
        .match_body(Matcher::Json(json!({"name": "Question Processing job-1"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"thread": {"id": 7, "slug": "thread-1"}, "message": null}).to_string())
        .create_async()
        .await;

    let client = client_for(&server);
    let handle = client
        .open_conversation("docs", "Question Processing job-1")
        .await
        .unwrap();

    assert_eq!(handle.workspace_id, "docs");
    assert_eq!(handle.thread_id, "thread-1");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_send_returns_text_response() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v1/workspace/docs/thread/thread-1/chat")
        .match_body(Matcher::Json(json!({"message": "What is the SLA?", "mode": "query"})))
        .with_status(200)
        .with_body(
            json!({
                "id": "abc",
                "type": "textResponse",
                "textResponse": "The SLA is 99.9%",
                "sources": [],
                "close": true,
                "error": null
            })
            .to_string(),
        )
        .create_async()
        .await;

    let counter = Arc::new(AtomicU64::new(0));
    let client = client_for(&server).with_connection_counter(counter.clone());
    let response = client.send(&handle(), "What is the SLA?").await.unwrap();

    assert_eq!(response, "The SLA is 99.9%");
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_server_errors_are_transient() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/api/v1/workspace/docs/thread/thread-1/chat")
        .with_status(503)
        .with_body(json!({"error": "LLM provider overloaded"}).to_string())
        .create_async()
        .await;

    let client = client_for(&server);
    let err = client.send(&handle(), "hello").await.unwrap_err();

    assert_eq!(
        err,
        WorkspaceError::Transient("503 - LLM provider overloaded".to_string())
    );
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_client_errors_are_permanent() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/api/v1/workspace/missing/thread/new")
        .with_status(404)
        .with_body("Workspace not found")
        .create_async()
        .await;

    let client = client_for(&server);
    let err = client
        .open_conversation("missing", "Question Processing x")
        .await
        .unwrap_err();

    assert!(matches!(err, WorkspaceError::Permanent(ref msg) if msg.contains("404")));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_reported_error_and_malformed_body_are_permanent() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/api/v1/workspace/docs/thread/thread-1/chat")
        .match_body(Matcher::PartialJson(json!({"message": "first"})))
        .with_status(200)
        .with_body(json!({"textResponse": null, "error": "No documents embedded"}).to_string())
        .create_async()
        .await;
    server
        .mock("POST", "/api/v1/workspace/docs/thread/thread-1/chat")
        .match_body(Matcher::PartialJson(json!({"message": "second"})))
        .with_status(200)
        .with_body("<html>proxy page</html>")
        .create_async()
        .await;

    let client = client_for(&server);
    let reported = client.send(&handle(), "first").await.unwrap_err();
    assert!(matches!(reported, WorkspaceError::Permanent(ref msg) if msg.contains("No documents embedded")));

    let malformed = client.send(&handle(), "second").await.unwrap_err();
    assert!(matches!(malformed, WorkspaceError::Permanent(ref msg) if msg.contains("Malformed chat")));
}

#[tokio::test]
async fn test_close_conversation_deletes_thread() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("DELETE", "/api/v1/workspace/docs/thread/thread-1")
        .with_status(200)
        .create_async()
        .await;

    let client = client_for(&server);
    client.close_conversation(&handle()).await.unwrap();
    assert_eq!(client.in_flight(), 0);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_unreachable_server_is_transient() {
    let client = AnythingLlmClient::new(&AnythingLlmConfig {
        base_url: "http://127.0.0.1:1".to_string(),
        request_timeout_ms: 1_000,
        ..Default::default()
    })
    .unwrap();

    let err = client.send(&handle(), "hello").await.unwrap_err();
    assert!(err.is_transient(), "{:?}", err);
}
