//! Question batches end to end: service, engine and SQLite store

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use docqa_core::application::{
    CircuitBreakerRegistry, CircuitState, EngineConfig, ExportFormat, QuestionBatchService,
    RetryConfig, ServiceDeps, WORKSPACE_SERVICE,
};
use docqa_core::domain::{Job, JobStatus, Question};
use docqa_core::port::id_provider::UuidProvider;
use docqa_core::port::resource_sampler::mocks::MockResourceSampler;
use docqa_core::port::time_provider::SystemTimeProvider;
use docqa_core::port::workspace_client::mocks::ScriptedWorkspaceClient;
use docqa_core::port::{JobFilter, WorkspaceError};
use docqa_core::AppError;
use docqa_infra_sqlite::{create_pool, run_migrations, SqliteJobRepository};

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry = RetryConfig {
        max_retries: 3,
        base_delay_ms: 20,
        max_delay_ms: 200,
        exponential_base: 2.0,
        jitter: false,
    };
    config
}

async fn service_with(
    client: Arc<ScriptedWorkspaceClient>,
    sampler: Arc<MockResourceSampler>,
) -> QuestionBatchService {
    let pool = create_pool("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();

    QuestionBatchService::build(
        &fast_config(),
        ServiceDeps {
            repo: Arc::new(SqliteJobRepository::new(pool)),
            client,
            sampler,
            time_provider: Arc::new(SystemTimeProvider),
            id_provider: Arc::new(UuidProvider),
        },
    )
    .unwrap()
}

async fn service(client: Arc<ScriptedWorkspaceClient>) -> QuestionBatchService {
    service_with(client, Arc::new(MockResourceSampler::idle())).await
}

fn questions(n: usize) -> Vec<Question> {
    (1..=n)
        .map(|i| {
            Question::new(
                format!("q{}", i),
                format!("question {}", i),
                vec![format!("answer {}", i)],
            )
        })
        .collect()
}

fn answering(n: usize) -> ScriptedWorkspaceClient {
    (1..=n).fold(ScriptedWorkspaceClient::new("unscripted"), |client, i| {
        client.with_response(&format!("question {}", i), format!("here is answer {}", i))
    })
}

fn result_ids(job: &Job) -> Vec<String> {
    let result = job.result.as_ref().unwrap().as_value();
    result["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["question_id"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_transient_failures_are_retried_in_order() {
    let client = Arc::new(
        ScriptedWorkspaceClient::new("unscripted")
            .with_response("question 1", "answer 1")
            .with_response("question 2", "answer 2")
            .with_failures(
                "question 3",
                vec![
                    WorkspaceError::Transient("502 - bad gateway".into()),
                    WorkspaceError::Timeout("no reply".into()),
                ],
            )
            .with_response("question 3", "answer 3")
            .with_response("question 4", "answer 4")
            .with_response("question 5", "answer 5"),
    );
    let service = service(client.clone()).await;

    let id = service
        .submit_question_batch("contracts", questions(5), Some(2))
        .await
        .unwrap();
    let job = service.wait_for_job(&id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100.0);
    assert!(job.started_at.is_some() && job.completed_at.is_some());
    assert_eq!(result_ids(&job), vec!["q1", "q2", "q3", "q4", "q5"]);

    let report = service.get_batch_report(&id).await.unwrap();
    assert_eq!(report.summary.successful, 5);
    let third = &report.results[2];
    assert!(third.success);
    assert_eq!(third.attempts, 3);
    // 20ms + 40ms of backoff
    assert!(third.processing_time >= 0.06, "{}", third.processing_time);

    assert_eq!(client.send_count(), 7);
    assert_eq!(client.opened_count(), 1);
    assert_eq!(client.closed_count(), 1);
}

#[tokio::test]
async fn test_open_circuit_fails_batch_with_partial_results() {
    let breakers: Arc<OnceLock<Arc<CircuitBreakerRegistry>>> = Arc::new(OnceLock::new());
    let hook_breakers = breakers.clone();
    let client = Arc::new(answering(5).with_hook("question 1", move || {
        if let Some(registry) = hook_breakers.get() {
            registry.get_or_create(WORKSPACE_SERVICE).trip();
        }
    }));
    let service = service(client.clone()).await;
    let _ = breakers.set(service.breakers().clone());

    let id = service
        .submit_question_batch("contracts", questions(5), Some(1))
        .await
        .unwrap();
    let job = service.wait_for_job(&id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.clone().unwrap();
    assert!(error.contains("Circuit breaker open"), "{}", error);
    assert_eq!(result_ids(&job), vec!["q1"]);
    assert_eq!(client.sent_messages(), vec!["question 1".to_string()]);
    assert_eq!(client.closed_count(), 1);

    let health = service.health().await.unwrap();
    let breaker = health
        .circuit_breakers
        .iter()
        .find(|stats| stats.name == WORKSPACE_SERVICE)
        .unwrap();
    assert_eq!(breaker.state, CircuitState::Open);
    assert_eq!(health.jobs.by_status["FAILED"], 1);
}

#[tokio::test]
async fn test_permanent_failure_is_isolated_to_its_question() {
    let client = Arc::new(answering(4).with_failures(
        "question 2",
        vec![WorkspaceError::Permanent("422 - unprocessable".into())],
    ));
    let service = service(client.clone()).await;

    let id = service
        .submit_question_batch("contracts", questions(4), Some(3))
        .await
        .unwrap();
    let job = service.wait_for_job(&id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    let report = service.get_batch_report(&id).await.unwrap();
    assert_eq!(report.summary.successful, 3);
    assert_eq!(report.summary.failed, 1);
    assert!(!report.results[1].success);
    assert_eq!(report.results[1].attempts, 1);
    assert!(report.results[1]
        .error
        .as_deref()
        .unwrap()
        .contains("422 - unprocessable"));
}

#[tokio::test]
async fn test_cancellation_keeps_finished_results() {
    let client = Arc::new(answering(6).with_delay(Duration::from_millis(50)));
    let service = service(client.clone()).await;

    let id = service
        .submit_question_batch("contracts", questions(6), Some(1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    let job = service.cancel_job(&id, "operator request").await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.error.as_deref(), Some("Job cancelled: operator request"));

    let ids = result_ids(&job);
    assert!(!ids.is_empty());
    assert!(ids.len() < 6);
    assert_eq!(ids.len(), client.send_count());
    assert_eq!(ids[0], "q1");
    assert_eq!(client.closed_count(), 1);

    // The store has the same terminal job
    let stored = service.get_job(&id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);

    let err = service.cancel_job(&id, "again").await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn test_degraded_host_rejects_before_persisting() {
    let sampler = Arc::new(MockResourceSampler::idle());
    sampler.set_cpu(90.0);
    let service = service_with(Arc::new(answering(2)), sampler).await;

    let err = service
        .submit_question_batch("contracts", questions(2), Some(1))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ServiceUnavailable { .. }), "{:?}", err);

    let jobs = service.list_jobs(&JobFilter::default()).await.unwrap();
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn test_exports_read_back_from_store() {
    let client = Arc::new(answering(3));
    let service = service(client).await;

    let id = service
        .submit_question_batch("contracts", questions(3), None)
        .await
        .unwrap();
    service.wait_for_job(&id).await.unwrap();

    let csv = service.export_results(&id, ExportFormat::Csv).await.unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("question_id,question_text,response"));
    assert!(lines[1].starts_with("q1,question 1,here is answer 1,1.000,"));

    let json = service.export_results(&id, ExportFormat::Json).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["export_info"]["job_id"], id.as_str());
    assert_eq!(value["export_info"]["status"], "COMPLETED");
    assert_eq!(value["summary"]["total"], 3);
    assert_eq!(value["results"].as_array().unwrap().len(), 3);
}
