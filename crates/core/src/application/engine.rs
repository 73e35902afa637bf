// Question Execution Engine - bounded worker pool per batch job

use crate::application::cancellation::CancellationToken;
use crate::application::confidence::ConfidenceScorer;
use crate::application::degradation::{DegradationController, OperationCategory};
use crate::application::gateway::ExternalGateway;
use crate::application::job_registry::JobRegistry;
use crate::domain::{BatchReport, Job, JobId, JobResult, JobStatus, Question, QuestionResult, StatusUpdate};
use crate::error::Result;
use crate::port::ConversationHandle;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// A batch ready to run against an existing PENDING job
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub job_id: JobId,
    pub workspace_id: String,
    pub questions: Vec<Question>,
    pub concurrency: usize,
}

/// State shared by the workers of one batch
struct BatchRun {
    job_id: JobId,
    questions: Vec<Question>,
    handle: ConversationHandle,
    next: AtomicUsize,
    results: Mutex<Vec<Option<QuestionResult>>>,
    /// First systemic failure; once set no worker pulls new work
    abort: OnceLock<String>,
    cancel: CancellationToken,
}

impl BatchRun {
    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.abort.get().is_some()
    }

    fn abort(&self, cause: String) {
        if self.abort.set(cause.clone()).is_ok() {
            warn!(job_id = %self.job_id, cause = %cause, "Batch aborted, no further questions dispatched");
        }
    }

    fn record(&self, index: usize, result: QuestionResult) {
        let mut results = self
            .results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        results[index] = Some(result);
    }

    fn collect(&self) -> Vec<QuestionResult> {
        let mut results = self
            .results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        results.iter_mut().filter_map(Option::take).collect()
    }
}

/// Drives one question batch from PROCESSING to a terminal status
pub struct QuestionExecutionEngine {
    registry: Arc<JobRegistry>,
    gateway: Arc<ExternalGateway>,
    degradation: Arc<DegradationController>,
    scorer: ConfidenceScorer,
}

impl QuestionExecutionEngine {
    pub fn new(
        registry: Arc<JobRegistry>,
        gateway: Arc<ExternalGateway>,
        degradation: Arc<DegradationController>,
        scorer: ConfidenceScorer,
    ) -> Self {
        Self {
            registry,
            gateway,
            degradation,
            scorer,
        }
    }

    /// Run the batch to completion, failure or cancellation
    ///
    /// Per-question failures are recorded and the batch goes on. An open
    /// circuit or an admission rejection stops dispatching and fails the job,
    /// keeping the results gathered so far.
    pub async fn run(&self, request: BatchRequest, cancel: CancellationToken) -> Result<Job> {
        let BatchRequest {
            job_id,
            workspace_id,
            questions,
            concurrency,
        } = request;
        let total = questions.len();
        let started = Instant::now();

        self.registry.start_job(&job_id, total).await?;
        info!(
            job_id = %job_id,
            workspace_id = %workspace_id,
            questions = total,
            concurrency,
            "Question batch started"
        );

        let thread_name = format!(
            "Question Processing {}",
            job_id.chars().take(8).collect::<String>()
        );
        let handle = match self
            .gateway
            .open_conversation(&workspace_id, &thread_name)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Could not open conversation");
                let update = StatusUpdate::to(JobStatus::Failed)
                    .with_error(format!("Failed to open conversation: {}", e));
                return self.finish(&job_id, update, started).await;
            }
        };

        let run = Arc::new(BatchRun {
            job_id: job_id.clone(),
            results: Mutex::new(vec![None; total]),
            questions,
            handle,
            next: AtomicUsize::new(0),
            abort: OnceLock::new(),
            cancel,
        });

        let mut workers = JoinSet::new();
        for worker in 0..concurrency.clamp(1, total.max(1)) {
            let span = tracing::info_span!("batch_worker", job_id = %job_id, worker);
            workers.spawn(
                Self::work(
                    Arc::clone(&run),
                    Arc::clone(&self.registry),
                    Arc::clone(&self.gateway),
                    Arc::clone(&self.degradation),
                    self.scorer.clone(),
                )
                .instrument(span),
            );
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(job_id = %job_id, error = %e, "Batch worker crashed");
                run.abort(format!("Worker failure: {}", e));
            }
        }

        // Close on every exit path; failure here never changes the outcome
        let _ = self.gateway.close_conversation(&run.handle).await;

        let results = run.collect();
        let answered_all = results.len() == total;
        let report = BatchReport::new(total, results);
        let payload = JobResult::new(serde_json::to_value(&report)?);

        let update = if let Some(cause) = run.abort.get() {
            let update = StatusUpdate::to(JobStatus::Failed)
                .with_error(format!("Batch aborted: {}", cause));
            if report.results.is_empty() {
                update
            } else {
                update.with_result(payload)
            }
        } else if run.cancel.is_cancelled() && !answered_all {
            let reason = run
                .cancel
                .reason()
                .unwrap_or_else(|| "no reason given".to_string());
            StatusUpdate::to(JobStatus::Cancelled)
                .with_error(format!("Job cancelled: {}", reason))
                .with_result(payload)
        } else {
            StatusUpdate::to(JobStatus::Completed).with_result(payload)
        };

        info!(
            job_id = %job_id,
            answered = report.results.len(),
            successful = report.summary.successful,
            failed = report.summary.failed,
            "Question batch finished"
        );
        self.finish(&job_id, update, started).await
    }

    async fn finish(&self, job_id: &JobId, update: StatusUpdate, started: Instant) -> Result<Job> {
        let job = self.registry.update_job_status(job_id, update).await?;
        metrics::histogram!("job_duration_seconds", "outcome" => job.status.as_str())
            .record(started.elapsed().as_secs_f64());
        Ok(job)
    }

    async fn work(
        run: Arc<BatchRun>,
        registry: Arc<JobRegistry>,
        gateway: Arc<ExternalGateway>,
        degradation: Arc<DegradationController>,
        scorer: ConfidenceScorer,
    ) {
        loop {
            if run.should_stop() {
                break;
            }
            let index = run.next.fetch_add(1, Ordering::SeqCst);
            let Some(question) = run.questions.get(index) else {
                break;
            };
            if let Err(e) = degradation
                .check_availability(OperationCategory::BatchUnit)
                .await
            {
                run.abort(e.to_string());
                break;
            }

            let unit_started = Instant::now();
            let result = match gateway.send(&run.handle, &question.text).await {
                Ok(reply) => {
                    let score = scorer.score(&reply.response, &question.expected_fragments);
                    QuestionResult {
                        question_id: question.id.clone(),
                        question_text: question.text.clone(),
                        response: reply.response,
                        confidence_score: score.value,
                        processing_time: unit_started.elapsed().as_secs_f64(),
                        fragments_found: score.fragments_found,
                        success: score.success,
                        error: None,
                        attempts: reply.attempts,
                    }
                }
                Err(failure) if failure.error.is_systemic() => {
                    run.abort(failure.error.to_string());
                    break;
                }
                Err(failure) => {
                    debug!(
                        question_id = %question.id,
                        attempts = failure.attempts,
                        error = %failure.error,
                        "Question failed"
                    );
                    QuestionResult::failed(
                        question,
                        failure.error.to_string(),
                        unit_started.elapsed().as_secs_f64(),
                        failure.attempts,
                    )
                }
            };

            let outcome = if result.success { "success" } else { "failed" };
            metrics::counter!("questions_processed_total", "outcome" => outcome).increment(1);
            run.record(index, result);

            if let Err(e) = registry.complete_unit(&run.job_id).await {
                warn!(job_id = %run.job_id, error = %e, "Failed to persist progress");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::cancellation::cancellation_channel;
    use crate::application::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, WORKSPACE_SERVICE};
    use crate::application::degradation::DegradationConfig;
    use crate::application::retry::{RetryConfig, RetryPolicy};
    use crate::domain::JobType;
    use crate::port::id_provider::mocks::SequentialIdProvider;
    use crate::port::job_repository::mocks::InMemoryJobRepository;
    use crate::port::resource_sampler::mocks::MockResourceSampler;
    use crate::port::time_provider::SystemTimeProvider;
    use crate::port::workspace_client::mocks::ScriptedWorkspaceClient;
    use crate::port::WorkspaceError;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Harness {
        engine: QuestionExecutionEngine,
        registry: Arc<JobRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        sampler: Arc<MockResourceSampler>,
    }

    fn harness(client: Arc<ScriptedWorkspaceClient>) -> Harness {
        let registry = Arc::new(JobRegistry::new(
            Arc::new(InMemoryJobRepository::new()),
            Arc::new(SystemTimeProvider),
            Arc::new(SequentialIdProvider::default()),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let retry = RetryPolicy::new(RetryConfig {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            exponential_base: 2.0,
            jitter: false,
        })
        .unwrap();
        let gateway = Arc::new(ExternalGateway::new(
            client,
            &breakers,
            retry,
            Duration::from_secs(30),
        ));
        let sampler = Arc::new(MockResourceSampler::idle());
        let degradation = Arc::new(DegradationController::new(
            sampler.clone(),
            DegradationConfig::default(),
        ));
        let engine = QuestionExecutionEngine::new(
            registry.clone(),
            gateway,
            degradation,
            ConfidenceScorer::default(),
        );
        Harness {
            engine,
            registry,
            breakers,
            sampler,
        }
    }

    fn questions(n: usize) -> Vec<Question> {
        (1..=n)
            .map(|i| Question::new(format!("q{}", i), format!("question {}", i), vec![format!("answer {}", i)]))
            .collect()
    }

    async fn request(h: &Harness, questions: Vec<Question>, concurrency: usize) -> BatchRequest {
        let job = h
            .registry
            .create_job(JobType::QuestionBatch, "ws", BTreeMap::new())
            .await
            .unwrap();
        BatchRequest {
            job_id: job.id,
            workspace_id: "ws".to_string(),
            questions,
            concurrency,
        }
    }

    fn report(job: &Job) -> BatchReport {
        serde_json::from_value(job.result.clone().unwrap().into_value()).unwrap()
    }

    fn echo_client(n: usize) -> ScriptedWorkspaceClient {
        (1..=n).fold(ScriptedWorkspaceClient::new("unscripted"), |client, i| {
            client.with_response(&format!("question {}", i), format!("here is answer {}", i))
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retries_keep_order_and_complete() {
        let client = Arc::new(
            ScriptedWorkspaceClient::new("unscripted")
                .with_response("question 1", "answer 1")
                .with_response("question 2", "answer 2")
                .with_failures(
                    "question 3",
                    vec![
                        WorkspaceError::Transient("502".into()),
                        WorkspaceError::Transient("503".into()),
                    ],
                )
                .with_response("question 3", "answer 3")
                .with_response("question 4", "answer 4")
                .with_response("question 5", "answer 5"),
        );
        let h = harness(client.clone());
        let req = request(&h, questions(5), 2).await;

        let job = h.engine.run(req, CancellationToken::never()).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100.0);
        assert!(job.error.is_none());

        let report = report(&job);
        let ids: Vec<&str> = report.results.iter().map(|r| r.question_id.as_str()).collect();
        assert_eq!(ids, vec!["q1", "q2", "q3", "q4", "q5"]);
        assert!(report.results.iter().all(|r| r.success));

        let third = &report.results[2];
        assert_eq!(third.attempts, 3);
        // 1s + 2s of backoff
        assert!(third.processing_time >= 3.0, "{}", third.processing_time);
        assert_eq!(client.opened_count(), 1);
        assert_eq!(client.closed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_aborts_batch() {
        let breakers_for_hook: Arc<std::sync::OnceLock<Arc<CircuitBreakerRegistry>>> =
            Arc::new(std::sync::OnceLock::new());
        let hook_registry = breakers_for_hook.clone();
        let client = Arc::new(echo_client(5).with_hook("question 1", move || {
            if let Some(registry) = hook_registry.get() {
                registry.get_or_create(WORKSPACE_SERVICE).trip();
            }
        }));
        let h = harness(client.clone());
        let _ = breakers_for_hook.set(h.breakers.clone());
        let req = request(&h, questions(5), 1).await;

        let job = h.engine.run(req, CancellationToken::never()).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.clone().unwrap();
        assert!(error.contains("Circuit breaker open"), "{}", error);

        let report = report(&job);
        assert_eq!(report.total_questions, 5);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].question_id, "q1");
        assert_eq!(client.sent_messages(), vec!["question 1".to_string()]);
        assert_eq!(job.progress, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failures_are_isolated() {
        let client = Arc::new(echo_client(4).with_failures(
            "question 2",
            vec![WorkspaceError::Permanent("422 unprocessable".into())],
        ));
        let h = harness(client);
        let req = request(&h, questions(4), 3).await;

        let job = h.engine.run(req, CancellationToken::never()).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        let report = report(&job);
        assert_eq!(report.results.len(), 4);
        assert!(!report.results[1].success);
        assert!(report.results[1]
            .error
            .as_deref()
            .unwrap()
            .contains("422 unprocessable"));
        assert_eq!(report.summary.successful, 3);
        assert_eq!(report.summary.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_keeps_in_flight_results() {
        let (cancel, token) = cancellation_channel();
        let client = Arc::new(
            echo_client(6)
                .with_delay(Duration::from_millis(100))
                .with_hook("question 3", move || cancel.cancel("user request")),
        );
        let h = harness(client.clone());
        let req = request(&h, questions(6), 2).await;

        let job = h.engine.run(req, token).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.error.as_deref(), Some("Job cancelled: user request"));

        // Every dispatched call finished and was kept; nothing new started
        // once the flag was raised by the third dispatch
        let report = report(&job);
        let ids: Vec<&str> = report.results.iter().map(|r| r.question_id.as_str()).collect();
        assert_eq!(report.results.len(), client.send_count());
        assert!(client.send_count() < 6);
        assert_eq!(&ids[..3], &["q1", "q2", "q3"]);
        assert!(report.results.iter().all(|r| r.success));
        assert_eq!(client.closed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_fails_job_without_results() {
        let client = Arc::new(
            ScriptedWorkspaceClient::new("x")
                .failing_open(WorkspaceError::Permanent("404 workspace not found".into())),
        );
        let h = harness(client.clone());
        let req = request(&h, questions(3), 2).await;

        let job = h.engine.run(req, CancellationToken::never()).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("Failed to open conversation"));
        assert!(job.result.is_none());
        assert_eq!(client.send_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_mid_batch_aborts() {
        let client = Arc::new(echo_client(3));
        let h = harness(client.clone());
        h.engine.degradation.set_maintenance_mode(true);
        let req = request(&h, questions(3), 1).await;

        let job = h.engine.run(req, CancellationToken::never()).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("MAINTENANCE"));
        assert_eq!(client.send_count(), 0);
        assert_eq!(client.closed_count(), 1);
        assert!(h.sampler.sample_count() == 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_confidence_is_partial_success() {
        let client = Arc::new(ScriptedWorkspaceClient::new("I do not know"));
        let h = harness(client);
        let req = request(&h, questions(2), 2).await;

        let job = h.engine.run(req, CancellationToken::never()).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let report = report(&job);
        assert!(report.results.iter().all(|r| !r.success && r.error.is_none()));
        assert_eq!(report.summary.confidence_distribution.low, 2);
    }
}
