// Question Batch Service - submit, observe, cancel and export question batches

use crate::application::cancellation::{cancellation_channel, CancellationHandle, CancellationToken};
use crate::application::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerStats};
use crate::application::confidence::ConfidenceScorer;
use crate::application::config::{EngineConfig, ExecutionConfig};
use crate::application::degradation::{DegradationController, DegradationStatus, OperationCategory};
use crate::application::engine::{BatchRequest, QuestionExecutionEngine};
use crate::application::gateway::ExternalGateway;
use crate::application::job_registry::JobRegistry;
use crate::application::retry::RetryPolicy;
use crate::domain::{BatchReport, Job, JobId, JobStatus, JobType, Question, StatusUpdate};
use crate::error::{AppError, Result};
use crate::port::{
    IdProvider, JobFilter, JobRepository, ResourceSampler, TimeProvider, WorkspaceClient,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, Instrument};

/// Output format for `export_results`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(AppError::Validation(format!(
                "Unsupported export format: {}",
                other
            ))),
        }
    }
}

/// Job counts and slot usage
#[derive(Debug, Clone, Serialize)]
pub struct JobStatistics {
    pub total_jobs: i64,
    pub by_status: BTreeMap<String, i64>,
    /// COMPLETED share of finished jobs, in percent
    pub success_rate: f64,
    pub running_batches: usize,
    pub max_concurrent_jobs: usize,
    /// Percentage of batch slots in use
    pub utilization: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub degradation: DegradationStatus,
    pub circuit_breakers: Vec<CircuitBreakerStats>,
    pub jobs: JobStatistics,
}

/// Adapters the service is assembled from
pub struct ServiceDeps {
    pub repo: Arc<dyn JobRepository>,
    pub client: Arc<dyn WorkspaceClient>,
    pub sampler: Arc<dyn ResourceSampler>,
    pub time_provider: Arc<dyn TimeProvider>,
    pub id_provider: Arc<dyn IdProvider>,
}

struct RunningBatch {
    cancel: CancellationHandle,
    done: watch::Receiver<bool>,
}

type RunningMap = Mutex<HashMap<JobId, RunningBatch>>;

fn lock_running(running: &RunningMap) -> MutexGuard<'_, HashMap<JobId, RunningBatch>> {
    running
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Serialize)]
struct ExportInfo<'a> {
    job_id: &'a str,
    workspace_id: &'a str,
    status: JobStatus,
    created_at: String,
    completed_at: Option<String>,
    exported_at: String,
}

#[derive(Serialize)]
struct ResultsExport<'a> {
    export_info: ExportInfo<'a>,
    #[serde(flatten)]
    report: &'a BatchReport,
}

const CSV_HEADER: &str = "question_id,question_text,response,confidence_score,processing_time,fragments_found,success,error,attempts";

/// Facade over the registry and the execution engine
///
/// Submissions return as soon as the job is persisted; batches run in the
/// background, at most `max_concurrent_jobs` at a time.
pub struct QuestionBatchService {
    registry: Arc<JobRegistry>,
    engine: Arc<QuestionExecutionEngine>,
    degradation: Arc<DegradationController>,
    breakers: Arc<CircuitBreakerRegistry>,
    execution: ExecutionConfig,
    job_slots: Arc<Semaphore>,
    running: Arc<RunningMap>,
}

impl QuestionBatchService {
    /// Wire the engine from a validated configuration
    pub fn build(config: &EngineConfig, deps: ServiceDeps) -> Result<Self> {
        config.validate()?;

        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let registry = Arc::new(JobRegistry::new(
            deps.repo,
            deps.time_provider,
            deps.id_provider,
        ));
        let gateway = Arc::new(ExternalGateway::new(
            deps.client,
            &breakers,
            RetryPolicy::new(config.retry.clone())?,
            config.execution.call_timeout(),
        ));
        let degradation = Arc::new(DegradationController::new(
            deps.sampler,
            config.degradation.clone(),
        ));
        let scorer = ConfidenceScorer::new(config.scoring.success_threshold)?;
        let engine = Arc::new(QuestionExecutionEngine::new(
            Arc::clone(&registry),
            gateway,
            Arc::clone(&degradation),
            scorer,
        ));

        Ok(Self {
            registry,
            engine,
            degradation,
            breakers,
            execution: config.execution.clone(),
            job_slots: Arc::new(Semaphore::new(config.execution.max_concurrent_jobs)),
            running: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn degradation(&self) -> &Arc<DegradationController> {
        &self.degradation
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    fn validate_batch(
        &self,
        workspace_id: &str,
        questions: &[Question],
        concurrency: usize,
    ) -> Result<()> {
        if workspace_id.trim().is_empty() {
            return Err(AppError::Validation(
                "Workspace id must not be empty".to_string(),
            ));
        }
        if questions.is_empty() {
            return Err(AppError::Validation(
                "A batch needs at least one question".to_string(),
            ));
        }
        if questions.len() > self.execution.max_questions_per_batch {
            return Err(AppError::Validation(format!(
                "Batch has {} questions, the limit is {}",
                questions.len(),
                self.execution.max_questions_per_batch
            )));
        }
        let mut seen = HashSet::new();
        for question in questions {
            question.validate()?;
            if !seen.insert(question.id.as_str()) {
                return Err(AppError::Validation(format!(
                    "Duplicate question id: {}",
                    question.id
                )));
            }
        }
        if concurrency == 0 || concurrency > self.execution.max_concurrency {
            return Err(AppError::Validation(format!(
                "Concurrency must be within 1..={}, got {}",
                self.execution.max_concurrency, concurrency
            )));
        }
        Ok(())
    }

    /// Validate and persist a batch, then run it in the background
    ///
    /// Returns the id of the PENDING job. Nothing is persisted when the
    /// batch is invalid or the degradation controller rejects it.
    pub async fn submit_question_batch(
        &self,
        workspace_id: &str,
        questions: Vec<Question>,
        concurrency: Option<usize>,
    ) -> Result<JobId> {
        let concurrency = concurrency.unwrap_or(self.execution.default_concurrency);
        self.validate_batch(workspace_id, &questions, concurrency)?;
        self.degradation
            .check_availability(OperationCategory::NewBatch { concurrency })
            .await?;

        let mut metadata = BTreeMap::new();
        metadata.insert("question_count".to_string(), questions.len().to_string());
        metadata.insert("concurrency".to_string(), concurrency.to_string());
        let job = self
            .registry
            .create_job(JobType::QuestionBatch, workspace_id, metadata)
            .await?;

        let (cancel, token) = cancellation_channel();
        let (done_tx, done_rx) = watch::channel(false);
        lock_running(&self.running).insert(
            job.id.clone(),
            RunningBatch {
                cancel,
                done: done_rx,
            },
        );

        let request = BatchRequest {
            job_id: job.id.clone(),
            workspace_id: workspace_id.to_string(),
            questions,
            concurrency,
        };
        let engine = Arc::clone(&self.engine);
        let registry = Arc::clone(&self.registry);
        let slots = Arc::clone(&self.job_slots);
        let running = Arc::clone(&self.running);
        let span = tracing::info_span!("question_batch", job_id = %job.id);
        tokio::spawn(
            async move {
                let job_id = request.job_id.clone();
                Self::drive(engine, registry, slots, request, token).await;
                lock_running(&running).remove(&job_id);
                let _ = done_tx.send(true);
            }
            .instrument(span),
        );

        info!(
            job_id = %job.id,
            workspace_id = %workspace_id,
            concurrency,
            "Question batch submitted"
        );
        Ok(job.id)
    }

    async fn drive(
        engine: Arc<QuestionExecutionEngine>,
        registry: Arc<JobRegistry>,
        slots: Arc<Semaphore>,
        request: BatchRequest,
        mut token: CancellationToken,
    ) {
        let job_id = request.job_id.clone();
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(job_id = %job_id, "Cancelled while waiting for a batch slot");
                return;
            }
            permit = slots.acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            return;
        };
        if token.is_cancelled() {
            return;
        }

        metrics::gauge!("active_jobs").increment(1.0);
        let outcome = engine.run(request, token).await;
        metrics::gauge!("active_jobs").decrement(1.0);

        match outcome {
            Ok(job) => info!(job_id = %job.id, status = %job.status, "Question batch job finished"),
            Err(AppError::Conflict(msg)) => {
                debug!(job_id = %job_id, reason = %msg, "Job changed state before it could run")
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Question batch job crashed");
                let update = StatusUpdate::to(JobStatus::Failed)
                    .with_error(format!("Internal error: {}", e));
                if let Err(e) = registry.update_job_status(&job_id, update).await {
                    error!(job_id = %job_id, error = %e, "Could not mark job as failed");
                }
            }
        }
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Job> {
        self.registry.get_job(id).await
    }

    /// Wait until the job's background run is over, then return the job
    pub async fn wait_for_job(&self, id: &JobId) -> Result<Job> {
        let done = lock_running(&self.running)
            .get(id)
            .map(|batch| batch.done.clone());
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.registry.get_job(id).await
    }

    /// Cancel a job that is not finished yet
    ///
    /// A PENDING job is cancelled at once. A PROCESSING job is signalled and
    /// the call returns once its in-flight questions have settled; a job
    /// whose questions were all answered by then ends COMPLETED.
    ///
    /// Settling can take up to the remaining call timeout plus its retry
    /// backoff. The signal is sent before the first wait, so a caller that
    /// must not block can drop the returned future and poll `get_job` or
    /// `wait_for_job` instead.
    pub async fn cancel_job(&self, id: &JobId, reason: &str) -> Result<Job> {
        let job = self.registry.get_job(id).await?;
        if job.is_terminal() {
            return Err(AppError::Conflict(format!(
                "Job {} is already {}",
                id, job.status
            )));
        }

        let done = lock_running(&self.running).get(id).map(|batch| {
            batch.cancel.cancel(reason);
            batch.done.clone()
        });
        let cancelled = StatusUpdate::to(JobStatus::Cancelled)
            .with_error(format!("Job cancelled: {}", reason));

        if job.status == JobStatus::Pending {
            match self.registry.update_job_status(id, cancelled.clone()).await {
                Ok(job) => {
                    info!(job_id = %id, reason = %reason, "Pending job cancelled");
                    return Ok(job);
                }
                // Started meanwhile; the engine sees the signal
                Err(AppError::Conflict(_)) if done.is_some() => {}
                Err(e) => return Err(e),
            }
        }

        match done {
            Some(mut done) => {
                let _ = done.wait_for(|finished| *finished).await;
                let job = self.registry.get_job(id).await?;
                info!(job_id = %id, status = %job.status, "Running job cancelled");
                Ok(job)
            }
            // No local run owns the job, e.g. left PROCESSING by a crashed process
            None => self.registry.update_job_status(id, cancelled).await,
        }
    }

    /// Signal every running batch; returns how many were signalled
    pub fn cancel_all(&self, reason: &str) -> usize {
        let running = lock_running(&self.running);
        for batch in running.values() {
            batch.cancel.cancel(reason);
        }
        running.len()
    }

    /// Structured results of a question-batch job
    pub async fn get_batch_report(&self, id: &JobId) -> Result<BatchReport> {
        let job = self.registry.get_job(id).await?;
        Self::report_of(&job)
    }

    fn report_of(job: &Job) -> Result<BatchReport> {
        if job.job_type != JobType::QuestionBatch {
            return Err(AppError::Validation(format!(
                "Job {} is a {} job, not a question batch",
                job.id, job.job_type
            )));
        }
        let result = job.result.as_ref().ok_or_else(|| {
            AppError::NotFound(format!("Results for job {} ({})", job.id, job.status))
        })?;
        Ok(serde_json::from_value(result.as_value().clone())?)
    }

    /// Render a job's results as JSON or CSV
    pub async fn export_results(&self, id: &JobId, format: ExportFormat) -> Result<String> {
        let job = self.registry.get_job(id).await?;
        let report = Self::report_of(&job)?;
        match format {
            ExportFormat::Json => {
                let export = ResultsExport {
                    export_info: ExportInfo {
                        job_id: &job.id,
                        workspace_id: &job.workspace_id,
                        status: job.status,
                        created_at: format_millis(job.created_at),
                        completed_at: job.completed_at.map(format_millis),
                        exported_at: format_millis(self.registry.now_millis()),
                    },
                    report: &report,
                };
                Ok(serde_json::to_string_pretty(&export)?)
            }
            ExportFormat::Csv => Ok(render_csv(&report)),
        }
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.registry.list_jobs(filter).await
    }

    pub fn running_batches(&self) -> usize {
        self.execution.max_concurrent_jobs - self.job_slots.available_permits()
    }

    pub async fn job_statistics(&self) -> Result<JobStatistics> {
        let mut by_status = BTreeMap::new();
        let mut total_jobs = 0;
        for status in JobStatus::ALL {
            let count = self.registry.count_by_status(status).await?;
            total_jobs += count;
            by_status.insert(status.as_str().to_string(), count);
        }
        let finished: i64 = JobStatus::ALL
            .iter()
            .filter(|status| status.is_terminal())
            .map(|status| by_status[status.as_str()])
            .sum();
        let success_rate = if finished == 0 {
            0.0
        } else {
            100.0 * by_status[JobStatus::Completed.as_str()] as f64 / finished as f64
        };
        let running_batches = self.running_batches();
        let max_concurrent_jobs = self.execution.max_concurrent_jobs;
        Ok(JobStatistics {
            total_jobs,
            by_status,
            success_rate,
            running_batches,
            max_concurrent_jobs,
            utilization: 100.0 * running_batches as f64 / max_concurrent_jobs as f64,
        })
    }

    /// Delete finished jobs older than `days`
    pub async fn cleanup_finished_jobs(&self, days: u32) -> Result<u64> {
        self.registry
            .cleanup_finished(Duration::from_secs(u64::from(days) * 86_400))
            .await
    }

    pub async fn health(&self) -> Result<ServiceHealth> {
        Ok(ServiceHealth {
            degradation: self.degradation.status().await,
            circuit_breakers: self.breakers.all_stats(),
            jobs: self.job_statistics().await?,
        })
    }
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

fn escape_csv(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn render_csv(report: &BatchReport) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for result in &report.results {
        let row = [
            escape_csv(&result.question_id),
            escape_csv(&result.question_text),
            escape_csv(&result.response),
            format!("{:.3}", result.confidence_score),
            format!("{:.3}", result.processing_time),
            escape_csv(&result.fragments_found.join("; ")),
            result.success.to_string(),
            escape_csv(result.error.as_deref().unwrap_or("")),
            result.attempts.to_string(),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}
