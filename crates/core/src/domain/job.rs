// Job Domain Model

use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Job ID (UUID v4)
pub type JobId = String;

/// Job lifecycle status
///
/// PENDING is the only initial status. COMPLETED, FAILED and CANCELLED are
/// terminal: a job in one of them never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `next` is a legal edge of the lifecycle graph from `self`
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::ValidationError(format!("Unknown job status: {}", s)))
    }
}

/// Job Type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    DocumentIngestion,
    QuestionBatch,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::DocumentIngestion => "document_ingestion",
            JobType::QuestionBatch => "question_batch",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "document_ingestion" => Ok(JobType::DocumentIngestion),
            "question_batch" => Ok(JobType::QuestionBatch),
            other => Err(DomainError::ValidationError(format!(
                "Unknown job type: {}",
                other
            ))),
        }
    }
}

/// Job Result (JSON serializable)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult(serde_json::Value);

impl JobResult {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

/// A requested status change together with the payload it carries
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl StatusUpdate {
    pub fn to(status: JobStatus) -> Self {
        Self {
            status,
            result: None,
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_result(mut self, result: JobResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Job Entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub workspace_id: String,

    pub created_at: i64, // epoch ms
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,

    /// Percentage in [0, 100]
    pub progress: f64,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl Job {
    /// Create a new PENDING job
    ///
    /// # Arguments
    ///
    /// * `id` - Unique job ID (injected, not generated)
    /// * `created_at` - Creation timestamp in epoch ms (injected, not system time)
    /// * `job_type` - Job type
    /// * `workspace_id` - Workspace the job runs against
    pub fn new(
        id: impl Into<String>,
        created_at: i64,
        job_type: JobType,
        workspace_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            job_type,
            status: JobStatus::Pending,
            workspace_id: workspace_id.into(),
            created_at,
            updated_at: created_at,
            started_at: None,
            completed_at: None,
            progress: 0.0,
            result: None,
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Create a test job with deterministic ID and timestamp.
    ///
    /// Uses a simple counter for deterministic test IDs (test-1, test-2, ...).
    /// Timestamps start at 1000 and increment by 1000.
    ///
    /// **Note**: This method should only be used in tests. For production code,
    /// always inject ID and time via providers.
    pub fn new_test(job_type: JobType, workspace_id: impl Into<String>) -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static TEST_COUNTER: AtomicU64 = AtomicU64::new(1);

        let counter = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let id = format!("test-{}", counter);
        let created_at = (counter * 1000) as i64;

        Self::new(id, created_at, job_type, workspace_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status change with explicit timestamp
    ///
    /// Entering PROCESSING records `started_at`; entering a terminal status
    /// records `completed_at`, and COMPLETED pins progress at 100.
    pub fn apply(&mut self, update: StatusUpdate, now_millis: i64) -> Result<()> {
        if !self.status.can_transition_to(update.status) {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: update.status.to_string(),
            });
        }
        if update.error.is_some()
            && !matches!(update.status, JobStatus::Failed | JobStatus::Cancelled)
        {
            return Err(DomainError::ValidationError(format!(
                "An error message cannot accompany a transition to {}",
                update.status
            )));
        }
        if update.result.is_some() && !update.status.is_terminal() {
            return Err(DomainError::ValidationError(format!(
                "A result cannot accompany a transition to {}",
                update.status
            )));
        }

        self.status = update.status;
        self.updated_at = now_millis;
        match update.status {
            JobStatus::Processing => self.started_at = Some(now_millis),
            JobStatus::Completed => {
                self.completed_at = Some(now_millis);
                self.progress = 100.0;
            }
            JobStatus::Failed | JobStatus::Cancelled => self.completed_at = Some(now_millis),
            JobStatus::Pending => {}
        }
        if update.result.is_some() {
            self.result = update.result;
        }
        if update.error.is_some() {
            self.error = update.error;
        }
        self.metadata.extend(update.metadata);
        Ok(())
    }

    /// Advance progress while PROCESSING
    ///
    /// The value is clamped to [0, 100] and never moves backwards. Returns
    /// whether the stored progress changed.
    pub fn advance_progress(&mut self, progress: f64, now_millis: i64) -> Result<bool> {
        if self.status != JobStatus::Processing {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: "PROGRESS".to_string(),
            });
        }
        let clamped = progress.clamp(0.0, 100.0);
        if clamped <= self.progress {
            return Ok(false);
        }
        self.progress = clamped;
        self.updated_at = now_millis;
        Ok(true)
    }

    /// Wall time between start and completion, when both are known
    pub fn duration_millis(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).max(0)),
            _ => None,
        }
    }
}
