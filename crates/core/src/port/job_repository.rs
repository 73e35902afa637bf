// Job Repository Port (Interface)

use crate::domain::{Job, JobId, JobStatus, JobType};
use crate::error::Result;
use async_trait::async_trait;

/// Selection criteria for listing jobs
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub workspace_id: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.job_type.map_or(true, |t| job.job_type == t)
            && self
                .workspace_id
                .as_deref()
                .map_or(true, |w| job.workspace_id == w)
    }
}

/// Repository interface for Job persistence
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new job
    async fn insert(&self, job: &Job) -> Result<()>;

    /// Find job by ID
    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>>;

    /// Persist a job
    ///
    /// Rows already in a terminal status are never overwritten: the call
    /// fails with `Conflict` (or `NotFound` if the row does not exist).
    async fn update(&self, job: &Job) -> Result<()>;

    /// List jobs matching the filter, newest first
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Count jobs by status
    async fn count_by_status(&self, status: JobStatus) -> Result<i64>;

    /// Delete terminal jobs completed before `cutoff_millis`
    async fn delete_finished_before(&self, cutoff_millis: i64) -> Result<u64>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory JobRepository with the same conditional-update semantics
    /// as the SQLite adapter
    #[derive(Default)]
    pub struct InMemoryJobRepository {
        jobs: Mutex<HashMap<JobId, Job>>,
    }

    impl InMemoryJobRepository {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn len(&self) -> usize {
            self.jobs.lock().unwrap().len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    #[async_trait]
    impl JobRepository for InMemoryJobRepository {
        async fn insert(&self, job: &Job) -> Result<()> {
            let mut jobs = self.jobs.lock().unwrap();
            if jobs.contains_key(&job.id) {
                return Err(AppError::Database(format!(
                    "Unique constraint violation: job {}",
                    job.id
                )));
            }
            jobs.insert(job.id.clone(), job.clone());
            Ok(())
        }

        async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>> {
            Ok(self.jobs.lock().unwrap().get(id).cloned())
        }

        async fn update(&self, job: &Job) -> Result<()> {
            let mut jobs = self.jobs.lock().unwrap();
            match jobs.get_mut(&job.id) {
                None => Err(AppError::NotFound(format!("Job {} not found", job.id))),
                Some(stored) if stored.is_terminal() => Err(AppError::Conflict(format!(
                    "Job {} is already {}",
                    job.id, stored.status
                ))),
                Some(stored) => {
                    *stored = job.clone();
                    Ok(())
                }
            }
        }

        async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
            let jobs = self.jobs.lock().unwrap();
            let mut matching: Vec<Job> = jobs
                .values()
                .filter(|job| filter.matches(job))
                .cloned()
                .collect();
            matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            if let Some(limit) = filter.limit {
                matching.truncate(limit);
            }
            Ok(matching)
        }

        async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
            let jobs = self.jobs.lock().unwrap();
            Ok(jobs.values().filter(|job| job.status == status).count() as i64)
        }

        async fn delete_finished_before(&self, cutoff_millis: i64) -> Result<u64> {
            let mut jobs = self.jobs.lock().unwrap();
            let before = jobs.len();
            jobs.retain(|_, job| {
                !(job.is_terminal() && job.completed_at.map_or(false, |t| t < cutoff_millis))
            });
            Ok((before - jobs.len()) as u64)
        }
    }
}
