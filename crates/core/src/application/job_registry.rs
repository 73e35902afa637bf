// Job Registry - authoritative job state and lifecycle

use crate::domain::{Job, JobId, JobStatus, JobType, StatusUpdate};
use crate::error::{AppError, Result};
use crate::port::{IdProvider, JobFilter, JobRepository, TimeProvider};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct UnitCounter {
    total: usize,
    completed: usize,
}

/// Serializes every mutation of a job through a per-job lock
///
/// Progress is derived from a completed-unit count kept here, never from a
/// value supplied by the caller.
pub struct JobRegistry {
    repo: Arc<dyn JobRepository>,
    time_provider: Arc<dyn TimeProvider>,
    id_provider: Arc<dyn IdProvider>,
    slots: std::sync::Mutex<HashMap<JobId, Arc<Mutex<UnitCounter>>>>,
}

impl JobRegistry {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        time_provider: Arc<dyn TimeProvider>,
        id_provider: Arc<dyn IdProvider>,
    ) -> Self {
        Self {
            repo,
            time_provider,
            id_provider,
            slots: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn now_millis(&self) -> i64 {
        self.time_provider.now_millis()
    }

    fn slot(&self, id: &JobId) -> Arc<Mutex<UnitCounter>> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(slots.entry(id.clone()).or_default())
    }

    fn release(&self, id: &JobId) {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    async fn load(&self, id: &JobId) -> Result<Job> {
        self.repo
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {}", id)))
    }

    /// Create and persist a PENDING job
    pub async fn create_job(
        &self,
        job_type: JobType,
        workspace_id: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<Job> {
        let mut job = Job::new(
            self.id_provider.generate_id(),
            self.time_provider.now_millis(),
            job_type,
            workspace_id,
        );
        job.metadata = metadata;
        self.repo.insert(&job).await?;

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            workspace_id = %job.workspace_id,
            "Job created"
        );
        Ok(job)
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Job> {
        self.load(id).await
    }

    /// Single entry point for status changes
    ///
    /// Fails with `Conflict` for any edge outside the lifecycle graph.
    pub async fn update_job_status(&self, id: &JobId, update: StatusUpdate) -> Result<Job> {
        let slot = self.slot(id);
        let _guard = slot.lock().await;
        self.apply(id, update).await
    }

    /// Drop the lock slot of a job that no longer exists or is finished
    async fn release_if_settled(&self, id: &JobId) {
        match self.repo.find_by_id(id).await {
            Ok(None) => self.release(id),
            Ok(Some(job)) if job.is_terminal() => self.release(id),
            _ => {}
        }
    }

    async fn apply(&self, id: &JobId, update: StatusUpdate) -> Result<Job> {
        let mut job = match self.load(id).await {
            Ok(job) => job,
            Err(e) => {
                if matches!(e, AppError::NotFound(_)) {
                    self.release(id);
                }
                return Err(e);
            }
        };
        let from = job.status;
        if let Err(e) = job.apply(update, self.time_provider.now_millis()) {
            if job.is_terminal() {
                self.release(id);
            }
            return Err(e.into());
        }
        self.repo.update(&job).await?;

        info!(
            job_id = %job.id,
            from = %from,
            to = %job.status,
            progress = job.progress,
            "Job status changed"
        );
        if job.is_terminal() {
            self.release(id);
        }
        Ok(job)
    }

    /// Move a job to PROCESSING and register how many units it has
    pub async fn start_job(&self, id: &JobId, total_units: usize) -> Result<Job> {
        let slot = self.slot(id);
        let mut counter = slot.lock().await;
        let job = self
            .apply(
                id,
                StatusUpdate::to(JobStatus::Processing)
                    .with_metadata("total_units", total_units.to_string()),
            )
            .await?;
        counter.total = total_units;
        counter.completed = 0;
        Ok(job)
    }

    /// Record one finished unit and persist the derived progress
    ///
    /// Returns the progress after the increment.
    pub async fn complete_unit(&self, id: &JobId) -> Result<f64> {
        let slot = self.slot(id);
        let mut counter = slot.lock().await;
        if counter.total == 0 {
            self.release_if_settled(id).await;
            return Err(AppError::Conflict(format!(
                "Job {} has no registered units",
                id
            )));
        }
        counter.completed = (counter.completed + 1).min(counter.total);
        let progress = 100.0 * counter.completed as f64 / counter.total as f64;

        let mut job = self.load(id).await?;
        if job.advance_progress(progress, self.time_provider.now_millis())? {
            self.repo.update(&job).await?;
        }
        debug!(
            job_id = %id,
            completed = counter.completed,
            total = counter.total,
            progress = job.progress,
            "Unit completed"
        );
        Ok(job.progress)
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.repo.list(filter).await
    }

    pub async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
        self.repo.count_by_status(status).await
    }

    /// Delete terminal jobs that completed more than `older_than` ago
    pub async fn cleanup_finished(&self, older_than: Duration) -> Result<u64> {
        let cutoff = self.time_provider.now_millis() - older_than.as_millis() as i64;
        let removed = self.repo.delete_finished_before(cutoff).await?;
        info!(removed, cutoff_ms = cutoff, "Finished jobs cleaned up");
        Ok(removed)
    }
}
