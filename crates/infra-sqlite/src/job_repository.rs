// SQLite JobRepository Implementation

use async_trait::async_trait;
use docqa_core::domain::{Job, JobId, JobResult, JobStatus, JobType};
use docqa_core::error::{AppError, Result};
use docqa_core::port::{JobFilter, JobRepository};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::debug;

// Helper to convert sqlx::Error to AppError with structured information
fn map_sqlx_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                let code_str = code.as_ref();

                // SQLite error codes: https://www.sqlite.org/rescode.html
                match code_str {
                    "2067" | "1555" => AppError::Database(format!(
                        "Unique constraint violation: {} ({})",
                        db_err.message(),
                        code_str
                    )),
                    "5" => AppError::Database(format!(
                        "Database locked (SQLITE_BUSY): {}",
                        db_err.message()
                    )),
                    "13" => AppError::Database(format!("Database full: {}", db_err.message())),
                    _ => AppError::Database(format!(
                        "Database error [{}]: {}",
                        code_str,
                        db_err.message()
                    )),
                }
            } else {
                AppError::Database(format!("Database error: {}", db_err.message()))
            }
        }
        sqlx::Error::RowNotFound => AppError::Database("Row not found".to_string()),
        sqlx::Error::ColumnNotFound(col) => {
            AppError::Database(format!("Column not found: {}", col))
        }
        _ => AppError::Database(err.to_string()),
    }
}

fn corrupt(id: &str, what: &str, detail: impl std::fmt::Display) -> AppError {
    AppError::Database(format!("Corrupt job row {}: {} ({})", id, what, detail))
}

const TERMINAL_STATUSES: &str = "('COMPLETED', 'FAILED', 'CANCELLED')";

pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn insert(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, job_type, status, workspace_id,
                created_at, updated_at, started_at, completed_at,
                progress, result, error, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(&job.workspace_id)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.progress)
        .bind(job.result.as_ref().map(|r| r.as_value().to_string()))
        .bind(&job.error)
        .bind(serde_json::to_string(&job.metadata)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = ?, updated_at = ?, started_at = ?, completed_at = ?,
                progress = ?, result = ?, error = ?, metadata = ?
            WHERE id = ?
              AND status NOT IN {}
            "#,
            TERMINAL_STATUSES
        );
        let result = sqlx::query(&sql)
            .bind(job.status.as_str())
            .bind(job.updated_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .bind(job.progress)
            .bind(job.result.as_ref().map(|r| r.as_value().to_string()))
            .bind(&job.error)
            .bind(serde_json::to_string(&job.metadata)?)
            .bind(&job.id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
                    .bind(&job.id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(map_sqlx_error)?;

            match current {
                None => Err(AppError::NotFound(format!("Job {} not found", job.id))),
                Some(status) => Err(AppError::Conflict(format!(
                    "Job {} is already {}",
                    job.id, status
                ))),
            }
        } else {
            Ok(())
        }
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM jobs WHERE 1 = 1");
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(job_type) = filter.job_type {
            query.push(" AND job_type = ").push_bind(job_type.as_str());
        }
        if let Some(workspace_id) = &filter.workspace_id {
            query.push(" AND workspace_id = ").push_bind(workspace_id.clone());
        }
        query.push(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows: Vec<JobRow> = query
            .build_query_as::<JobRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(count)
    }

    async fn delete_finished_before(&self, cutoff_millis: i64) -> Result<u64> {
        let sql = format!(
            "DELETE FROM jobs WHERE status IN {} AND completed_at IS NOT NULL AND completed_at < ?",
            TERMINAL_STATUSES
        );
        let result = sqlx::query(&sql)
            .bind(cutoff_millis)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        debug!(deleted = result.rows_affected(), cutoff_millis, "Deleted finished jobs");
        Ok(result.rows_affected())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    job_type: String,
    status: String,
    workspace_id: String,
    created_at: i64,
    updated_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    progress: f64,
    result: Option<String>,
    error: Option<String>,
    metadata: String,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| corrupt(&self.id, "status", e))?;
        let job_type = JobType::from_str(&self.job_type)
            .map_err(|e| corrupt(&self.id, "job_type", e))?;
        let result = match &self.result {
            Some(raw) => Some(JobResult::new(
                serde_json::from_str(raw).map_err(|e| corrupt(&self.id, "result", e))?,
            )),
            None => None,
        };
        let metadata: BTreeMap<String, String> = serde_json::from_str(&self.metadata)
            .map_err(|e| corrupt(&self.id, "metadata", e))?;

        Ok(Job {
            id: self.id,
            job_type,
            status,
            workspace_id: self.workspace_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            progress: self.progress,
            result,
            error: self.error,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use docqa_core::domain::StatusUpdate;
    use tokio_test::{assert_err, assert_ok};

    async fn setup_repo() -> SqliteJobRepository {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteJobRepository::new(pool)
    }

    fn job(id: &str, created_at: i64, workspace: &str) -> Job {
        let mut job = Job::new(id, created_at, JobType::QuestionBatch, workspace);
        job.metadata.insert("question_count".to_string(), "3".to_string());
        job
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let repo = setup_repo().await;
        let job = job("job-1", 1_000, "ws-a");
        repo.insert(&job).await.unwrap();

        let found = repo.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(found.id, "job-1");
        assert_eq!(found.status, JobStatus::Pending);
        assert_eq!(found.job_type, JobType::QuestionBatch);
        assert_eq!(found.metadata.get("question_count").map(String::as_str), Some("3"));
        assert!(found.result.is_none());

        assert!(repo.find_by_id(&"missing".to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_fails() {
        let repo = setup_repo().await;
        let job = job("job-1", 1_000, "ws-a");
        assert_ok!(repo.insert(&job).await);

        let err = assert_err!(repo.insert(&job).await);
        assert!(err.to_string().contains("Unique constraint"), "{}", err);
    }

    #[tokio::test]
    async fn test_update_round_trips_result() {
        let repo = setup_repo().await;
        let mut job = job("job-1", 1_000, "ws-a");
        repo.insert(&job).await.unwrap();

        job.apply(StatusUpdate::to(JobStatus::Processing), 2_000).unwrap();
        job.advance_progress(40.0, 2_500).unwrap();
        repo.update(&job).await.unwrap();

        job.apply(
            StatusUpdate::to(JobStatus::Completed)
                .with_result(JobResult::new(serde_json::json!({"total_questions": 3}))),
            3_000,
        )
        .unwrap();
        repo.update(&job).await.unwrap();

        let stored = repo.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.started_at, Some(2_000));
        assert_eq!(stored.completed_at, Some(3_000));
        assert_eq!(stored.progress, 100.0);
        assert_eq!(
            stored.result.unwrap().as_value()["total_questions"],
            serde_json::json!(3)
        );
    }

    #[tokio::test]
    async fn test_terminal_rows_are_not_overwritten() {
        let repo = setup_repo().await;
        let mut job = job("job-1", 1_000, "ws-a");
        repo.insert(&job).await.unwrap();

        let mut cancelled = job.clone();
        cancelled
            .apply(StatusUpdate::to(JobStatus::Cancelled).with_error("Job cancelled: test"), 1_500)
            .unwrap();
        repo.update(&cancelled).await.unwrap();

        job.apply(StatusUpdate::to(JobStatus::Processing), 2_000).unwrap();
        let err = repo.update(&job).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(ref msg) if msg.contains("CANCELLED")));

        let missing = Job::new("ghost", 1, JobType::QuestionBatch, "ws");
        assert!(matches!(repo.update(&missing).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_filters_and_orders_newest_first() {
        let repo = setup_repo().await;
        repo.insert(&job("job-1", 1_000, "ws-a")).await.unwrap();
        repo.insert(&job("job-2", 2_000, "ws-b")).await.unwrap();
        repo.insert(&job("job-3", 3_000, "ws-a")).await.unwrap();
        let mut ingestion = Job::new("job-4", 4_000, JobType::DocumentIngestion, "ws-a");
        ingestion
            .apply(StatusUpdate::to(JobStatus::Processing), 4_100)
            .unwrap();
        repo.insert(&ingestion).await.unwrap();

        let all = repo.list(&JobFilter::default()).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["job-4", "job-3", "job-2", "job-1"]);

        let filter = JobFilter {
            workspace_id: Some("ws-a".to_string()),
            job_type: Some(JobType::QuestionBatch),
            limit: Some(1),
            ..Default::default()
        };
        let ids: Vec<String> = repo.list(&filter).await.unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["job-3".to_string()]);

        let processing = JobFilter {
            status: Some(JobStatus::Processing),
            ..Default::default()
        };
        assert_eq!(repo.list(&processing).await.unwrap().len(), 1);
        assert_eq!(repo.count_by_status(JobStatus::Pending).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_delete_finished_before_keeps_active_jobs() {
        let repo = setup_repo().await;
        let mut old = job("old", 1_000, "ws");
        repo.insert(&old).await.unwrap();
        old.apply(StatusUpdate::to(JobStatus::Cancelled), 2_000).unwrap();
        repo.update(&old).await.unwrap();

        let mut recent = job("recent", 1_000, "ws");
        repo.insert(&recent).await.unwrap();
        recent.apply(StatusUpdate::to(JobStatus::Cancelled), 9_000).unwrap();
        repo.update(&recent).await.unwrap();

        repo.insert(&job("pending", 500, "ws")).await.unwrap();

        assert_eq!(repo.delete_finished_before(5_000).await.unwrap(), 1);
        assert!(repo.find_by_id(&"old".to_string()).await.unwrap().is_none());
        assert!(repo.find_by_id(&"recent".to_string()).await.unwrap().is_some());
        assert!(repo.find_by_id(&"pending".to_string()).await.unwrap().is_some());
    }
}
