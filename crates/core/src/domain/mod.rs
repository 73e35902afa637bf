// Domain Layer - Pure business logic and entities

pub mod error;
pub mod job;
pub mod question;

// Re-exports
pub use error::DomainError;
pub use job::{Job, JobId, JobResult, JobStatus, JobType, StatusUpdate};
pub use question::{BatchReport, BatchSummary, ConfidenceDistribution, Question, QuestionResult};
