// Central Error Type for the Application

use crate::domain::DomainError;
use crate::port::WorkspaceError;
use std::time::Duration;
use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transient external error: {0}")]
    TransientExternal(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Permanent external error: {0}")]
    PermanentExternal(String),

    #[error("Circuit breaker open: {service} (retry after {:.1}s)", .retry_after.as_secs_f64())]
    CircuitOpen {
        service: String,
        retry_after: Duration,
    },

    #[error("Service unavailable: {category} rejected at level {level}")]
    ServiceUnavailable { category: String, level: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Failures worth another attempt after a backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::TransientExternal(_) | AppError::Timeout(_))
    }

    /// Failures that say the dependency or the host is unhealthy as a whole,
    /// not just this one request
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            AppError::CircuitOpen { .. } | AppError::ServiceUnavailable { .. }
        )
    }

    /// Short stable label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::TransientExternal(_) => "transient_external",
            AppError::Timeout(_) => "timeout",
            AppError::PermanentExternal(_) => "permanent_external",
            AppError::CircuitOpen { .. } => "circuit_open",
            AppError::ServiceUnavailable { .. } => "service_unavailable",
            AppError::Database(_) => "database",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Serialization(_) => "serialization",
            AppError::Internal(_) => "internal",
        }
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

impl From<DomainError> for AppError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidStateTransition { .. } => AppError::Conflict(err.to_string()),
            DomainError::JobNotFound(id) => AppError::NotFound(format!("Job {}", id)),
            DomainError::ValidationError(msg) => AppError::Validation(msg),
        }
    }
}

impl From<WorkspaceError> for AppError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::Transient(msg) => AppError::TransientExternal(msg),
            WorkspaceError::Permanent(msg) => AppError::PermanentExternal(msg),
            WorkspaceError::Timeout(msg) => AppError::Timeout(msg),
        }
    }
}

// Note: sqlx::Error conversion is handled in infra-sqlite crate
// by converting to AppError::Database(String)
