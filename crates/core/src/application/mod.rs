// Application Layer - Use Cases and Job Orchestration

pub mod cancellation;
pub mod circuit_breaker;
pub mod confidence;
pub mod config;
pub mod degradation;
pub mod engine;
pub mod gateway;
pub mod job_registry;
pub mod question_service;
pub mod retry;

// Re-exports
pub use cancellation::{cancellation_channel, CancellationHandle, CancellationToken};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
    CircuitState, WORKSPACE_SERVICE,
};
pub use confidence::{ConfidenceScorer, Score};
pub use config::{EngineConfig, ExecutionConfig, ScoringConfig};
pub use degradation::{
    DegradationConfig, DegradationController, DegradationLevel, DegradationStatus,
    OperationCategory, Threshold,
};
pub use engine::{BatchRequest, QuestionExecutionEngine};
pub use gateway::{ExternalGateway, GatewayFailure, GatewayReply};
pub use job_registry::JobRegistry;
pub use question_service::{
    ExportFormat, JobStatistics, QuestionBatchService, ServiceDeps, ServiceHealth,
};
pub use retry::{RetryConfig, RetryDecision, RetryOutcome, RetryPolicy};
