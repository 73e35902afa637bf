// Port Layer - Interfaces for external dependencies

pub mod id_provider; // For deterministic testing
pub mod job_repository;
pub mod resource_sampler;
pub mod time_provider;
pub mod workspace_client;

// Re-exports
pub use id_provider::IdProvider;
pub use job_repository::{JobFilter, JobRepository};
pub use resource_sampler::{ResourceSampler, ResourceUsage};
pub use time_provider::TimeProvider;
pub use workspace_client::{ConversationHandle, WorkspaceClient, WorkspaceError};
