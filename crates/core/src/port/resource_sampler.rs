// Resource sampling port (load indicators for degradation control)
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Point-in-time resource usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub active_connections: u64,
}

/// Resource sampler port
#[async_trait]
pub trait ResourceSampler: Send + Sync {
    /// Get current resource usage
    ///
    /// # Example
    /// ```text
    /// let usage = sampler.current_usage().await;
    /// if usage.cpu_percent >= 85.0 {
    ///     println!("CPU critical");
    /// }
    /// ```
    async fn current_usage(&self) -> ResourceUsage;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Mock ResourceSampler for testing
    pub struct MockResourceSampler {
        usage: Arc<Mutex<ResourceUsage>>,
        samples: AtomicUsize,
    }

    impl MockResourceSampler {
        pub fn new(usage: ResourceUsage) -> Self {
            Self {
                usage: Arc::new(Mutex::new(usage)),
                samples: AtomicUsize::new(0),
            }
        }

        /// A quiet host: every resource well below its warning threshold
        pub fn idle() -> Self {
            Self::new(ResourceUsage {
                cpu_percent: 10.0,
                memory_percent: 20.0,
                disk_percent: 30.0,
                active_connections: 1,
            })
        }

        pub fn set_usage(&self, usage: ResourceUsage) {
            *self.usage.lock().unwrap() = usage;
        }

        pub fn set_cpu(&self, cpu_percent: f64) {
            self.usage.lock().unwrap().cpu_percent = cpu_percent;
        }

        pub fn sample_count(&self) -> usize {
            self.samples.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResourceSampler for MockResourceSampler {
        async fn current_usage(&self) -> ResourceUsage {
            self.samples.fetch_add(1, Ordering::SeqCst);
            *self.usage.lock().unwrap()
        }
    }
}
