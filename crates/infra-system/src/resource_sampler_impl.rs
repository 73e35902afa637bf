// Resource sampler implementation
// reason: sysinfo for cross-platform system monitoring
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use sysinfo::{Disks, System};
use tracing::debug;

use docqa_core::port::{ResourceSampler, ResourceUsage};

/// CPU readings kept for smoothing
const CPU_WINDOW: usize = 5;

/// Rolling average of recent CPU readings
///
/// A single sysinfo reading swings widely; degradation decisions use the
/// mean of the last few.
struct CpuWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl CpuWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn record(&mut self, cpu_percent: f64) -> f64 {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(cpu_percent);
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * used as f64 / total as f64
    }
}

/// Resource sampler backed by sysinfo
///
/// Active connections are not visible to sysinfo; callers share a counter
/// that the outbound client keeps current.
pub struct SysinfoResourceSampler {
    system: Mutex<System>,
    cpu_window: Mutex<CpuWindow>,
    connections: Arc<AtomicU64>,
}

impl SysinfoResourceSampler {
    pub fn new() -> Self {
        Self::with_connection_counter(Arc::new(AtomicU64::new(0)))
    }

    pub fn with_connection_counter(connections: Arc<AtomicU64>) -> Self {
        let mut system = System::new();
        // First CPU reading is only meaningful relative to an earlier refresh
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
            cpu_window: Mutex::new(CpuWindow::new(CPU_WINDOW)),
            connections,
        }
    }

    pub fn connection_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.connections)
    }

    fn disk_percent() -> f64 {
        let disks = Disks::new_with_refreshed_list();
        disks.first().map_or(0.0, |disk| {
            let total = disk.total_space();
            percent(total.saturating_sub(disk.available_space()), total)
        })
    }
}

impl Default for SysinfoResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceSampler for SysinfoResourceSampler {
    async fn current_usage(&self) -> ResourceUsage {
        let (raw_cpu, memory_percent) = {
            let mut sys = self
                .system
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sys.refresh_cpu();
            sys.refresh_memory();
            (
                f64::from(sys.global_cpu_info().cpu_usage()),
                percent(sys.used_memory(), sys.total_memory()),
            )
        };
        let cpu_percent = self
            .cpu_window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record(raw_cpu);

        let usage = ResourceUsage {
            cpu_percent,
            memory_percent,
            disk_percent: Self::disk_percent(),
            active_connections: self.connections.load(Ordering::Relaxed),
        };

        debug!(
            cpu = usage.cpu_percent,
            raw_cpu,
            memory = usage.memory_percent,
            disk = usage.disk_percent,
            connections = usage.active_connections,
            "Resource usage sampled"
        );
        usage
    }
}
