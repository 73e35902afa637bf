// Degradation Controller - admission control under resource pressure

use crate::error::{AppError, Result};
use crate::port::{ResourceSampler, ResourceUsage};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Service level, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DegradationLevel {
    Full,
    Degraded,
    Minimal,
    /// Entered manually only
    Maintenance,
}

impl DegradationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationLevel::Full => "FULL",
            DegradationLevel::Degraded => "DEGRADED",
            DegradationLevel::Minimal => "MINIMAL",
            DegradationLevel::Maintenance => "MAINTENANCE",
        }
    }
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work asking for admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationCategory {
    /// A new question batch with the requested worker count
    NewBatch { concurrency: usize },
    DocumentIngestion,
    /// One more unit of an already running batch
    BatchUnit,
}

impl OperationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationCategory::NewBatch { .. } => "new_batch",
            OperationCategory::DocumentIngestion => "document_ingestion",
            OperationCategory::BatchUnit => "batch_unit",
        }
    }
}

impl std::fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationCategory::NewBatch { concurrency } => {
                write!(f, "new_batch(concurrency={})", concurrency)
            }
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
}

impl Threshold {
    pub const fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }

    pub fn level_for(&self, value: f64) -> DegradationLevel {
        if value >= self.critical {
            DegradationLevel::Minimal
        } else if value >= self.warning {
            DegradationLevel::Degraded
        } else {
            DegradationLevel::Full
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    pub cpu: Threshold,
    pub memory: Threshold,
    pub disk: Threshold,
    pub connections: Threshold,
    /// Largest batch concurrency admitted while DEGRADED
    pub degraded_max_concurrency: usize,
    /// How long a resource sample stays valid
    pub sample_interval_ms: u64,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            cpu: Threshold::new(70.0, 85.0),
            memory: Threshold::new(70.0, 85.0),
            disk: Threshold::new(80.0, 90.0),
            connections: Threshold::new(100.0, 200.0),
            degraded_max_concurrency: 3,
            sample_interval_ms: 30_000,
        }
    }
}

impl DegradationConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, threshold) in [
            ("cpu", self.cpu),
            ("memory", self.memory),
            ("disk", self.disk),
            ("connections", self.connections),
        ] {
            if threshold.warning <= 0.0 || threshold.warning >= threshold.critical {
                return Err(AppError::Config(format!(
                    "degradation.{}: warning ({}) must be positive and below critical ({})",
                    name, threshold.warning, threshold.critical
                )));
            }
        }
        if self.degraded_max_concurrency == 0 {
            return Err(AppError::Config(
                "degradation.degraded_max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Most severe level across all resources
    pub fn level_for(&self, usage: &ResourceUsage) -> DegradationLevel {
        [
            self.cpu.level_for(usage.cpu_percent),
            self.memory.level_for(usage.memory_percent),
            self.disk.level_for(usage.disk_percent),
            self.connections.level_for(usage.active_connections as f64),
        ]
        .into_iter()
        .max()
        .unwrap_or(DegradationLevel::Full)
    }

    /// Static admission table
    pub fn admits(&self, level: DegradationLevel, category: OperationCategory) -> bool {
        match (level, category) {
            (DegradationLevel::Full, _) => true,
            (DegradationLevel::Degraded, OperationCategory::NewBatch { concurrency }) => {
                concurrency <= self.degraded_max_concurrency
            }
            (DegradationLevel::Degraded, _) => true,
            (DegradationLevel::Minimal, OperationCategory::BatchUnit) => true,
            (DegradationLevel::Minimal, _) => false,
            (DegradationLevel::Maintenance, _) => false,
        }
    }
}

/// Controller state for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct DegradationStatus {
    pub level: DegradationLevel,
    pub maintenance_mode: bool,
    pub usage: Option<ResourceUsage>,
    pub config: DegradationConfig,
}

struct Snapshot {
    level: DegradationLevel,
    usage: Option<ResourceUsage>,
    sampled_at: Option<Instant>,
}

/// Maps resource usage to a service level and gates new work on it
pub struct DegradationController {
    sampler: Arc<dyn ResourceSampler>,
    config: DegradationConfig,
    maintenance: AtomicBool,
    snapshot: Mutex<Snapshot>,
}

impl DegradationController {
    pub fn new(sampler: Arc<dyn ResourceSampler>, config: DegradationConfig) -> Self {
        Self {
            sampler,
            config,
            maintenance: AtomicBool::new(false),
            snapshot: Mutex::new(Snapshot {
                level: DegradationLevel::Full,
                usage: None,
                sampled_at: None,
            }),
        }
    }

    pub fn config(&self) -> &DegradationConfig {
        &self.config
    }

    /// Read the sampler now and recompute the level
    pub async fn sample(&self) -> DegradationLevel {
        let mut snapshot = self.snapshot.lock().await;
        self.refresh(&mut snapshot).await
    }

    async fn refresh(&self, snapshot: &mut Snapshot) -> DegradationLevel {
        let usage = self.sampler.current_usage().await;
        let level = self.config.level_for(&usage);

        if level != snapshot.level {
            warn!(
                from = %snapshot.level,
                to = %level,
                cpu = usage.cpu_percent,
                memory = usage.memory_percent,
                disk = usage.disk_percent,
                connections = usage.active_connections,
                "Degradation level changed"
            );
        } else {
            debug!(level = %level, cpu = usage.cpu_percent, "Resource sample taken");
        }
        metrics::gauge!("degradation_level").set(level as u8 as f64);

        snapshot.level = level;
        snapshot.usage = Some(usage);
        snapshot.sampled_at = Some(Instant::now());
        level
    }

    /// Effective level, resampling when the cached sample is stale
    pub async fn current_level(&self) -> DegradationLevel {
        if self.maintenance.load(Ordering::SeqCst) {
            return DegradationLevel::Maintenance;
        }
        let mut snapshot = self.snapshot.lock().await;
        let interval = Duration::from_millis(self.config.sample_interval_ms);
        match snapshot.sampled_at {
            Some(at) if at.elapsed() < interval => snapshot.level,
            _ => self.refresh(&mut snapshot).await,
        }
    }

    /// Fail with `ServiceUnavailable` if `category` is not admitted at the current level
    pub async fn check_availability(&self, category: OperationCategory) -> Result<()> {
        let level = self.current_level().await;
        if self.config.admits(level, category) {
            return Ok(());
        }
        debug!(category = %category, level = %level, "Operation rejected by degradation controller");
        metrics::counter!(
            "degradation_rejections_total",
            "category" => category.as_str(),
            "level" => level.as_str()
        )
        .increment(1);
        Err(AppError::ServiceUnavailable {
            category: category.to_string(),
            level: level.to_string(),
        })
    }

    pub fn set_maintenance_mode(&self, enabled: bool) {
        let previous = self.maintenance.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!(enabled, "Maintenance mode changed");
        }
    }

    pub fn is_maintenance_mode(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> DegradationStatus {
        let level = self.current_level().await;
        let usage = self.snapshot.lock().await.usage;
        DegradationStatus {
            level,
            maintenance_mode: self.is_maintenance_mode(),
            usage,
            config: self.config.clone(),
        }
    }
}
