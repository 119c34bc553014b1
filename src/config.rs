use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::allocator::{ResourceRequest, StrategyKind};

/// Queue dispatch limits.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of jobs in `processing` at once.
    pub max_concurrent: usize,
    /// Priority given to jobs submitted without one.
    pub default_priority: i32,
    /// Non-terminal jobs accepted before `add_job` starts refusing.
    pub max_jobs: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            default_priority: 1,
            max_jobs: 10_000,
        }
    }
}

/// A batch of workers sharing the same job-type affinity.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CapabilityGroup {
    pub capabilities: Vec<String>,
    pub count: usize,
}

impl CapabilityGroup {
    pub fn new<I, S>(capabilities: I, count: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Initial roster.
    pub groups: Vec<CapabilityGroup>,
    /// Capabilities given to workers created by scale-up.
    pub scale_capabilities: Vec<String>,
    pub heartbeat_interval_ms: u64,
    /// A busy worker silent for longer than this is considered stuck.
    pub heartbeat_timeout_ms: u64,
    /// How long a stuck worker stays in `error` before it is reset.
    pub error_cooldown_ms: u64,
}

impl PoolConfig {
    /// Watchdog period, at least 1ms.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_millis(self.error_cooldown_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            groups: vec![
                CapabilityGroup::new(["*"], 2),
                CapabilityGroup::new(["analysis"], 1),
                CapabilityGroup::new(["validation"], 1),
                CapabilityGroup::new(["packaging"], 1),
            ],
            scale_capabilities: vec!["*".to_string()],
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 300_000,
            error_cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    pub check_interval_ms: u64,
    pub min_workers: usize,
    pub max_workers: usize,
    pub strategy: StrategyKind,
    /// Provisional grant reserved for every processing job.
    pub job_resources: ResourceRequest,
}

impl AllocatorConfig {
    /// Sampling period, at least 1ms.
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            min_workers: 1,
            max_workers: 10,
            strategy: StrategyKind::Adaptive,
            job_resources: ResourceRequest::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub file_path: PathBuf,
    /// Bursts of mutations inside this window collapse into one write.
    pub debounce_ms: u64,
}

impl PersistenceConfig {
    pub fn at(file_path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            file_path: file_path.into(),
            ..Default::default()
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file_path: PathBuf::from("data/queue.json"),
            debounce_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub queue: QueueConfig,
    pub pool: PoolConfig,
    pub allocator: AllocatorConfig,
    pub persistence: PersistenceConfig,
}

impl OrchestratorConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
