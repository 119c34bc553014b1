//! Resource sampling and worker-count decisions.
//!
//! Each tick the sampler measures what the host has left, the active
//! [`AllocationStrategy`] turns that and the queue backlog into a worker
//! count, and the result is clamped to the configured bounds before the pool
//! is resized. The allocator also keeps the ledger of provisional resource
//! grants handed to processing jobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

use crate::config::AllocatorConfig;
use crate::queue::QueueStats;

const MIB: u64 = 1024 * 1024;

/// One measurement of host capacity. Memory and disk in MiB, cpu in cores.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SystemResources {
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
    pub total_cpu: f64,
    pub available_cpu: f64,
    pub total_disk_mb: u64,
    pub available_disk_mb: u64,
    pub sampled_at: DateTime<Utc>,
}

impl SystemResources {
    /// Used whenever sampling fails: small enough to never over-commit.
    pub fn conservative_estimate() -> Self {
        Self {
            total_memory_mb: 512,
            available_memory_mb: 512,
            total_cpu: 1.0,
            available_cpu: 1.0,
            total_disk_mb: 1024,
            available_disk_mb: 1024,
            sampled_at: Utc::now(),
        }
    }
}

/// Provisional grant requested for each processing job.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ResourceRequest {
    pub memory_mb: u64,
    pub cpu: f64,
    pub disk_mb: u64,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            memory_mb: 256,
            cpu: 0.5,
            disk_mb: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceAllocation {
    pub job_id: Uuid,
    pub grant: ResourceRequest,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapacityError {
    #[error("Job {0} already holds an allocation")]
    AlreadyAllocated(Uuid),

    #[error("Insufficient {resource}: {requested} requested, {free} free")]
    Insufficient {
        resource: &'static str,
        requested: f64,
        free: f64,
    },
}

/// Maps host resources and queue backlog to a raw worker count.
pub trait AllocationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn target_workers(&self, resources: &SystemResources, stats: &QueueStats) -> usize;
}

/// Shared shape of the built-in strategies.
#[derive(Debug, Clone, PartialEq)]
pub struct CapacityStrategy {
    name: &'static str,
    /// Share of the available cpu the pool may claim.
    pub cpu_fraction: f64,
    pub per_worker_memory_mb: u64,
    /// Pending jobs per extra worker.
    pub jobs_per_boost: usize,
    pub max_backlog_boost: usize,
}

impl CapacityStrategy {
    pub fn adaptive() -> Self {
        Self {
            name: "adaptive",
            cpu_fraction: 1.0,
            per_worker_memory_mb: 512,
            jobs_per_boost: 5,
            max_backlog_boost: 3,
        }
    }

    pub fn conservative() -> Self {
        Self {
            name: "conservative",
            cpu_fraction: 0.5,
            per_worker_memory_mb: 1024,
            jobs_per_boost: 5,
            max_backlog_boost: 1,
        }
    }

    pub fn aggressive() -> Self {
        Self {
            name: "aggressive",
            cpu_fraction: 0.9,
            per_worker_memory_mb: 256,
            jobs_per_boost: 5,
            max_backlog_boost: 5,
        }
    }

    fn backlog_boost(&self, pending: usize) -> usize {
        pending
            .div_ceil(self.jobs_per_boost.max(1))
            .min(self.max_backlog_boost)
    }
}

impl AllocationStrategy for CapacityStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn target_workers(&self, resources: &SystemResources, stats: &QueueStats) -> usize {
        let cpu = (resources.available_cpu * self.cpu_fraction).max(0.0).floor() as usize;
        let by_cpu = cpu + self.backlog_boost(stats.pending);
        let by_memory = (resources.available_memory_mb / self.per_worker_memory_mb.max(1)) as usize;
        by_cpu.min(by_memory)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Adaptive,
    Conservative,
    Aggressive,
}

impl StrategyKind {
    pub fn build(self) -> Box<dyn AllocationStrategy> {
        Box::new(match self {
            StrategyKind::Adaptive => CapacityStrategy::adaptive(),
            StrategyKind::Conservative => CapacityStrategy::conservative(),
            StrategyKind::Aggressive => CapacityStrategy::aggressive(),
        })
    }
}

/// Source of [`SystemResources`] samples. Called from a blocking thread.
pub trait ResourceSampler: Send {
    fn sample(&mut self) -> anyhow::Result<SystemResources>;
}

/// Samples the host through `sysinfo`.
pub struct SysinfoSampler {
    system: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: System::new_with_specifics(
                RefreshKind::nothing()
                    .with_cpu(CpuRefreshKind::everything())
                    .with_memory(MemoryRefreshKind::everything()),
            ),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&mut self) -> anyhow::Result<SystemResources> {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();

        let cores = self.system.cpus().len();
        if cores == 0 {
            anyhow::bail!("no cpu information available");
        }
        let usage = f64::from(self.system.global_cpu_usage()).clamp(0.0, 100.0);
        let total_cpu = cores as f64;

        let disks = Disks::new_with_refreshed_list();
        let (total_disk, available_disk) = disks
            .list()
            .iter()
            .fold((0, 0), |(t, a), d| (t + d.total_space(), a + d.available_space()));

        Ok(SystemResources {
            total_memory_mb: self.system.total_memory() / MIB,
            available_memory_mb: self.system.available_memory() / MIB,
            total_cpu,
            available_cpu: total_cpu * (1.0 - usage / 100.0),
            total_disk_mb: total_disk / MIB,
            available_disk_mb: available_disk / MIB,
            sampled_at: Utc::now(),
        })
    }
}

/// Reports the same resources on every tick.
#[derive(Debug, Clone)]
pub struct StaticSampler(pub SystemResources);

impl StaticSampler {
    pub fn new(cpu: f64, memory_mb: u64, disk_mb: u64) -> Self {
        Self(SystemResources {
            total_memory_mb: memory_mb,
            available_memory_mb: memory_mb,
            total_cpu: cpu,
            available_cpu: cpu,
            total_disk_mb: disk_mb,
            available_disk_mb: disk_mb,
            sampled_at: Utc::now(),
        })
    }
}

impl ResourceSampler for StaticSampler {
    fn sample(&mut self) -> anyhow::Result<SystemResources> {
        let mut resources = self.0.clone();
        resources.sampled_at = Utc::now();
        Ok(resources)
    }
}

pub struct ResourceAllocator {
    strategy: Box<dyn AllocationStrategy>,
    min_workers: usize,
    max_workers: usize,
    job_resources: ResourceRequest,
    resources: SystemResources,
    allocations: HashMap<Uuid, ResourceAllocation>,
}

impl ResourceAllocator {
    pub fn new(config: &AllocatorConfig) -> Self {
        Self {
            strategy: config.strategy.build(),
            min_workers: config.min_workers,
            max_workers: config.max_workers.max(config.min_workers),
            job_resources: config.job_resources,
            resources: SystemResources::conservative_estimate(),
            allocations: HashMap::new(),
        }
    }

    pub fn set_strategy(&mut self, strategy: Box<dyn AllocationStrategy>) {
        info!(from = self.strategy.name(), to = strategy.name(), "Switching allocation strategy");
        self.strategy = strategy;
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Rejects `min > max` and `max == 0`.
    pub fn set_bounds(&mut self, min_workers: usize, max_workers: usize) -> bool {
        if max_workers == 0 || min_workers > max_workers {
            return false;
        }
        self.min_workers = min_workers;
        self.max_workers = max_workers;
        true
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.min_workers, self.max_workers)
    }

    /// Record a new sample. A failed sample falls back to the conservative
    /// estimate.
    pub fn update(&mut self, sample: anyhow::Result<SystemResources>) {
        self.resources = match sample {
            Ok(resources) => resources,
            Err(err) => {
                warn!(error = %err, "Resource sampling failed, using conservative estimate");
                SystemResources::conservative_estimate()
            }
        };
        debug!(
            available_cpu = self.resources.available_cpu,
            available_memory_mb = self.resources.available_memory_mb,
            available_disk_mb = self.resources.available_disk_mb,
            "Updated system resources"
        );
    }

    pub fn resources(&self) -> &SystemResources {
        &self.resources
    }

    /// Worker count for the current sample, within bounds.
    pub fn target_workers(&self, stats: &QueueStats) -> usize {
        let raw = self.strategy.target_workers(&self.resources, stats);
        let target = raw.clamp(self.min_workers, self.max_workers);
        debug!(strategy = self.strategy.name(), raw, target, pending = stats.pending, "Computed worker target");
        target
    }

    /// Reserve the per-job grant for `job_id` if it fits in what is left of
    /// the last sample.
    pub fn allocate(&mut self, job_id: Uuid) -> Result<ResourceAllocation, CapacityError> {
        if self.allocations.contains_key(&job_id) {
            return Err(CapacityError::AlreadyAllocated(job_id));
        }
        let want = self.job_resources;
        let used = self.committed();
        let checks = [
            ("memory", want.memory_mb as f64, self.resources.available_memory_mb as f64 - used.memory_mb as f64),
            ("cpu", want.cpu, self.resources.available_cpu - used.cpu),
            ("disk", want.disk_mb as f64, self.resources.available_disk_mb as f64 - used.disk_mb as f64),
        ];
        for (resource, requested, free) in checks {
            if requested > free + f64::EPSILON {
                return Err(CapacityError::Insufficient {
                    resource,
                    requested,
                    free: free.max(0.0),
                });
            }
        }

        let allocation = ResourceAllocation {
            job_id,
            grant: want,
            allocated_at: Utc::now(),
        };
        self.allocations.insert(job_id, allocation.clone());
        Ok(allocation)
    }

    /// Drop the grant for `job_id`. Returns false if it held none.
    pub fn release(&mut self, job_id: &Uuid) -> bool {
        self.allocations.remove(job_id).is_some()
    }

    /// Sum of all outstanding grants.
    pub fn committed(&self) -> ResourceRequest {
        self.allocations.values().fold(
            ResourceRequest {
                memory_mb: 0,
                cpu: 0.0,
                disk_mb: 0,
            },
            |acc, a| ResourceRequest {
                memory_mb: acc.memory_mb + a.grant.memory_mb,
                cpu: acc.cpu + a.grant.cpu,
                disk_mb: acc.disk_mb + a.grant.disk_mb,
            },
        )
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }
}

/// Sample resources every `interval` on a blocking thread and forward the
/// result to the engine.
pub async fn run_sampler(
    cancel_token: CancellationToken,
    sampler: Box<dyn ResourceSampler>,
    interval: Duration,
    send_to_server: UnboundedSender<anyhow::Result<SystemResources>>,
) {
    let sampler = Arc::new(Mutex::new(sampler));
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Sampler Cancelled");
                break;
            },
            _ = ticker.tick() => {
                let sampler = sampler.clone();
                let sample = tokio::task::spawn_blocking(move || {
                    sampler
                        .lock()
                        .map_err(|_| anyhow::anyhow!("resource sampler poisoned"))
                        .and_then(|mut sampler| sampler.sample())
                })
                .await
                .unwrap_or_else(|err| Err(anyhow::anyhow!("resource sampler panicked: {err}")));

                if send_to_server.send(sample).is_err() {
                    debug!("Engine gone, stopping sampler");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(cpu: f64, memory_mb: u64) -> SystemResources {
        StaticSampler::new(cpu, memory_mb, 10_240).0
    }

    fn backlog(pending: usize) -> QueueStats {
        QueueStats {
            pending,
            total: pending,
            ..Default::default()
        }
    }

    #[test]
    fn adaptive_is_bounded_by_memory() {
        let strategy = CapacityStrategy::adaptive();
        let r = resources(2.0, 1024);
        assert_eq!(strategy.target_workers(&r, &backlog(0)), 2);
        assert_eq!(strategy.target_workers(&r, &backlog(50)), 2);
    }

    #[test]
    fn adaptive_backlog_pushes_past_cpu() {
        let strategy = CapacityStrategy::adaptive();
        let r = resources(2.0, 16_384);
        assert_eq!(strategy.target_workers(&r, &backlog(0)), 2);
        assert_eq!(strategy.target_workers(&r, &backlog(1)), 3);
        assert_eq!(strategy.target_workers(&r, &backlog(10)), 4);
        // Boost is capped.
        assert_eq!(strategy.target_workers(&r, &backlog(1_000)), 5);
    }

    #[test]
    fn conservative_and_aggressive_differ() {
        let r = resources(8.0, 8_192);
        let stats = backlog(0);
        assert_eq!(CapacityStrategy::conservative().target_workers(&r, &stats), 4);
        assert_eq!(CapacityStrategy::aggressive().target_workers(&r, &stats), 7);

        let tight = resources(8.0, 2_048);
        assert_eq!(CapacityStrategy::conservative().target_workers(&tight, &stats), 2);
        assert_eq!(CapacityStrategy::aggressive().target_workers(&tight, &stats), 7);
    }

    #[test]
    fn target_is_clamped_to_bounds() {
        let config = AllocatorConfig {
            min_workers: 2,
            max_workers: 4,
            ..Default::default()
        };
        let mut allocator = ResourceAllocator::new(&config);

        allocator.update(Ok(resources(0.0, 0)));
        assert_eq!(allocator.target_workers(&backlog(0)), 2);

        allocator.update(Ok(resources(64.0, 65_536)));
        assert_eq!(allocator.target_workers(&backlog(100)), 4);
    }

    #[test]
    fn failed_sample_falls_back_to_estimate() {
        let mut allocator = ResourceAllocator::new(&AllocatorConfig::default());
        allocator.update(Ok(resources(16.0, 65_536)));
        allocator.update(Err(anyhow::anyhow!("no /proc")));
        assert_eq!(allocator.resources().available_cpu, 1.0);
        assert_eq!(allocator.resources().available_memory_mb, 512);
        assert_eq!(allocator.target_workers(&backlog(0)), 1);
    }

    #[test]
    fn strategy_can_be_swapped() {
        let mut allocator = ResourceAllocator::new(&AllocatorConfig::default());
        allocator.update(Ok(resources(8.0, 8_192)));
        assert_eq!(allocator.strategy_name(), "adaptive");
        assert_eq!(allocator.target_workers(&backlog(0)), 8);

        allocator.set_strategy(StrategyKind::Conservative.build());
        assert_eq!(allocator.strategy_name(), "conservative");
        assert_eq!(allocator.target_workers(&backlog(0)), 4);
    }

    #[test]
    fn bounds_reject_misuse() {
        let mut allocator = ResourceAllocator::new(&AllocatorConfig::default());
        assert!(!allocator.set_bounds(5, 2));
        assert!(!allocator.set_bounds(0, 0));
        assert_eq!(allocator.bounds(), (1, 10));
        assert!(allocator.set_bounds(2, 3));
        assert_eq!(allocator.bounds(), (2, 3));
    }

    #[test]
    fn allocations_never_over_commit() {
        let config = AllocatorConfig {
            job_resources: ResourceRequest {
                memory_mb: 512,
                cpu: 1.0,
                disk_mb: 100,
            },
            ..Default::default()
        };
        let mut allocator = ResourceAllocator::new(&config);
        allocator.update(Ok(resources(2.0, 4_096)));

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        assert!(allocator.allocate(a).is_ok());
        assert_eq!(allocator.allocate(a), Err(CapacityError::AlreadyAllocated(a)));
        assert!(allocator.allocate(b).is_ok());
        assert!(matches!(
            allocator.allocate(c),
            Err(CapacityError::Insufficient { resource: "cpu", .. })
        ));
        assert_eq!(allocator.committed().cpu, 2.0);

        assert!(allocator.release(&a));
        assert!(!allocator.release(&a));
        assert!(allocator.allocate(c).is_ok());
        assert_eq!(allocator.allocation_count(), 2);
    }

    #[test]
    fn strategy_kind_parses_from_json() {
        let kind: StrategyKind = serde_json::from_str("\"conservative\"").unwrap();
        assert_eq!(kind, StrategyKind::Conservative);
        assert_eq!(kind.build().name(), "conservative");
    }
}
