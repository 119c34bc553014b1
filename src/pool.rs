//! Worker roster bookkeeping.
//!
//! Workers here are logical slots, not threads: the engine asks the pool for
//! an idle worker able to take a job, spawns the conversion itself, and tells
//! the pool when the work finished. A watchdog pass detects workers whose
//! heartbeat went silent and takes their job away.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use tracing::*;
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::events::{Event, EventSink};
use crate::Job;

/// Capability accepted for every job type.
pub const ANY_JOB: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct WorkerPerformance {
    pub completed: u64,
    pub failed: u64,
    /// Rolling average over every processed job.
    pub average_processing_ms: f64,
}

impl WorkerPerformance {
    pub fn processed(&self) -> u64 {
        self.completed + self.failed
    }

    fn record(&mut self, success: bool, elapsed: Duration) {
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        let n = self.processed() as f64;
        let sample = elapsed.as_secs_f64() * 1000.0;
        self.average_processing_ms += (sample - self.average_processing_ms) / n;
    }
}

#[derive(Debug, Clone)]
pub struct Worker {
    pub id: u64,
    pub status: WorkerStatus,
    pub current_job: Option<Uuid>,
    pub capabilities: BTreeSet<String>,
    pub performance: WorkerPerformance,
    pub last_heartbeat: Instant,
    assigned_at: Option<Instant>,
    errored_at: Option<Instant>,
}

impl Worker {
    fn new(id: u64, capabilities: BTreeSet<String>, now: Instant) -> Self {
        Self {
            id,
            status: WorkerStatus::Idle,
            current_job: None,
            capabilities,
            performance: WorkerPerformance::default(),
            last_heartbeat: now,
            assigned_at: None,
            errored_at: None,
        }
    }

    pub fn accepts(&self, job_type: &str) -> bool {
        self.capabilities.contains(job_type) || self.capabilities.contains(ANY_JOB)
    }

    /// Whether `other` can take every job type this worker can.
    fn covered_by(&self, other: &Worker) -> bool {
        other.id != self.id && self.capabilities.iter().all(|c| other.accepts(c))
    }
}

/// Result of a [`WorkerPool::scale_pool`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleOutcome {
    pub added: Vec<u64>,
    pub removed: Vec<u64>,
}

pub struct WorkerPool {
    workers: BTreeMap<u64, Worker>,
    next_id: u64,
    scale_capabilities: BTreeSet<String>,
    heartbeat_timeout: Duration,
    error_cooldown: Duration,
    events: EventSink,
}

impl WorkerPool {
    pub fn new(config: &PoolConfig, events: EventSink) -> Self {
        let mut pool = Self {
            workers: BTreeMap::new(),
            next_id: 1,
            scale_capabilities: config.scale_capabilities.iter().cloned().collect(),
            heartbeat_timeout: config.heartbeat_timeout(),
            error_cooldown: config.error_cooldown(),
            events,
        };
        let now = Instant::now();
        for group in &config.groups {
            let capabilities: BTreeSet<String> = group.capabilities.iter().cloned().collect();
            for _ in 0..group.count {
                pool.spawn_worker(capabilities.clone(), now);
            }
        }
        info!(workers = pool.size(), "Worker pool initialized");
        pool
    }

    fn spawn_worker(&mut self, capabilities: BTreeSet<String>, now: Instant) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        debug!(worker_id = id, ?capabilities, "Adding worker");
        self.workers.insert(id, Worker::new(id, capabilities, now));
        self.events.emit(Event::WorkerAdded { worker_id: id });
        id
    }

    /// Bind `job` to the least used idle worker able to take it.
    pub fn assign(&mut self, job: &Job, now: Instant) -> Option<u64> {
        if self.workers.values().any(|w| w.current_job == Some(job.id)) {
            warn!(job_id = %job.id, "Job is already held by a worker");
            return None;
        }
        let worker = self
            .workers
            .values_mut()
            .filter(|w| w.status == WorkerStatus::Idle && w.accepts(&job.job_type))
            .min_by_key(|w| (w.performance.processed(), w.id))?;

        worker.status = WorkerStatus::Busy;
        worker.current_job = Some(job.id);
        worker.last_heartbeat = now;
        worker.assigned_at = Some(now);
        debug!(worker_id = worker.id, job_id = %job.id, "Assigned job");
        Some(worker.id)
    }

    /// Refresh the heartbeat of a worker still holding `job_id`.
    pub fn heartbeat(&mut self, worker_id: u64, job_id: &Uuid, now: Instant) -> bool {
        match self.workers.get_mut(&worker_id) {
            Some(w) if w.current_job == Some(*job_id) => {
                w.last_heartbeat = now;
                true
            }
            _ => false,
        }
    }

    /// Return a worker to idle after its job finished. Returns false when the
    /// worker no longer holds that job (timed out or cancelled meanwhile), in
    /// which case the outcome must be discarded.
    pub fn release(&mut self, worker_id: u64, job_id: &Uuid, success: bool, elapsed: Duration) -> bool {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return false;
        };
        if worker.current_job != Some(*job_id) {
            return false;
        }
        worker.status = WorkerStatus::Idle;
        worker.current_job = None;
        worker.assigned_at = None;
        worker.performance.record(success, elapsed);
        debug!(
            worker_id,
            job_id = %job_id,
            success,
            average_ms = worker.performance.average_processing_ms,
            "Released worker"
        );
        true
    }

    /// Free whichever worker holds `job_id` without counting the job as
    /// processed.
    pub fn detach_job(&mut self, job_id: &Uuid) -> Option<u64> {
        let worker = self
            .workers
            .values_mut()
            .find(|w| w.current_job == Some(*job_id))?;
        worker.current_job = None;
        worker.assigned_at = None;
        if worker.status == WorkerStatus::Busy {
            worker.status = WorkerStatus::Idle;
        }
        debug!(worker_id = worker.id, job_id = %job_id, "Detached job from worker");
        Some(worker.id)
    }

    /// Move busy workers with a stale heartbeat to `error` and hand back the
    /// jobs they were holding.
    pub fn check_heartbeats(&mut self, now: Instant) -> Vec<(u64, Uuid)> {
        let mut stuck = vec![];
        for worker in self.workers.values_mut() {
            if worker.status != WorkerStatus::Busy {
                continue;
            }
            let silent = now.saturating_duration_since(worker.last_heartbeat);
            if silent <= self.heartbeat_timeout {
                continue;
            }
            let Some(job_id) = worker.current_job.take() else {
                continue;
            };
            warn!(worker_id = worker.id, job_id = %job_id, silent_ms = silent.as_millis() as u64, "Worker heartbeat timed out");
            let running = worker
                .assigned_at
                .take()
                .map_or(silent, |at| now.saturating_duration_since(at));
            worker.performance.record(false, running);
            worker.status = WorkerStatus::Error;
            worker.errored_at = Some(now);
            stuck.push((worker.id, job_id));
        }
        for &(worker_id, job_id) in &stuck {
            self.events.emit(Event::WorkerTimeout { worker_id, job_id });
        }
        stuck
    }

    /// Reset errored workers whose cooldown elapsed.
    pub fn recover(&mut self, now: Instant) -> Vec<u64> {
        let mut recovered = vec![];
        for worker in self.workers.values_mut() {
            let Some(since) = worker.errored_at else {
                continue;
            };
            if now.saturating_duration_since(since) >= self.error_cooldown {
                worker.status = WorkerStatus::Idle;
                worker.errored_at = None;
                worker.last_heartbeat = now;
                info!(worker_id = worker.id, "Worker recovered");
                recovered.push(worker.id);
            }
        }
        recovered
    }

    /// Grow to `target` or shrink towards it. Only idle workers are removed,
    /// newest first, and never the last worker able to take one of its job
    /// types, so the pool may stay above target.
    pub fn scale_pool(&mut self, target: usize) -> ScaleOutcome {
        let mut outcome = ScaleOutcome::default();
        let size = self.size();
        if target > size {
            let now = Instant::now();
            for _ in size..target {
                let id = self.spawn_worker(self.scale_capabilities.clone(), now);
                outcome.added.push(id);
            }
        } else if target < size {
            let idle: Vec<u64> = self
                .workers
                .values()
                .rev()
                .filter(|w| w.status == WorkerStatus::Idle)
                .map(|w| w.id)
                .collect();
            for id in idle {
                if outcome.removed.len() == size - target {
                    break;
                }
                let redundant = self.workers.get(&id).is_some_and(|w| {
                    self.workers.values().any(|other| w.covered_by(other))
                });
                if !redundant {
                    continue;
                }
                self.workers.remove(&id);
                debug!(worker_id = id, "Removing worker");
                self.events.emit(Event::WorkerRemoved { worker_id: id });
                outcome.removed.push(id);
            }
        }
        if !outcome.added.is_empty() || !outcome.removed.is_empty() {
            info!(
                target,
                size = self.size(),
                added = outcome.added.len(),
                removed = outcome.removed.len(),
                "Scaled worker pool"
            );
        }
        outcome
    }

    pub fn get(&self, worker_id: u64) -> Option<&Worker> {
        self.workers.get(&worker_id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn count(&self, status: WorkerStatus) -> usize {
        self.workers.values().filter(|w| w.status == status).count()
    }
}
