use std::cmp::Reverse;
use std::collections::HashSet;

use tracing::*;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::events::{Event, EventSink};
use crate::{Job, JobFilter, Status};

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

/// Priority-ordered jobs with a bounded number of processing slots.
///
/// The queue is the only writer of [`Job`] records. Every mutation that frees
/// or fills a slot re-runs dispatch, which emits [`Event::JobProcess`] for each
/// job it moves to `processing`.
#[derive(Debug)]
pub struct JobQueue {
    // Sorted by descending priority, then creation order.
    jobs: Vec<Job>,
    processing: usize,
    // Requeued jobs skipped by dispatch until `release_held`.
    held: HashSet<Uuid>,
    config: QueueConfig,
    events: EventSink,
    dirty: bool,
}

fn order_key(job: &Job) -> (Reverse<i32>, chrono::DateTime<chrono::Utc>) {
    (Reverse(job.priority), job.created_at)
}

impl JobQueue {
    pub fn new(config: QueueConfig, events: EventSink) -> Self {
        Self {
            jobs: Vec::new(),
            processing: 0,
            held: HashSet::new(),
            config,
            events,
            dirty: false,
        }
    }

    /// Load jobs from a snapshot. Jobs that were processing when the snapshot
    /// was taken lost their worker, so they go back to pending.
    pub fn restore(&mut self, jobs: Vec<Job>) {
        let mut demoted = 0;
        for mut job in jobs {
            if self.position(&job.id).is_some() {
                warn!(job_id = %job.id, "Duplicate job in snapshot, skipping");
                continue;
            }
            if job.status == Status::Processing {
                job.status = Status::Pending;
                demoted += 1;
            }
            self.jobs.push(job);
        }
        self.jobs.sort_by_key(order_key);
        info!(jobs = self.jobs.len(), demoted, "Restored job queue");
        self.dirty = true;
        self.process_next_jobs();
    }

    /// Create a pending job and try to dispatch it. Returns `None` when the
    /// queue already holds `max_jobs` unfinished jobs.
    pub fn add_job(
        &mut self,
        job_type: impl Into<String>,
        data: serde_json::Value,
        priority: Option<i32>,
    ) -> Option<Uuid> {
        let active = self.jobs.iter().filter(|j| !j.status.is_terminal()).count();
        if active >= self.config.max_jobs {
            warn!(active, "Job queue is full, rejecting job");
            return None;
        }

        let job = Job::new(
            job_type,
            data,
            priority.unwrap_or(self.config.default_priority),
        );
        let id = job.id;
        debug!(job_id = %id, job_type = %job.job_type, priority = job.priority, "Adding job");

        let key = order_key(&job);
        let at = self.jobs.partition_point(|j| order_key(j) <= key);
        self.events.emit(Event::JobAdded {
            job_id: id,
            job_type: job.job_type.clone(),
            priority: job.priority,
        });
        self.jobs.insert(at, job);
        self.dirty = true;

        self.process_next_jobs();
        Some(id)
    }

    pub fn get_job(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == *id)
    }

    /// Matching jobs in dispatch order.
    pub fn get_jobs(&self, filter: &JobFilter) -> Vec<&Job> {
        self.jobs.iter().filter(|j| filter.matches(j)).collect()
    }

    /// Fill free processing slots with the highest-priority pending jobs.
    pub fn process_next_jobs(&mut self) {
        if self.processing >= self.config.max_concurrent {
            return;
        }
        let free = self.config.max_concurrent - self.processing;
        let ready: Vec<usize> = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.status == Status::Pending && !self.held.contains(&j.id))
            .map(|(i, _)| i)
            .take(free)
            .collect();

        for i in ready {
            let job = &mut self.jobs[i];
            job.status = Status::Processing;
            self.processing += 1;
            debug!(job_id = %job.id, "Dispatching job");
            self.events.emit(Event::JobProcess { job: job.clone() });
            self.dirty = true;
        }
    }

    pub fn complete_job(&mut self, id: &Uuid, result: serde_json::Value) -> bool {
        let Some(job) = self.processing_job_mut(id) else {
            return false;
        };
        job.status = Status::Completed;
        job.result = Some(result.clone());
        self.release_slot();
        debug!(job_id = %id, "Completed job");
        self.events.emit(Event::JobCompleted { job_id: *id, result });
        self.process_next_jobs();
        true
    }

    pub fn fail_job(&mut self, id: &Uuid, error: impl Into<String>) -> bool {
        let Some(job) = self.processing_job_mut(id) else {
            return false;
        };
        let error = error.into();
        job.status = Status::Failed;
        job.error = Some(error.clone());
        self.release_slot();
        debug!(job_id = %id, error = %error, "Failed job");
        self.events.emit(Event::JobFailed { job_id: *id, error });
        self.process_next_jobs();
        true
    }

    /// Cancel a pending or processing job. A processing job's slot is freed
    /// right away; whatever work it started is abandoned.
    pub fn cancel_job(&mut self, id: &Uuid) -> bool {
        let Some(i) = self.position(id) else {
            return false;
        };
        let job = &mut self.jobs[i];
        let was_processing = match job.status {
            Status::Pending => false,
            Status::Processing => true,
            _ => return false,
        };
        job.status = Status::Cancelled;
        self.held.remove(id);
        if was_processing {
            self.release_slot();
        }
        self.dirty = true;
        debug!(job_id = %id, was_processing, "Cancelled job");
        self.events.emit(Event::JobCancelled { job_id: *id });
        self.process_next_jobs();
        true
    }

    /// Put a processing job back to pending when no worker or no resources
    /// could take it. The job is held out of dispatch until `release_held`, so
    /// the freed slot goes to the next pending job instead.
    pub fn requeue_job(&mut self, id: &Uuid) -> bool {
        let Some(job) = self.processing_job_mut(id) else {
            return false;
        };
        job.status = Status::Pending;
        self.held.insert(*id);
        self.release_slot();
        debug!(job_id = %id, "Requeued job");
        self.process_next_jobs();
        true
    }

    /// Make requeued jobs eligible again and re-run dispatch. Called whenever
    /// a worker or resources may have become available.
    pub fn release_held(&mut self) {
        if self.held.is_empty() {
            return;
        }
        debug!(held = self.held.len(), "Releasing held jobs");
        self.held.clear();
        self.process_next_jobs();
    }

    pub fn update_job_priority(&mut self, id: &Uuid, priority: i32) -> bool {
        let Some(i) = self.position(id) else {
            return false;
        };
        if self.jobs[i].status != Status::Pending {
            return false;
        }
        let mut job = self.jobs.remove(i);
        job.priority = priority;
        let key = order_key(&job);
        let at = self.jobs.partition_point(|j| order_key(j) <= key);
        self.jobs.insert(at, job);
        self.dirty = true;
        self.events.emit(Event::JobPriority {
            job_id: *id,
            priority,
        });
        true
    }

    /// Change the slot limit. Running jobs are never interrupted by a lower
    /// limit; it only holds back further dispatch.
    pub fn set_max_concurrent(&mut self, max_concurrent: usize) {
        info!(max_concurrent, "Setting max concurrent jobs");
        self.config.max_concurrent = max_concurrent;
        self.process_next_jobs();
    }

    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent
    }

    pub fn get_stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total: self.jobs.len(),
            ..Default::default()
        };
        for job in &self.jobs {
            match job.status {
                Status::Pending => stats.pending += 1,
                Status::Processing => stats.processing += 1,
                Status::Completed => stats.completed += 1,
                Status::Failed => stats.failed += 1,
                Status::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.clone()
    }

    /// Whether anything changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    fn position(&self, id: &Uuid) -> Option<usize> {
        self.jobs.iter().position(|j| j.id == *id)
    }

    fn processing_job_mut(&mut self, id: &Uuid) -> Option<&mut Job> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == *id && j.status == Status::Processing)
    }

    fn release_slot(&mut self) {
        self.processing = self.processing.saturating_sub(1);
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn queue(max_concurrent: usize) -> (JobQueue, UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = QueueConfig {
            max_concurrent,
            ..Default::default()
        };
        (JobQueue::new(config, EventSink::new(tx)), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = vec![];
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn processing(queue: &JobQueue) -> usize {
        queue.get_jobs(&JobFilter::status(Status::Processing)).len()
    }

    #[test]
    fn jobs_are_ordered_by_priority_then_creation() {
        let (mut queue, _rx) = queue(0);
        let a = queue.add_job("conversion", json!(1), Some(1)).unwrap();
        let b = queue.add_job("conversion", json!(2), Some(3)).unwrap();
        let c = queue.add_job("conversion", json!(3), Some(1)).unwrap();
        let d = queue.add_job("conversion", json!(4), None).unwrap();
        let e = queue.add_job("conversion", json!(5), Some(3)).unwrap();

        let order: Vec<Uuid> = queue
            .get_jobs(&JobFilter::default())
            .iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(order, vec![b, e, a, c, d]);
    }

    #[test]
    fn higher_priority_dispatches_first() {
        let (mut queue, mut rx) = queue(0);
        let low1 = queue.add_job("conversion", json!({}), Some(1)).unwrap();
        let _low2 = queue.add_job("conversion", json!({}), Some(1)).unwrap();
        let high = queue.add_job("conversion", json!({}), Some(5)).unwrap();
        drain(&mut rx);

        queue.set_max_concurrent(2);
        let dispatched: Vec<Uuid> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                Event::JobProcess { job } => Some(job.id),
                _ => None,
            })
            .collect();
        assert_eq!(dispatched, vec![high, low1]);
        assert_eq!(processing(&queue), 2);
    }

    #[test]
    fn processing_never_exceeds_max_concurrent() {
        let (mut queue, _rx) = queue(2);
        let ids: Vec<Uuid> = (0..6)
            .map(|i| queue.add_job("conversion", json!(i), None).unwrap())
            .collect();
        assert_eq!(processing(&queue), 2);

        assert!(queue.complete_job(&ids[0], json!("ok")));
        assert_eq!(processing(&queue), 2);
        assert!(queue.cancel_job(&ids[1]));
        assert_eq!(processing(&queue), 2);
        assert!(queue.fail_job(&ids[2], "boom"));
        assert_eq!(processing(&queue), 2);

        queue.set_max_concurrent(1);
        assert_eq!(processing(&queue), 2);
        assert!(queue.complete_job(&ids[3], json!("ok")));
        assert_eq!(processing(&queue), 1);
    }

    #[test]
    fn freed_slot_is_reused_immediately() {
        let (mut queue, mut rx) = queue(1);
        let first = queue.add_job("conversion", json!({}), None).unwrap();
        let second = queue.add_job("conversion", json!({}), None).unwrap();
        drain(&mut rx);

        assert!(queue.complete_job(&first, json!({"ok": true})));
        let events = drain(&mut rx);
        assert_eq!(events[0].name(), "job:completed");
        assert!(matches!(&events[1], Event::JobProcess { job } if job.id == second));
    }

    #[test]
    fn cancel_unknown_or_terminal_returns_false_without_event() {
        let (mut queue, mut rx) = queue(1);
        assert!(!queue.cancel_job(&Uuid::new_v4()));

        let id = queue.add_job("conversion", json!({}), None).unwrap();
        assert!(queue.complete_job(&id, json!(null)));
        drain(&mut rx);

        assert!(!queue.cancel_job(&id));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(queue.get_job(&id).unwrap().status, Status::Completed);
    }

    #[test]
    fn cancel_pending_and_processing() {
        let (mut queue, mut rx) = queue(1);
        let running = queue.add_job("conversion", json!({}), None).unwrap();
        let waiting = queue.add_job("conversion", json!({}), None).unwrap();
        let third = queue.add_job("conversion", json!({}), None).unwrap();
        drain(&mut rx);

        assert!(queue.cancel_job(&waiting));
        assert_eq!(queue.get_job(&waiting).unwrap().status, Status::Cancelled);
        assert_eq!(drain(&mut rx), vec![Event::JobCancelled { job_id: waiting }]);

        assert!(queue.cancel_job(&running));
        let events = drain(&mut rx);
        assert_eq!(events[0], Event::JobCancelled { job_id: running });
        assert!(matches!(&events[1], Event::JobProcess { job } if job.id == third));

        // Late completion of the cancelled job is ignored.
        assert!(!queue.complete_job(&running, json!("late")));
        assert_eq!(queue.get_job(&running).unwrap().status, Status::Cancelled);
        assert!(queue.get_job(&running).unwrap().result.is_none());
    }

    #[test]
    fn priority_update_only_while_pending() {
        let (mut queue, mut rx) = queue(1);
        let running = queue.add_job("conversion", json!({}), Some(1)).unwrap();
        let a = queue.add_job("conversion", json!({}), Some(1)).unwrap();
        let b = queue.add_job("conversion", json!({}), Some(1)).unwrap();
        drain(&mut rx);

        assert!(!queue.update_job_priority(&running, 10));
        assert!(!queue.update_job_priority(&Uuid::new_v4(), 10));
        assert!(drain(&mut rx).is_empty());

        assert!(queue.update_job_priority(&b, 10));
        assert_eq!(
            drain(&mut rx),
            vec![Event::JobPriority {
                job_id: b,
                priority: 10
            }]
        );
        let pending: Vec<Uuid> = queue
            .get_jobs(&JobFilter::status(Status::Pending))
            .iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(pending, vec![b, a]);

        assert!(queue.complete_job(&running, json!(null)));
        assert!(!queue.update_job_priority(&running, 3));
    }

    #[test]
    fn second_completion_is_a_no_op() {
        let (mut queue, mut rx) = queue(1);
        let id = queue.add_job("conversion", json!({}), None).unwrap();
        assert!(queue.fail_job(&id, "first"));
        drain(&mut rx);

        assert!(!queue.fail_job(&id, "second"));
        assert!(!queue.complete_job(&id, json!("x")));
        assert!(drain(&mut rx).is_empty());
        let job = queue.get_job(&id).unwrap();
        assert_eq!(job.status, Status::Failed);
        assert_eq!(job.error.as_deref(), Some("first"));
    }

    #[test]
    fn requeue_holds_job_until_released() {
        let (mut queue, mut rx) = queue(1);
        let id = queue.add_job("conversion", json!({}), None).unwrap();
        drain(&mut rx);

        assert!(queue.requeue_job(&id));
        assert_eq!(queue.get_job(&id).unwrap().status, Status::Pending);
        assert!(drain(&mut rx).is_empty());

        queue.process_next_jobs();
        assert_eq!(queue.get_job(&id).unwrap().status, Status::Pending);

        queue.release_held();
        assert_eq!(queue.get_job(&id).unwrap().status, Status::Processing);
        let events = drain(&mut rx);
        assert!(matches!(events.as_slice(), [Event::JobProcess { .. }]));
    }

    #[test]
    fn requeued_head_job_yields_its_slot() {
        let (mut queue, mut rx) = queue(1);
        let blocked = queue.add_job("analysis", json!({}), Some(5)).unwrap();
        let next = queue.add_job("conversion", json!({}), Some(1)).unwrap();
        assert_eq!(queue.get_job(&blocked).unwrap().status, Status::Processing);
        drain(&mut rx);

        assert!(queue.requeue_job(&blocked));
        assert_eq!(queue.get_job(&next).unwrap().status, Status::Processing);
        assert_eq!(queue.get_job(&blocked).unwrap().status, Status::Pending);
        assert_eq!(processing(&queue), 1);

        // Releasing while the slot is taken changes nothing until it frees.
        queue.release_held();
        assert_eq!(queue.get_job(&blocked).unwrap().status, Status::Pending);
        assert!(queue.complete_job(&next, json!({})));
        assert_eq!(queue.get_job(&blocked).unwrap().status, Status::Processing);
    }

    #[test]
    fn cancelled_held_job_is_forgotten() {
        let (mut queue, _rx) = queue(1);
        let id = queue.add_job("analysis", json!({}), None).unwrap();
        assert!(queue.requeue_job(&id));
        assert!(queue.cancel_job(&id));
        assert_eq!(queue.get_job(&id).unwrap().status, Status::Cancelled);
        queue.release_held();
        assert_eq!(processing(&queue), 0);
    }

    #[test]
    fn restore_demotes_processing_jobs() {
        let (mut original, _rx) = queue(2);
        let a = original.add_job("conversion", json!({"n": 1}), Some(2)).unwrap();
        let b = original.add_job("conversion", json!({"n": 2}), Some(7)).unwrap();
        let c = original.add_job("conversion", json!({"n": 3}), Some(1)).unwrap();
        let snapshot = original.snapshot();
        assert_eq!(
            snapshot.iter().filter(|j| j.status == Status::Processing).count(),
            2
        );

        let (mut restored, mut rx) = queue(0);
        restored.restore(snapshot);
        assert!(drain(&mut rx).is_empty());
        for (id, priority, n) in [(a, 2, 1), (b, 7, 2), (c, 1, 3)] {
            let job = restored.get_job(&id).unwrap();
            assert_eq!(job.status, Status::Pending);
            assert_eq!(job.priority, priority);
            assert_eq!(job.data, json!({ "n": n }));
        }
    }

    #[test]
    fn full_queue_rejects_jobs() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = QueueConfig {
            max_concurrent: 0,
            max_jobs: 2,
            ..Default::default()
        };
        let mut queue = JobQueue::new(config, EventSink::new(tx));
        let first = queue.add_job("conversion", json!({}), None).unwrap();
        queue.add_job("conversion", json!({}), None).unwrap();
        assert!(queue.add_job("conversion", json!({}), None).is_none());

        assert!(queue.cancel_job(&first));
        assert!(queue.add_job("conversion", json!({}), None).is_some());
    }

    #[test]
    fn stats_count_every_status() {
        let (mut queue, _rx) = queue(3);
        let a = queue.add_job("conversion", json!({}), None).unwrap();
        let b = queue.add_job("conversion", json!({}), None).unwrap();
        let c = queue.add_job("conversion", json!({}), None).unwrap();
        queue.add_job("analysis", json!({}), None).unwrap();
        queue.complete_job(&a, json!(null));
        queue.fail_job(&b, "x");
        queue.cancel_job(&c);

        let stats = queue.get_stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.total, 4);

        let analysis = queue.get_jobs(&JobFilter::default().with_type("analysis"));
        assert_eq!(analysis.len(), 1);
    }
}
