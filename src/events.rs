use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::*;
use uuid::Uuid;

use crate::Job;

/// State changes published by the queue and the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    JobAdded {
        job_id: Uuid,
        job_type: String,
        priority: i32,
    },
    /// The job moved to `processing` and needs a worker.
    JobProcess { job: Job },
    JobCompleted {
        job_id: Uuid,
        result: serde_json::Value,
    },
    JobFailed {
        job_id: Uuid,
        error: String,
    },
    JobCancelled {
        job_id: Uuid,
    },
    JobPriority {
        job_id: Uuid,
        priority: i32,
    },
    WorkerAdded {
        worker_id: u64,
    },
    WorkerRemoved {
        worker_id: u64,
    },
    WorkerTimeout {
        worker_id: u64,
        job_id: Uuid,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::JobAdded { .. } => "job:added",
            Event::JobProcess { .. } => "job:process",
            Event::JobCompleted { .. } => "job:completed",
            Event::JobFailed { .. } => "job:failed",
            Event::JobCancelled { .. } => "job:cancelled",
            Event::JobPriority { .. } => "job:priority",
            Event::WorkerAdded { .. } => "worker:added",
            Event::WorkerRemoved { .. } => "worker:removed",
            Event::WorkerTimeout { .. } => "worker:timeout",
        }
    }

    /// The job this event concerns, if any.
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            Event::JobAdded { job_id, .. }
            | Event::JobCompleted { job_id, .. }
            | Event::JobFailed { job_id, .. }
            | Event::JobCancelled { job_id }
            | Event::JobPriority { job_id, .. }
            | Event::WorkerTimeout { job_id, .. } => Some(*job_id),
            Event::JobProcess { job } => Some(job.id),
            Event::WorkerAdded { .. } | Event::WorkerRemoved { .. } => None,
        }
    }

    /// True for events after which the job never changes again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::JobCompleted { .. } | Event::JobFailed { .. } | Event::JobCancelled { .. }
        )
    }
}

/// Sending half handed to the queue and the pool.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: UnboundedSender<Event>,
}

impl EventSink {
    pub fn new(tx: UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: Event) {
        trace!(event = event.name(), job_id = ?event.job_id());
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}
