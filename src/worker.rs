use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

use crate::pipeline::{ConversionReport, ConversionError, PipelineController};
use crate::Job;

#[derive(Debug)]
pub enum WorkMessage {
    Heartbeat {
        worker_id: u64,
        job_id: Uuid,
    },
    Finished {
        worker_id: u64,
        job_id: Uuid,
        elapsed: Duration,
        outcome: Result<ConversionReport, ConversionError>,
    },
}

/// Lets a running job prove to the watchdog that it is alive.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    worker_id: u64,
    job_id: Uuid,
    send_to_server: UnboundedSender<WorkMessage>,
}

impl Heartbeat {
    pub fn new(worker_id: u64, job_id: Uuid, send_to_server: UnboundedSender<WorkMessage>) -> Self {
        Self {
            worker_id,
            job_id,
            send_to_server,
        }
    }

    pub fn beat(&self) {
        // The engine only goes away on shutdown, nothing to report then.
        let _ = self.send_to_server.send(WorkMessage::Heartbeat {
            worker_id: self.worker_id,
            job_id: self.job_id,
        });
    }
}

/// Run `job` on `worker_id` and report the outcome back to the engine.
pub async fn start(
    worker_id: u64,
    job: Job,
    controller: Arc<PipelineController>,
    cancel_token: CancellationToken,
    send_to_server: UnboundedSender<WorkMessage>,
) {
    let heartbeat = Heartbeat::new(worker_id, job.id, send_to_server.clone());
    let started = Instant::now();
    let outcome = controller.process(&job, &heartbeat, &cancel_token).await;
    let elapsed = started.elapsed();

    match &outcome {
        Ok(report) => debug!(
            message = "Conversion finished",
            elapsed_ms = elapsed.as_millis() as u64,
            warnings = report.summary.warnings,
            errors = report.summary.errors
        ),
        Err(err) => debug!(message = "Conversion failed", error = %err),
    }

    let result = send_to_server.send(WorkMessage::Finished {
        worker_id,
        job_id: job.id,
        elapsed,
        outcome,
    });
    if result.is_err() {
        info!("Engine stopped before the job finished, dropping result");
    }
}
