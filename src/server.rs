use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

use crate::allocator::{self, AllocationStrategy, ResourceAllocator, ResourceSampler, SystemResources};
use crate::config::OrchestratorConfig;
use crate::events::{Event, EventSink};
use crate::persistence::SnapshotStore;
use crate::pipeline::PipelineController;
use crate::pool::{Worker, WorkerPool};
use crate::queue::{JobQueue, QueueStats};
use crate::worker::{self, WorkMessage};
use crate::{Job, JobFilter, Status};

/// Requests from [`crate::service::ConversionService`] handles.
pub enum Command {
    AddJob {
        job_type: String,
        data: serde_json::Value,
        priority: Option<i32>,
        reply: oneshot::Sender<Option<Uuid>>,
    },
    GetJob {
        id: Uuid,
        reply: oneshot::Sender<Option<Job>>,
    },
    GetJobs {
        filter: JobFilter,
        reply: oneshot::Sender<Vec<Job>>,
    },
    CancelJob {
        id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    UpdatePriority {
        id: Uuid,
        priority: i32,
        reply: oneshot::Sender<bool>,
    },
    Stats {
        reply: oneshot::Sender<QueueStats>,
    },
    Workers {
        reply: oneshot::Sender<Vec<Worker>>,
    },
    SetMaxConcurrent {
        max_concurrent: usize,
        reply: oneshot::Sender<()>,
    },
    SetStrategy {
        strategy: Box<dyn AllocationStrategy>,
        reply: oneshot::Sender<()>,
    },
    SetPoolBounds {
        min_workers: usize,
        max_workers: usize,
        reply: oneshot::Sender<bool>,
    },
}

/// Debounced snapshot writes.
struct Snapshots {
    send_to_writer: mpsc::UnboundedSender<Vec<Job>>,
    writer: tokio::task::JoinHandle<()>,
    debounce: std::time::Duration,
    deadline: Option<tokio::time::Instant>,
}

/// Everything the event loop owns. Only the loop touches it, which is what
/// keeps every job and worker record single-writer.
struct Engine {
    queue: JobQueue,
    pool: WorkerPool,
    allocator: ResourceAllocator,
    controller: Arc<PipelineController>,
    running: HashMap<Uuid, CancellationToken>,
    cancel_token: CancellationToken,
    send_to_server: mpsc::UnboundedSender<WorkMessage>,
    publish: broadcast::Sender<Event>,
}

impl Engine {
    fn handle_command(&mut self, command: Command) {
        // A dropped reply receiver only means the caller stopped waiting.
        match command {
            Command::AddJob {
                job_type,
                data,
                priority,
                reply,
            } => {
                let _ = reply.send(self.queue.add_job(job_type, data, priority));
            }
            Command::GetJob { id, reply } => {
                let _ = reply.send(self.queue.get_job(&id).cloned());
            }
            Command::GetJobs { filter, reply } => {
                let jobs = self.queue.get_jobs(&filter).into_iter().cloned().collect();
                let _ = reply.send(jobs);
            }
            Command::CancelJob { id, reply } => {
                let cancelled = self.queue.cancel_job(&id);
                if cancelled {
                    self.untrack(&id);
                }
                let _ = reply.send(cancelled);
            }
            Command::UpdatePriority {
                id,
                priority,
                reply,
            } => {
                let _ = reply.send(self.queue.update_job_priority(&id, priority));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.queue.get_stats());
            }
            Command::Workers { reply } => {
                let _ = reply.send(self.pool.workers().cloned().collect());
            }
            Command::SetMaxConcurrent {
                max_concurrent,
                reply,
            } => {
                self.queue.set_max_concurrent(max_concurrent);
                let _ = reply.send(());
            }
            Command::SetStrategy { strategy, reply } => {
                self.allocator.set_strategy(strategy);
                self.rescale();
                let _ = reply.send(());
            }
            Command::SetPoolBounds {
                min_workers,
                max_workers,
                reply,
            } => {
                let accepted = self.allocator.set_bounds(min_workers, max_workers);
                if accepted {
                    info!(min_workers, max_workers, "Updated worker bounds");
                    self.rescale();
                } else {
                    warn!(min_workers, max_workers, "Rejected invalid worker bounds");
                }
                let _ = reply.send(accepted);
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        if let Event::JobProcess { job } = &event {
            self.start_job(job);
        }
        let _ = self.publish.send(event);
    }

    /// Bind a dispatched job to a worker and a resource grant, then spawn its
    /// conversion. Either shortage holds the job back in pending until a
    /// worker or resources free up, and its slot goes to the next job.
    fn start_job(&mut self, job: &Job) {
        if self.queue.get_job(&job.id).map(|j| j.status) != Some(Status::Processing) {
            debug!(job_id = %job.id, "Job left processing before it was started");
            return;
        }

        let Some(worker_id) = self.pool.assign(job, Instant::now()) else {
            debug!(job_id = %job.id, job_type = %job.job_type, "No idle worker, requeueing job");
            self.queue.requeue_job(&job.id);
            return;
        };

        if let Err(err) = self.allocator.allocate(job.id) {
            debug!(job_id = %job.id, error = %err, "Resources exhausted, requeueing job");
            self.pool.detach_job(&job.id);
            self.queue.requeue_job(&job.id);
            return;
        }

        let token = self.cancel_token.child_token();
        self.running.insert(job.id, token.clone());
        tokio::spawn(
            worker::start(
                worker_id,
                job.clone(),
                self.controller.clone(),
                token,
                self.send_to_server.clone(),
            )
            .instrument(info_span!("worker", worker_id, job_id = %job.id)),
        );
    }

    fn handle_work_message(&mut self, message: WorkMessage) {
        match message {
            WorkMessage::Heartbeat { worker_id, job_id } => {
                self.pool.heartbeat(worker_id, &job_id, Instant::now());
            }
            WorkMessage::Finished {
                worker_id,
                job_id,
                elapsed,
                outcome,
            } => {
                if !self.pool.release(worker_id, &job_id, outcome.is_ok(), elapsed) {
                    debug!(worker_id, job_id = %job_id, "Discarding result of detached job");
                    return;
                }
                self.running.remove(&job_id);
                self.allocator.release(&job_id);
                self.queue.release_held();

                match outcome.map(|report| serde_json::to_value(&report)) {
                    Ok(Ok(result)) => {
                        self.queue.complete_job(&job_id, result);
                    }
                    Ok(Err(err)) => {
                        self.queue
                            .fail_job(&job_id, format!("failed to encode conversion report: {err}"));
                    }
                    Err(err) => {
                        self.queue.fail_job(&job_id, err.job_error());
                    }
                }
            }
        }
    }

    /// Heartbeat watchdog pass.
    fn check_workers(&mut self) {
        let now = Instant::now();
        for (worker_id, job_id) in self.pool.check_heartbeats(now) {
            if let Some(token) = self.running.remove(&job_id) {
                token.cancel();
            }
            self.allocator.release(&job_id);
            self.queue
                .fail_job(&job_id, format!("worker {worker_id} heartbeat timed out"));
        }
        if !self.pool.recover(now).is_empty() {
            self.queue.release_held();
        }
    }

    fn rebalance(&mut self, sample: anyhow::Result<SystemResources>) {
        self.allocator.update(sample);
        self.rescale();
    }

    fn rescale(&mut self) {
        let target = self.allocator.target_workers(&self.queue.get_stats());
        self.pool.scale_pool(target);
        self.queue.release_held();
        self.queue.process_next_jobs();
    }

    /// Forget a job that left processing outside the worker path.
    fn untrack(&mut self, job_id: &Uuid) {
        if let Some(token) = self.running.remove(job_id) {
            token.cancel();
        }
        self.pool.detach_job(job_id);
        self.allocator.release(job_id);
        self.queue.release_held();
    }
}

pub async fn serve(
    cancel_token: CancellationToken,
    config: OrchestratorConfig,
    controller: Arc<PipelineController>,
    sampler: Box<dyn ResourceSampler>,
    mut recv_from_client: mpsc::UnboundedReceiver<Command>,
    publish: broadcast::Sender<Event>,
) -> Result<(), Error> {
    let (send_event, mut recv_events) = mpsc::unbounded_channel::<Event>();
    let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
    let (send_sample, mut recv_samples) = mpsc::unbounded_channel();

    let events = EventSink::new(send_event);
    let mut engine = Engine {
        queue: JobQueue::new(config.queue.clone(), events.clone()),
        pool: WorkerPool::new(&config.pool, events),
        allocator: ResourceAllocator::new(&config.allocator),
        controller,
        running: HashMap::new(),
        cancel_token: cancel_token.clone(),
        send_to_server,
        publish,
    };

    let mut snapshots = None;
    if config.persistence.enabled {
        let store = SnapshotStore::new(&config.persistence.file_path);
        // Resubmit jobs from the last run; processing ones go back to pending
        match store.load().await {
            Ok(Some(jobs)) => engine.queue.restore(jobs),
            Ok(None) => {}
            Err(err) => error!(message = "Failed to load queue snapshot", error = ?err),
        }
        let (send_to_writer, writer) = store.spawn_writer();
        snapshots = Some(Snapshots {
            send_to_writer,
            writer,
            debounce: config.persistence.debounce(),
            deadline: None,
        });
    }

    let sampler_task = tokio::spawn(
        allocator::run_sampler(
            cancel_token.clone(),
            sampler,
            config.allocator.check_interval(),
            send_sample,
        )
        .instrument(info_span!("sampler")),
    );

    let mut watchdog = tokio::time::interval(config.pool.heartbeat_interval());
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        max_concurrent = engine.queue.max_concurrent(),
        workers = engine.pool.size(),
        strategy = engine.allocator.strategy_name(),
        "Engine started"
    );

    loop {
        if let Some(snapshots) = snapshots.as_mut() {
            if engine.queue.take_dirty() {
                snapshots.deadline = Some(tokio::time::Instant::now() + snapshots.debounce);
            }
        }
        let persist_at = snapshots.as_ref().and_then(|s| s.deadline);

        // Waiting for something to else to happen to continue...
        tokio::select! {
            // Handle cancellation
            _ = cancel_token.cancelled() => {
                debug!("Engine Cancelled");
                break;
            },
            // Handle requests from clients
            chan_msg = recv_from_client.recv() => {
                match chan_msg {
                    None => {
                        debug!("All service handles dropped, exiting");
                        break;
                    },
                    Some(command) => engine.handle_command(command),
                }
            },
            // Handle reports from running jobs
            Some(message) = recv_from_worker.recv() => engine.handle_work_message(message),
            // Handle queue and pool state changes
            Some(event) = recv_events.recv() => engine.handle_event(event),
            Some(sample) = recv_samples.recv() => engine.rebalance(sample),
            _ = watchdog.tick() => engine.check_workers(),
            _ = tokio::time::sleep_until(persist_at.unwrap_or_else(tokio::time::Instant::now)), if persist_at.is_some() => {
                if let Some(snapshots) = snapshots.as_mut() {
                    snapshots.deadline = None;
                    if snapshots.send_to_writer.send(engine.queue.snapshot()).is_err() {
                        error!("Snapshot writer stopped unexpectedly");
                    }
                }
            },
        }
    }

    cancel_token.cancel();

    // Flush whatever is still pending before exiting
    if let Some(snapshots) = snapshots {
        let _ = snapshots.send_to_writer.send(engine.queue.snapshot());
        drop(snapshots.send_to_writer);
        snapshots.writer.await?;
    }
    sampler_task.await?;

    let in_flight = engine.running.len();
    if in_flight > 0 {
        info!(in_flight, "Abandoning in-flight conversions");
    }
    info!("Engine stopped.");

    Ok(())
}
