use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

use crate::allocator::{AllocationStrategy, ResourceSampler};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::Event;
use crate::pipeline::PipelineController;
use crate::pool::Worker;
use crate::queue::QueueStats;
use crate::server::{self, Command};
use crate::{ConversionRequest, Job, JobFilter, CONVERSION_JOB};

const EVENT_CAPACITY: usize = 1024;

/// Cloneable front door to a running engine.
///
/// Every call is a message to the engine loop, so callers never touch queue
/// or pool state directly. The engine stops once the cancellation token fires
/// or every handle has been dropped.
#[derive(Clone)]
pub struct ConversionService {
    send_to_server: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<Event>,
    stopped: CancellationToken,
}

impl ConversionService {
    /// Spawn the engine and return a handle to it along with the engine task.
    pub fn start(
        config: OrchestratorConfig,
        controller: PipelineController,
        sampler: Box<dyn ResourceSampler>,
        cancel_token: CancellationToken,
    ) -> (Self, JoinHandle<anyhow::Result<()>>) {
        let (send_to_server, recv_from_client) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let stopped = CancellationToken::new();

        let engine = {
            let events = events.clone();
            let stopped = stopped.clone();
            tokio::spawn(
                async move {
                    let _stopped = stopped.drop_guard();
                    let result = server::serve(
                        cancel_token,
                        config,
                        Arc::new(controller),
                        sampler,
                        recv_from_client,
                        events,
                    )
                    .await;
                    if let Err(err) = &result {
                        error!("Engine failed: {:#}", err);
                    }
                    result
                }
                .instrument(info_span!("engine")),
            )
        };

        (
            Self {
                send_to_server,
                events,
                stopped,
            },
            engine,
        )
    }

    /// Every queue and pool event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send_to_server
            .send(command(reply))
            .map_err(|_| OrchestratorError::EngineStopped)?;
        response.await.map_err(|_| OrchestratorError::EngineStopped)
    }

    /// Queue a mod archive for conversion.
    #[instrument(skip(self), fields(input = %request.input_path))]
    pub async fn queue_conversion(
        &self,
        request: &ConversionRequest,
        priority: Option<i32>,
    ) -> Result<Uuid> {
        let data = serde_json::to_value(request)?;
        self.add_job(CONVERSION_JOB, data, priority).await
    }

    pub async fn add_job(
        &self,
        job_type: impl Into<String>,
        data: serde_json::Value,
        priority: Option<i32>,
    ) -> Result<Uuid> {
        let job_type = job_type.into();
        self.request(|reply| Command::AddJob {
            job_type,
            data,
            priority,
            reply,
        })
        .await?
        .ok_or(OrchestratorError::QueueFull)
    }

    pub async fn get_job_status(&self, id: Uuid) -> Result<Option<Job>> {
        self.request(|reply| Command::GetJob { id, reply }).await
    }

    pub async fn get_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        self.request(|reply| Command::GetJobs { filter, reply }).await
    }

    /// False when the job is unknown or already finished.
    pub async fn cancel_job(&self, id: Uuid) -> Result<bool> {
        self.request(|reply| Command::CancelJob { id, reply }).await
    }

    pub async fn update_job_priority(&self, id: Uuid, priority: i32) -> Result<bool> {
        self.request(|reply| Command::UpdatePriority {
            id,
            priority,
            reply,
        })
        .await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    pub async fn workers(&self) -> Result<Vec<Worker>> {
        self.request(|reply| Command::Workers { reply }).await
    }

    pub async fn set_max_concurrent(&self, max_concurrent: usize) -> Result<()> {
        self.request(|reply| Command::SetMaxConcurrent {
            max_concurrent,
            reply,
        })
        .await
    }

    pub async fn set_strategy(&self, strategy: Box<dyn AllocationStrategy>) -> Result<()> {
        self.request(|reply| Command::SetStrategy { strategy, reply })
            .await
    }

    pub async fn set_pool_bounds(&self, min_workers: usize, max_workers: usize) -> Result<bool> {
        self.request(|reply| Command::SetPoolBounds {
            min_workers,
            max_workers,
            reply,
        })
        .await
    }

    /// Resolve once the job reached a terminal status. `None` for unknown ids.
    pub async fn wait_for_job(&self, id: Uuid) -> Result<Option<Job>> {
        let mut events = self.subscribe();
        loop {
            match self.get_job_status(id).await? {
                None => return Ok(None),
                Some(job) if job.status.is_terminal() => return Ok(Some(job)),
                Some(_) => {}
            }

            loop {
                tokio::select! {
                    _ = self.stopped.cancelled() => return Err(OrchestratorError::EngineStopped),
                    event = events.recv() => match event {
                        Ok(event) if event.is_terminal() && event.job_id() == Some(id) => break,
                        Ok(_) => {}
                        // Missed events, check the job again
                        Err(RecvError::Lagged(_)) => break,
                        Err(RecvError::Closed) => return Err(OrchestratorError::EngineStopped),
                    },
                }
            }
        }
    }
}
