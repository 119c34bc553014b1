use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Error};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

use modforge::allocator::{StrategyKind, SysinfoSampler};
use modforge::config::{OrchestratorConfig, PersistenceConfig};
use modforge::ingest::ArchiveIngestion;
use modforge::pipeline::{PipelineController, Stage};
use modforge::service::ConversionService;
use modforge::{telemetry, ConversionRequest, Status};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version)]
pub struct ConfigContext {
    #[arg(short = 'c', long = "config", help = "JSON configuration file")]
    config: Option<PathBuf>,

    #[arg(short = 'n', long = "max_concurrent", help = "Number of Active Jobs in Parallel")]
    max_concurrent: Option<usize>,

    #[arg(long = "min_workers", help = "Lower bound on the worker pool")]
    min_workers: Option<usize>,

    #[arg(long = "max_workers", help = "Upper bound on the worker pool")]
    max_workers: Option<usize>,

    #[arg(short = 's', long = "strategy", value_enum, help = "Worker allocation strategy")]
    strategy: Option<StrategyKind>,

    #[arg(short = 'p', long = "persist", help = "Keep a queue snapshot at this path")]
    persist: Option<PathBuf>,

    #[arg(long = "priority", help = "Priority of the submitted conversions")]
    priority: Option<i32>,

    #[arg(
        short = 'o',
        long = "output_dir",
        help = "Directory for the generated addons",
        default_value = "./out"
    )]
    output_dir: String,

    #[arg(long = "jaeger_endpoint", help = "Jaeger collector endpoint for trace export")]
    jaeger_endpoint: Option<String>,

    #[arg(help = "Java-Edition mod archives to convert")]
    archives: Vec<PathBuf>,
}

impl ConfigContext {
    fn load(&self) -> Result<OrchestratorConfig, Error> {
        let mut config = match &self.config {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                OrchestratorConfig::from_json(&json)
                    .with_context(|| format!("Invalid configuration in {}", path.display()))?
            }
            None => OrchestratorConfig::default(),
        };
        if let Some(n) = self.max_concurrent {
            config.queue.max_concurrent = n;
        }
        if let Some(n) = self.min_workers {
            config.allocator.min_workers = n;
        }
        if let Some(n) = self.max_workers {
            config.allocator.max_workers = n;
        }
        if let Some(strategy) = self.strategy {
            config.allocator.strategy = strategy;
        }
        if let Some(path) = &self.persist {
            config.persistence = PersistenceConfig::at(path);
        }
        Ok(config)
    }
}

#[instrument(skip_all)]
async fn setup(context: ConfigContext, cancel_token: CancellationToken) -> Result<(), Error> {
    let config = context.load()?;

    let controller =
        PipelineController::new().with_stage(Stage::Ingestion, Arc::new(ArchiveIngestion));
    let (service, engine) = ConversionService::start(
        config,
        controller,
        Box::new(SysinfoSampler::new()),
        cancel_token.clone(),
    );

    let mut events = service.subscribe();
    let event_log = tokio::spawn(
        async move {
            while let Ok(event) = events.recv().await {
                debug!(event = event.name(), job_id = ?event.job_id());
            }
        }
        .in_current_span(),
    );

    let mut job_ids = vec![];
    for archive in &context.archives {
        let request = ConversionRequest {
            input_path: archive.display().to_string(),
            output_dir: context.output_dir.clone(),
            options: serde_json::Value::Null,
        };
        let id = service.queue_conversion(&request, context.priority).await?;
        info!(job_id = %id, archive = %archive.display(), "Queued conversion");
        job_ids.push(id);
    }

    debug!("Done queueing conversions");
    let waits = job_ids.iter().map(|id| service.wait_for_job(*id));
    let finished = tokio::select! {
        _ = cancel_token.cancelled() => {
            debug!("Cancelled while waiting for conversions");
            vec![]
        },
        results = futures::future::join_all(waits) => results,
    };

    let (mut completed, mut failed) = (0, 0);
    for result in finished {
        match result {
            Ok(Some(job)) if job.status == Status::Completed => {
                completed += 1;
                info!(job_id = %job.id, "Conversion completed");
            }
            Ok(Some(job)) => {
                failed += 1;
                warn!(job_id = %job.id, status = %job.status, error = ?job.error, "Conversion did not complete");
            }
            Ok(None) => {}
            Err(err) => error!("Lost track of a conversion: {}", err),
        }
    }
    info!(completed, failed, "All conversions finished");

    println!("Waiting for engine to shutdown...");
    cancel_token.cancel();
    drop(service);
    engine.await??;
    event_log.abort();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let context = ConfigContext::parse();
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "modforge=DEBUG");
    }

    telemetry::init(context.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(context, cloned_token));

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                error!("Failed to install signal handlers");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); token.cancel()},
        }
    });
    app.await??;
    println!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
