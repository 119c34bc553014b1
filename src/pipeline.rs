//! Multi-stage conversion driven for each dispatched job.
//!
//! The actual Java-to-Bedrock translation lives in collaborators registered
//! per [`Stage`]. The controller only sequences them, threads their outputs
//! along, collects their notes, and turns the outcome into a job result or a
//! job error.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::worker::Heartbeat;
use crate::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Ingestion,
    Assets,
    Configuration,
    Logic,
    Packaging,
    Validation,
}

impl Stage {
    /// Execution order.
    pub const ALL: [Stage; 6] = [
        Stage::Ingestion,
        Stage::Assets,
        Stage::Configuration,
        Stage::Logic,
        Stage::Packaging,
        Stage::Validation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Ingestion => "ingestion",
            Stage::Assets => "assets",
            Stage::Configuration => "configuration",
            Stage::Logic => "logic",
            Stage::Packaging => "packaging",
            Stage::Validation => "validation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

/// A remark a stage makes about the conversion that does not stop it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Note {
    pub severity: Severity,
    pub message: String,
}

impl Note {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }
}

/// What a collaborator hands back for its stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub output: serde_json::Value,
    pub notes: Vec<Note>,
}

impl StageOutput {
    pub fn new(output: serde_json::Value) -> Self {
        Self {
            output,
            notes: vec![],
        }
    }

    pub fn with_note(mut self, note: Note) -> Self {
        self.notes.push(note);
        self
    }
}

/// Unrecoverable stage failure.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct StageError {
    pub message: String,
}

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for StageError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// What a collaborator sees while running.
pub struct StageContext<'a> {
    pub job: &'a Job,
    /// Outputs of the stages that already ran.
    pub outputs: &'a BTreeMap<Stage, serde_json::Value>,
    heartbeat: &'a Heartbeat,
    cancel_token: &'a CancellationToken,
}

impl StageContext<'_> {
    /// Tell the watchdog the job is still making progress.
    pub fn heartbeat(&self) {
        self.heartbeat.beat();
    }

    /// Fires when the job was cancelled; the result will be discarded.
    pub fn cancel_token(&self) -> &CancellationToken {
        self.cancel_token
    }

    /// Deserialize the job payload.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, StageError> {
        serde_json::from_value(self.job.data.clone())
            .map_err(|e| StageError::new(format!("invalid job payload: {e}")))
    }
}

#[async_trait]
pub trait StageCollaborator: Send + Sync {
    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutput, StageError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Completed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub duration_ms: u64,
    pub output: serde_json::Value,
    pub notes: Vec<Note>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NoteSummary {
    pub errors: usize,
    pub warnings: usize,
    /// Error and warning counts keyed by stage name.
    pub by_stage: BTreeMap<String, (usize, usize)>,
}

/// Result stored on a completed conversion job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionReport {
    pub stages: Vec<StageReport>,
    pub summary: NoteSummary,
}

impl ConversionReport {
    fn summarize(stages: Vec<StageReport>) -> Self {
        let mut summary = NoteSummary::default();
        for report in &stages {
            let errors = report
                .notes
                .iter()
                .filter(|n| n.severity == Severity::Error)
                .count();
            let warnings = report
                .notes
                .iter()
                .filter(|n| n.severity == Severity::Warning)
                .count();
            summary.errors += errors;
            summary.warnings += warnings;
            if errors + warnings > 0 {
                summary
                    .by_stage
                    .insert(report.stage.to_string(), (errors, warnings));
            }
        }
        Self { stages, summary }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("stage {stage} failed: {source}")]
pub struct ConversionError {
    pub stage: Stage,
    pub source: StageError,
    /// Notes gathered before the failure.
    pub notes: Vec<Note>,
}

impl ConversionError {
    /// Text stored on the failed job: the failure followed by the notes the
    /// earlier stages made.
    pub fn job_error(&self) -> String {
        if self.notes.is_empty() {
            return self.to_string();
        }
        let notes: Vec<String> = self
            .notes
            .iter()
            .map(|n| format!("{}: {}", n.severity.as_str(), n.message))
            .collect();
        format!("{self} (earlier notes: {})", notes.join("; "))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[derive(Default, Clone)]
pub struct PipelineController {
    collaborators: BTreeMap<Stage, Arc<dyn StageCollaborator>>,
}

impl PipelineController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: Stage, collaborator: Arc<dyn StageCollaborator>) -> Self {
        self.collaborators.insert(stage, collaborator);
        self
    }

    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.collaborators.keys().copied()
    }

    /// Run every stage in order. The first stage error aborts the conversion.
    #[instrument(skip_all, fields(job_id = %job.id))]
    pub async fn process(
        &self,
        job: &Job,
        heartbeat: &Heartbeat,
        cancel_token: &CancellationToken,
    ) -> Result<ConversionReport, ConversionError> {
        let mut outputs = BTreeMap::new();
        let mut reports = Vec::with_capacity(Stage::ALL.len());

        for stage in Stage::ALL {
            heartbeat.beat();
            if cancel_token.is_cancelled() {
                return Err(ConversionError {
                    stage,
                    source: StageError::new("conversion cancelled"),
                    notes: reports.into_iter().flat_map(|r: StageReport| r.notes).collect(),
                });
            }

            let Some(collaborator) = self.collaborators.get(&stage) else {
                trace!(%stage, "No collaborator registered, skipping stage");
                reports.push(StageReport {
                    stage,
                    status: StageStatus::Skipped,
                    duration_ms: 0,
                    output: serde_json::Value::Null,
                    notes: vec![],
                });
                continue;
            };

            debug!(%stage, "Running stage");
            let started = Instant::now();
            let ctx = StageContext {
                job,
                outputs: &outputs,
                heartbeat,
                cancel_token,
            };
            let outcome = AssertUnwindSafe(collaborator.run(&ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(StageError::new(format!(
                        "collaborator panicked: {}",
                        panic_message(&*panic)
                    )))
                });
            match outcome {
                Ok(StageOutput { output, notes }) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    debug!(%stage, duration_ms, notes = notes.len(), "Stage finished");
                    outputs.insert(stage, output.clone());
                    reports.push(StageReport {
                        stage,
                        status: StageStatus::Completed,
                        duration_ms,
                        output,
                        notes,
                    });
                }
                Err(err) => {
                    warn!(%stage, error = %err, "Stage failed");
                    return Err(ConversionError {
                        stage,
                        source: err,
                        notes: reports.into_iter().flat_map(|r| r.notes).collect(),
                    });
                }
            }
        }
        heartbeat.beat();

        Ok(ConversionReport::summarize(reports))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkMessage;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct Fixed(StageOutput);

    #[async_trait]
    impl StageCollaborator for Fixed {
        async fn run(&self, _ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    #[async_trait]
    impl StageCollaborator for Failing {
        async fn run(&self, _ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
            Err(StageError::new("unsupported model format"))
        }
    }

    /// Records which earlier outputs it could see.
    struct Seen(AtomicUsize);

    #[async_trait]
    impl StageCollaborator for Seen {
        async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
            self.0.store(ctx.outputs.len(), Ordering::SeqCst);
            ctx.heartbeat();
            Ok(StageOutput::new(json!("packaged")))
        }
    }

    fn heartbeat() -> (Heartbeat, mpsc::UnboundedReceiver<WorkMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Heartbeat::new(1, uuid::Uuid::new_v4(), tx), rx)
    }

    #[tokio::test]
    async fn runs_stages_in_order_and_summarizes_notes() {
        let seen = Arc::new(Seen(AtomicUsize::new(0)));
        let controller = PipelineController::new()
            .with_stage(
                Stage::Assets,
                Arc::new(Fixed(
                    StageOutput::new(json!({"textures": 12}))
                        .with_note(Note::warning("missing texture: foo.png"))
                        .with_note(Note::info("converted 12 textures")),
                )),
            )
            .with_stage(
                Stage::Ingestion,
                Arc::new(Fixed(StageOutput::new(json!({"mod_id": "example"})))),
            )
            .with_stage(Stage::Packaging, seen.clone())
            .with_stage(
                Stage::Validation,
                Arc::new(Fixed(
                    StageOutput::new(json!(null)).with_note(Note::error("manifest uuid reused")),
                )),
            );

        let job = Job::new("conversion", json!({}), 1);
        let (hb, mut rx) = heartbeat();
        let report = controller
            .process(&job, &hb, &CancellationToken::new())
            .await
            .unwrap();

        let order: Vec<Stage> = report.stages.iter().map(|r| r.stage).collect();
        assert_eq!(order, Stage::ALL.to_vec());
        assert_eq!(report.stages[2].status, StageStatus::Skipped);
        assert_eq!(report.stages[1].output, json!({"textures": 12}));
        assert_eq!(seen.0.load(Ordering::SeqCst), 2);

        assert_eq!(report.summary.errors, 1);
        assert_eq!(report.summary.warnings, 1);
        assert_eq!(report.summary.by_stage.get("assets"), Some(&(0, 1)));
        assert_eq!(report.summary.by_stage.get("validation"), Some(&(1, 0)));

        let mut beats = 0;
        while let Ok(WorkMessage::Heartbeat { .. }) = rx.try_recv() {
            beats += 1;
        }
        assert!(beats >= 7);
    }

    #[tokio::test]
    async fn stage_error_aborts_conversion() {
        let controller = PipelineController::new()
            .with_stage(
                Stage::Ingestion,
                Arc::new(Fixed(
                    StageOutput::new(json!(1)).with_note(Note::warning("old loader")),
                )),
            )
            .with_stage(Stage::Logic, Arc::new(Failing))
            .with_stage(Stage::Packaging, Arc::new(Fixed(StageOutput::default())));

        let job = Job::new("conversion", json!({}), 1);
        let (hb, _rx) = heartbeat();
        let err = controller
            .process(&job, &hb, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::Logic);
        assert_eq!(err.to_string(), "stage logic failed: unsupported model format");
        assert_eq!(err.notes, vec![Note::warning("old loader")]);
        assert_eq!(
            err.job_error(),
            "stage logic failed: unsupported model format (earlier notes: warning: old loader)"
        );
    }

    struct Panicking;

    #[async_trait]
    impl StageCollaborator for Panicking {
        async fn run(&self, _ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
            panic!("texture atlas overflow");
        }
    }

    #[tokio::test]
    async fn collaborator_panic_becomes_stage_error() {
        let controller = PipelineController::new()
            .with_stage(Stage::Assets, Arc::new(Panicking))
            .with_stage(Stage::Packaging, Arc::new(Fixed(StageOutput::default())));

        let job = Job::new("conversion", json!({}), 1);
        let (hb, _rx) = heartbeat();
        let err = controller
            .process(&job, &hb, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::Assets);
        assert_eq!(
            err.to_string(),
            "stage assets failed: collaborator panicked: texture atlas overflow"
        );
        assert_eq!(err.job_error(), err.to_string());
    }

    #[tokio::test]
    async fn cancelled_conversion_stops_before_next_stage() {
        let controller = PipelineController::new()
            .with_stage(Stage::Ingestion, Arc::new(Fixed(StageOutput::default())));
        let job = Job::new("conversion", json!({}), 1);
        let (hb, _rx) = heartbeat();
        let token = CancellationToken::new();
        token.cancel();

        let err = controller.process(&job, &hb, &token).await.unwrap_err();
        assert_eq!(err.stage, Stage::Ingestion);
    }

    #[test]
    fn payload_decodes_conversion_request() {
        let request = crate::ConversionRequest {
            input_path: "mods/example.jar".into(),
            output_dir: "out".into(),
            options: json!({"minify": true}),
        };
        let job = Job::new("conversion", serde_json::to_value(&request).unwrap(), 1);
        let (hb, _rx) = heartbeat();
        let token = CancellationToken::new();
        let outputs = BTreeMap::new();
        let ctx = StageContext {
            job: &job,
            outputs: &outputs,
            heartbeat: &hb,
            cancel_token: &token,
        };
        let decoded: crate::ConversionRequest = ctx.payload().unwrap();
        assert_eq!(decoded, request);
    }
}
