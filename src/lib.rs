use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod allocator;
pub mod config;
pub mod error;
pub mod events;
pub mod ingest;
pub mod persistence;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod server;
pub mod service;
pub mod telemetry;
pub mod worker;

/// Job type used for mod archive conversions.
pub const CONVERSION_JOB: &str = "conversion";

/// What a caller asks to have converted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRequest {
    /// Path to the Java-Edition mod archive (.jar / .zip).
    pub input_path: String,
    /// Directory the Bedrock addon package is written to.
    pub output_dir: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

/// A unit of work tracked by the [`queue::JobQueue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub data: serde_json::Value,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    pub fn new(job_type: impl Into<String>, data: serde_json::Value, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            data,
            priority,
            created_at: Utc::now(),
            status: Status::Pending,
            result: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl Status {
    /// No transition leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Pending => write!(f, "pending"),
            Status::Processing => write!(f, "processing"),
            Status::Completed => write!(f, "completed"),
            Status::Failed => write!(f, "failed"),
            Status::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Selects jobs by status and/or type. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<Status>,
    pub job_type: Option<String>,
}

impl JobFilter {
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            job_type: None,
        }
    }

    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.job_type.as_deref().map_or(true, |t| job.job_type == t)
    }
}
