use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Job queue is full")]
    QueueFull,

    #[error("Engine is not running")]
    EngineStopped,

    #[error("Failed to encode job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
