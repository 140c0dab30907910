use overture_events::{StoreError, SubmitError};

/// Daemon-side error type. Adapter-stream failures are not represented
/// here; they surface as `Error` canonical events on the run's stream.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid submit: {0}")]
    Submit(#[from] SubmitError),

    #[error("unknown project: {0}")]
    ProjectUnknown(String),

    #[error("orchestrator for project {0} is gone")]
    OrchestratorGone(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
