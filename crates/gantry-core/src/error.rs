//! Error types for Gantry CD.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Material resolution errors
    #[error("Material source unreachable: {material}: {reason}")]
    MaterialUnreachable { material: String, reason: String },

    #[error("Material check timed out after {seconds}s: {material}")]
    MaterialTimeout { material: String, seconds: u64 },

    #[error("Fan-in not yet consistent for pipeline: {pipeline}")]
    FanInInconsistent { pipeline: String },

    #[error("Requested revision {revision} not known for material {material}")]
    UnknownRevision { material: String, revision: String },

    // Pipeline / instance errors
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Stage not found: {pipeline}/{stage}")]
    StageNotFound { pipeline: String, stage: String },

    #[error("Pipeline instance not found: {pipeline}/{counter}")]
    InstanceNotFound { pipeline: String, counter: u64 },

    #[error("Stage already in progress: {pipeline}/{stage}")]
    AlreadyInProgress { pipeline: String, stage: String },

    #[error("Timeline counter regression for {pipeline}: {counter}")]
    TimelineOrder { pipeline: String, counter: u64 },

    // Dispatch errors
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already assigned: {0}")]
    JobAlreadyAssigned(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    // Guard errors
    #[error("Insufficient {location} storage: {free_bytes} bytes free, {required_bytes} required")]
    InsufficientStorage {
        location: String,
        free_bytes: u64,
        required_bytes: u64,
    },

    #[error("Operate permission denied for {user} on group {group}")]
    PermissionDenied { user: String, group: String },

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transient failures are logged and retried on the next tick,
    /// never treated as fatal by the scheduling loop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::MaterialUnreachable { .. }
                | Error::MaterialTimeout { .. }
                | Error::FanInInconsistent { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
