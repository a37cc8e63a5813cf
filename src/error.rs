use thiserror::Error;

#[derive(Error, Debug)]
pub enum CronError {
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Invalid cron expression {expr:?}: {reason}")]
    InvalidCronExpr { expr: String, reason: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(#[from] etcd_client::Error),

    #[error("Session lost")]
    SessionLost,

    #[error("No workers available")]
    NoWorkersAvailable,

    #[error("lock not acquired: {0}")]
    LockNotAcquired(String),

    #[error("No executor registered for kind: {0}")]
    UnknownExecutorKind(String),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CronError>;
