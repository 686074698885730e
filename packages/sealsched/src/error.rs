use std::io;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("worker rpc: {0}")]
    Rpc(String),

    #[error("worker session invalidated")]
    SessionInvalidated,

    #[error("worker already closed")]
    WorkerClosed,

    #[error("worker not found: {0}")]
    WorkerNotFound(Uuid),

    #[error("prepare failed: {0}")]
    PrepareFailed(String),

    #[error("work failed: {0}")]
    WorkFailed(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("scheduler closed")]
    SchedulerClosed,

    #[error("unknown proof size: {0}")]
    UnknownProofSize(String),

    #[error("no schedulable workers in group: {0}")]
    GroupUnschedulable(String),

    #[error("sector not found: {0}")]
    SectorNotFound(u64),

    #[error("sector {0} already bound to group {1}")]
    GroupUnchanged(u64, String),

    #[error("invalid worker parameter {0}: {1}")]
    InvalidParam(String, String),

    #[error("persisting group index: {0}")]
    Persistence(#[from] io::Error),

    #[error("encoding group index: {0}")]
    Encode(#[from] serde_json::Error),
}
