//! Error types for worker operations.

use crate::binlog::BinlogError;
use crate::config::ConfigError;
use crate::stage::Stage;
use crate::store::StoreError;
use crate::subtask::PipelineError;
use thiserror::Error;

/// Errors surfaced by [`Worker`](super::Worker) operations.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker was closed; no mutation takes effect anymore.
    #[error("worker already closed")]
    AlreadyClosed,

    /// No subtask is recorded under the given name.
    #[error("sub task {0} not found")]
    SubTaskNotFound(String),

    /// A new subtask cannot start while relay files are being evicted.
    #[error("relay purger is purging, sub task {0} cannot start")]
    RelayPurging(String),

    /// The operation is not legal in the subject's current stage.
    #[error("operation {op} is invalid for sub task {task}")]
    InvalidTaskOp { task: String, op: String },

    /// The relay operation is not legal in the relay's current stage.
    #[error("relay operation {op} is invalid in stage {stage}")]
    InvalidRelayOp { op: &'static str, stage: Stage },

    /// Relay was enabled twice for the same worker.
    #[error("relay already enabled")]
    RelayEnabled,

    /// A stage event demanded a task whose config is absent from the store.
    #[error("config for sub task {0} missing from the store")]
    SubTaskConfigMissing(String),

    /// Reading subtask checkpoints did not finish within the deadline.
    #[error("checkpoint read timed out after {0:?}")]
    CheckpointTimeout(std::time::Duration),

    /// No relay directory is configured.
    #[error("relay directory is not set")]
    RelayDirNotSet,

    /// An eviction pass is already running.
    #[error("a relay purge pass is already in progress")]
    PurgeInProgress,

    /// An interceptor vetoed the purge pass.
    #[error("purge forbidden: {0}")]
    PurgeForbidden(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Binlog(#[from] BinlogError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("relay purge io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// True when the underlying store error calls for a resync.
    pub fn is_retryable_store(&self) -> bool {
        matches!(self, WorkerError::Store(err) if err.is_retryable())
    }
}
