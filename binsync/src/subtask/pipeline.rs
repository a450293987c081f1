//! Contract between a subtask and the migration pipeline driving its data.
//!
//! The pipeline itself (binlog reading, SQL apply, checkpointing) lives
//! outside this crate. The worker only drives it through this trait and
//! observes its outcome.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failure reported by a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct PipelineError {
    pub message: String,
    /// Whether the checker may retry the task automatically.
    pub resumable: bool,
}

impl PipelineError {
    /// A transient failure the checker may auto-resume from.
    pub fn resumable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            resumable: true,
        }
    }

    /// A failure that needs operator intervention.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            resumable: false,
        }
    }
}

/// Outcome of the most recent pipeline run of a subtask or the relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResult {
    /// The run was cancelled by an operation rather than by a failure.
    pub is_canceled: bool,
    pub error: Option<PipelineError>,
}

impl ProcessResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn canceled() -> Self {
        Self {
            is_canceled: true,
            error: None,
        }
    }

    pub fn failed(error: PipelineError) -> Self {
        Self {
            is_canceled: false,
            error: Some(error),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }

    /// True when the checker is allowed to retry the task.
    pub fn can_auto_resume(&self) -> bool {
        !self.is_canceled && self.error.as_ref().is_some_and(|e| e.resumable)
    }
}

/// Schema operation against one upstream table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaOp {
    Get,
    Set,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRequest {
    pub task: String,
    pub database: String,
    pub table: String,
    pub op: SchemaOp,
    /// Schema body for `Set`; ignored otherwise.
    pub schema: Option<String>,
}

/// Manual intervention on a replication error the pipeline is stuck on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorOp {
    Skip,
    Replace,
    Revert,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleErrorRequest {
    pub task: String,
    pub op: ErrorOp,
    /// Binlog position the intervention applies to; the current one if empty.
    pub binlog_pos: Option<String>,
    /// Replacement statements for `Replace`.
    pub sqls: Vec<String>,
}

/// A migration pipeline bound to one subtask config.
///
/// `run` executes until the pipeline finishes its work, fails, or `cancel`
/// fires; a cancelled run must return promptly and its outcome is discarded.
/// A pipeline may be run again after a cancelled or failed run, including
/// after `operate_schema`/`handle_error` calls made while paused.
pub trait Pipeline: Send + Sync + 'static {
    fn run(
        &self,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + '_>>;

    fn operate_schema(&self, req: &SchemaRequest) -> Result<String, PipelineError>;

    fn handle_error(&self, req: &HandleErrorRequest) -> Result<(), PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_resume_requires_resumable_failure() {
        assert!(ProcessResult::failed(PipelineError::resumable("deadlock")).can_auto_resume());
        assert!(!ProcessResult::failed(PipelineError::fatal("bad ddl")).can_auto_resume());
        assert!(!ProcessResult::canceled().can_auto_resume());
        assert!(!ProcessResult::success().can_auto_resume());
    }

    #[test]
    fn result_serializes_for_status_payloads() {
        let result = ProcessResult::failed(PipelineError::resumable("lost connection"));
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("lost connection"));
        assert!(json.contains("\"resumable\":true"));
    }
}
