//! Coordination-store client abstraction.
//!
//! The control plane records the expected stage of the relay and of every
//! subtask in a replicated store with linearizable reads and revision-ordered
//! watches. The worker only consumes three families of keys: the per-source
//! relay stage, per-task subtask stages, and per-task subtask configs.
//!
//! Watch producers own their channel senders: a producer sends events and
//! errors until it is cancelled or fails, then returns, dropping the senders
//! and thereby closing both channels. Consumers never close channels.

mod memory;

pub use memory::MemStore;

use crate::config::SubTaskConfig;
use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Store revision. Every committed write carries a unique, increasing one.
pub type Revision = i64;

/// An expected-stage record read or watched from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedStage {
    /// Source the record belongs to.
    pub source: String,
    /// Task name; empty for the relay record.
    pub task: String,
    /// Target stage the local subject must converge to.
    pub expect: Stage,
    /// Deletion tombstone: the subject should be stopped and removed.
    pub is_deleted: bool,
    /// Revision the record was committed at.
    pub revision: Revision,
}

impl ExpectedStage {
    pub fn relay(source: impl Into<String>, expect: Stage, revision: Revision) -> Self {
        Self {
            source: source.into(),
            task: String::new(),
            expect,
            is_deleted: false,
            revision,
        }
    }

    pub fn subtask(
        source: impl Into<String>,
        task: impl Into<String>,
        expect: Stage,
        revision: Revision,
    ) -> Self {
        Self {
            source: source.into(),
            task: task.into(),
            expect,
            is_deleted: false,
            revision,
        }
    }

    /// A deletion tombstone for the same subject.
    pub fn deleted(mut self) -> Self {
        self.is_deleted = true;
        self.expect = Stage::Stopped;
        self
    }
}

/// Errors surfaced by the store client.
///
/// The retryable family tells a watcher to resynchronize from a fresh
/// revision instead of giving up.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The watched revision window was compacted away.
    #[error("store history compacted at revision {0}")]
    Compacted(Revision),
    /// The store leadership moved; in-flight requests were dropped.
    #[error("store leader changed")]
    LeaderChanged,
    /// The connection to the store was reset.
    #[error("store connection reset")]
    ConnectionReset,
    /// A stored payload failed to decode.
    #[error("invalid payload under {key}: {reason}")]
    InvalidPayload { key: String, reason: String },
    /// Unrecoverable store failure.
    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl StoreError {
    /// True for the recoverable-error family: the caller should resync and
    /// re-watch from a fresh revision.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Compacted(_) | StoreError::LeaderChanged | StoreError::ConnectionReset
        )
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Client view of the coordination store.
///
/// Reads return the payload together with the revision it was observed at, so
/// that a follow-up watch can start from `revision + 1` without a gap.
pub trait StoreClient: Send + Sync + 'static {
    /// Reads the relay expected stage for a source. `None` when no record
    /// exists.
    fn get_relay_stage(
        &self,
        source: &str,
    ) -> Result<(Option<ExpectedStage>, Revision), StoreError>;

    /// Reads all subtask expected stages and configs for a source at one
    /// revision.
    #[allow(clippy::type_complexity)]
    fn get_subtask_stages_and_configs(
        &self,
        source: &str,
    ) -> Result<
        (
            HashMap<String, ExpectedStage>,
            HashMap<String, SubTaskConfig>,
            Revision,
        ),
        StoreError,
    >;

    /// Reads one subtask config as of `revision`.
    fn get_subtask_config(
        &self,
        source: &str,
        task: &str,
        revision: Revision,
    ) -> Result<Option<SubTaskConfig>, StoreError>;

    /// Streams relay expected-stage records committed at or after
    /// `from_revision` until cancelled. The returned future is the producer;
    /// it owns both senders and drops them on exit.
    fn watch_relay_stage(
        &self,
        source: &str,
        from_revision: Revision,
        stage_tx: mpsc::Sender<ExpectedStage>,
        err_tx: mpsc::Sender<StoreError>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, ()>;

    /// Streams subtask expected-stage records committed at or after
    /// `from_revision` until cancelled.
    fn watch_subtask_stage(
        &self,
        source: &str,
        from_revision: Revision,
        stage_tx: mpsc::Sender<ExpectedStage>,
        err_tx: mpsc::Sender<StoreError>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(StoreError::Compacted(7).is_retryable());
        assert!(StoreError::LeaderChanged.is_retryable());
        assert!(StoreError::ConnectionReset.is_retryable());
        assert!(!StoreError::Fatal("boom".into()).is_retryable());
        assert!(!StoreError::InvalidPayload {
            key: "k".into(),
            reason: "bad json".into()
        }
        .is_retryable());
    }

    #[test]
    fn tombstone_carries_stopped_expectation() {
        let stage = ExpectedStage::subtask("s1", "t1", Stage::Running, 4).deleted();
        assert!(stage.is_deleted);
        assert_eq!(stage.expect, Stage::Stopped);
    }
}
