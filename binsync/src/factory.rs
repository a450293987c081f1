//! Seam to the external pipeline and relay implementations.

use crate::binlog::BinlogLocation;
use crate::config::{SourceConfig, SubTaskConfig};
use crate::relay::RelayUnit;
use crate::subtask::{Pipeline, PipelineError};
use std::future::Future;
use std::pin::Pin;

/// Factory for the processes the worker drives but does not implement:
/// migration pipelines and the relay stream.
///
/// The factory also answers checkpoint queries, since checkpoint persistence
/// belongs to the pipeline.
pub trait UnitFactory: Send + Sync + 'static {
    /// Builds the pipeline for one subtask config.
    fn create_pipeline(&self, cfg: &SubTaskConfig) -> Box<dyn Pipeline>;

    /// Builds the relay stream process for the source.
    fn create_relay(&self, cfg: &SourceConfig) -> Box<dyn RelayUnit>;

    /// Reads the persisted checkpoint location of one subtask, `None` when
    /// the task has never checkpointed.
    fn checkpoint_location<'a>(
        &'a self,
        cfg: &'a SubTaskConfig,
    ) -> Pin<Box<dyn Future<Output = Result<Option<BinlogLocation>, PipelineError>> + Send + 'a>>;
}
