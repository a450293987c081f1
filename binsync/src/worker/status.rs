//! Status payloads for the periodic status log and status queries.

use crate::stage::Stage;
use crate::subtask::SubTaskStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Point-in-time view of one worker, as logged by the status loop.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub source: String,
    pub closed: bool,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Absent while relay is not enabled.
    pub relay_stage: Option<Stage>,
    pub subtasks: Vec<SubTaskStatus>,
}

impl WorkerStatus {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
