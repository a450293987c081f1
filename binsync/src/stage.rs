//! Lifecycle stages shared by subtasks and the relay.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle stage of a subtask or the relay stream.
///
/// `New` is the implicit initial stage of every subject. `Stopped` is
/// terminal: a stopped subtask is removed from the worker and never
/// transitions again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Created but never run.
    #[default]
    New,
    /// The underlying process is executing.
    Running,
    /// Suspended, either by an operator or by a recorded failure.
    Paused,
    /// Permanently stopped and eligible for removal.
    Stopped,
    /// The underlying process completed all of its work.
    Finished,
}

impl Stage {
    /// Returns the stage name as used in logs and status payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::New => "New",
            Stage::Running => "Running",
            Stage::Paused => "Paused",
            Stage::Stopped => "Stopped",
            Stage::Finished => "Finished",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
