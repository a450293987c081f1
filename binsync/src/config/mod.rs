//! Worker configuration: source bindings, subtask configs and the
//! projection that derives one from the other.

mod checker;
mod filter;
mod projection;
mod source;
mod subtask;

pub use checker::CheckerConfig;
pub use filter::{EventFilter, FilterAction, FilterRule};
pub use projection::{copy_config_from_source, copy_config_from_source_for_each};
pub use source::{DbConfig, Flavor, PurgeConfig, SourceConfig};
pub use subtask::SubTaskConfig;

use thiserror::Error;

/// Errors from config validation and projection.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// A filter rule targets the same schema/table pair as an existing one.
    #[error("duplicate filter rule for {0}")]
    DuplicateFilterRule(String),

    /// A filter rule failed validation when compiled.
    #[error("invalid filter rule {rule}: {reason}")]
    InvalidFilterRule { rule: String, reason: String },

    /// The stored password could not be decoded.
    #[error("failed to decode password: {0}")]
    DecryptPassword(String),

    /// The checker policy is not usable.
    #[error("invalid checker config: {0}")]
    InvalidChecker(String),
}
