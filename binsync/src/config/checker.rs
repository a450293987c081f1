//! Auto-resume checker policy.

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Policy for the background checker that auto-resumes transiently failed
/// subtasks.
///
/// Each failed task backs off exponentially between resume attempts, from
/// `backoff_min` up to `backoff_max`; the backoff resets once the task is
/// seen running again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckerConfig {
    pub check_enable: bool,
    pub check_interval: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            check_enable: true,
            check_interval: Duration::from_secs(5),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(5 * 60),
        }
    }
}

impl CheckerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.check_enable {
            return Ok(());
        }
        if self.check_interval.is_zero() {
            return Err(ConfigError::InvalidChecker(
                "check interval must be positive".to_string(),
            ));
        }
        if self.backoff_min.is_zero() {
            return Err(ConfigError::InvalidChecker(
                "backoff minimum must be positive".to_string(),
            ));
        }
        if self.backoff_min > self.backoff_max {
            return Err(ConfigError::InvalidChecker(format!(
                "backoff minimum {:?} exceeds maximum {:?}",
                self.backoff_min, self.backoff_max
            )));
        }
        Ok(())
    }
}
