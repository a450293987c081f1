//! Per-task configuration.

use super::{ConfigError, DbConfig, FilterRule, Flavor};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Desired configuration of one migration subtask.
///
/// The control plane stores the task-level fields; the worker projects the
/// source binding onto them before the task runs (see
/// [`copy_config_from_source`](super::copy_config_from_source)).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubTaskConfig {
    /// Task name, unique within the source.
    pub name: String,
    pub source_id: String,
    pub from: DbConfig,
    pub flavor: Flavor,
    pub server_id: u32,
    pub relay_dir: PathBuf,
    pub enable_gtid: bool,
    /// Read from the local relay instead of the upstream directly.
    pub use_relay: bool,
    pub auto_fix_gtid: bool,
    pub case_sensitive: bool,
    pub filter_rules: Vec<FilterRule>,
}

impl SubTaskConfig {
    pub fn new(name: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_id: source_id.into(),
            ..Self::default()
        }
    }

    /// Returns a copy with the upstream password decoded.
    ///
    /// Passwords travel base64-obfuscated through the coordination store; an
    /// empty password passes through unchanged.
    pub fn decrypt_password(&self) -> Result<Self, ConfigError> {
        let mut cfg = self.clone();
        if cfg.from.password.is_empty() {
            return Ok(cfg);
        }
        let raw = base64::engine::general_purpose::STANDARD
            .decode(cfg.from.password.as_bytes())
            .map_err(|err| ConfigError::DecryptPassword(err.to_string()))?;
        cfg.from.password = String::from_utf8(raw)
            .map_err(|err| ConfigError::DecryptPassword(err.to_string()))?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_decodes_base64() {
        let mut cfg = SubTaskConfig::new("t1", "s1");
        cfg.from.password = base64::engine::general_purpose::STANDARD.encode("secret");
        let decrypted = cfg.decrypt_password().unwrap();
        assert_eq!(decrypted.from.password, "secret");
        // The original stays obfuscated.
        assert_ne!(cfg.from.password, "secret");
    }

    #[test]
    fn decrypt_empty_password_is_noop() {
        let cfg = SubTaskConfig::new("t1", "s1");
        assert_eq!(cfg.decrypt_password().unwrap(), cfg);
    }

    #[test]
    fn decrypt_rejects_garbage() {
        let mut cfg = SubTaskConfig::new("t1", "s1");
        cfg.from.password = "!!not-base64!!".to_string();
        assert!(matches!(
            cfg.decrypt_password(),
            Err(ConfigError::DecryptPassword(_))
        ));
    }
}
