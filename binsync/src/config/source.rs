//! Source binding: the per-upstream configuration a worker is bound to.

use super::{CheckerConfig, FilterRule};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Upstream connection parameters.
///
/// The password travels base64-obfuscated in the coordination store and is
/// decoded only when a pipeline actually needs it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// Binlog dialect of the upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    #[default]
    Mysql,
    Mariadb,
}

impl Flavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flavor::Mysql => "mysql",
            Flavor::Mariadb => "mariadb",
        }
    }
}

/// Automatic relay log eviction policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Interval between background eviction passes.
    pub interval: Duration,
    /// Relay files older than this many hours are eligible for eviction.
    /// Zero disables the automatic sweep.
    pub expires_hours: u64,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            expires_hours: 0,
        }
    }
}

/// Immutable binding of a worker to one upstream source.
///
/// The relay position fields (`relay_binlog_name`, `relay_binlog_gtid`,
/// `uuid_suffix`) start empty and are filled in once when relay is enabled,
/// from the earliest subtask checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub from: DbConfig,
    pub flavor: Flavor,
    pub server_id: u32,
    pub relay_dir: PathBuf,
    pub enable_gtid: bool,
    pub enable_relay: bool,
    pub auto_fix_gtid: bool,
    pub case_sensitive: bool,
    pub filters: Vec<FilterRule>,
    pub checker: CheckerConfig,
    pub purge: PurgeConfig,
    pub relay_binlog_name: String,
    pub relay_binlog_gtid: String,
    pub uuid_suffix: u32,
}

impl SourceConfig {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purge_defaults() {
        let purge = PurgeConfig::default();
        assert_eq!(purge.interval, Duration::from_secs(3600));
        assert_eq!(purge.expires_hours, 0);
    }

    #[test]
    fn flavor_serde_uses_lowercase() {
        assert_eq!(serde_json::to_string(&Flavor::Mariadb).unwrap(), "\"mariadb\"");
    }
}
