//! Projection of the source binding onto a subtask config.

use super::{ConfigError, EventFilter, SourceConfig, SubTaskConfig};
use std::collections::HashMap;
use tracing::warn;

/// Copies the source-level fields into a subtask config and merges the
/// source's filter rules under the task's.
///
/// Case-sensitivity becomes the disjunction of the two configs; a mismatch
/// is logged once. When a source rule collides with a task rule the task
/// rule wins, since the task config is the more specific one. The merge is
/// idempotent: applying it twice leaves the config unchanged apart from the
/// repeated warning.
pub fn copy_config_from_source(
    cfg: &mut SubTaskConfig,
    source: &SourceConfig,
) -> Result<(), ConfigError> {
    cfg.from = source.from.clone();
    cfg.flavor = source.flavor;
    cfg.server_id = source.server_id;
    cfg.relay_dir = source.relay_dir.clone();
    cfg.enable_gtid = source.enable_gtid;
    cfg.use_relay = source.enable_relay;
    cfg.auto_fix_gtid = source.auto_fix_gtid;

    if cfg.case_sensitive != source.case_sensitive {
        warn!(
            task = %cfg.name,
            "case-sensitive differs between task and source config, using true"
        );
    }
    cfg.case_sensitive = cfg.case_sensitive || source.case_sensitive;

    let mut filter = EventFilter::new(cfg.case_sensitive, &cfg.filter_rules)?;
    for rule in &source.filters {
        match filter.add_rule(rule.clone()) {
            Ok(()) => cfg.filter_rules.push(rule.clone()),
            Err(ConfigError::DuplicateFilterRule(key)) => {
                warn!(
                    task = %cfg.name,
                    rule = %key,
                    "filter rule already set by the task config, keeping the task rule"
                );
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Applies [`copy_config_from_source`] to every config in the map.
pub fn copy_config_from_source_for_each(
    cfgs: &mut HashMap<String, SubTaskConfig>,
    source: &SourceConfig,
) -> Result<(), ConfigError> {
    for cfg in cfgs.values_mut() {
        copy_config_from_source(cfg, source)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterAction, FilterRule};

    fn source() -> SourceConfig {
        let mut source = SourceConfig::new("s1");
        source.from.host = "upstream".to_string();
        source.from.port = 3306;
        source.server_id = 429;
        source.relay_dir = "/var/relay".into();
        source.enable_relay = true;
        source.enable_gtid = true;
        source.filters = vec![
            FilterRule::new("shop", "orders", FilterAction::Ignore),
            FilterRule::new("shop", "audit", FilterAction::Ignore),
        ];
        source
    }

    #[test]
    fn copies_source_fields() {
        let mut cfg = SubTaskConfig::new("t1", "s1");
        copy_config_from_source(&mut cfg, &source()).unwrap();
        assert_eq!(cfg.from.host, "upstream");
        assert_eq!(cfg.server_id, 429);
        assert!(cfg.use_relay);
        assert!(cfg.enable_gtid);
        assert_eq!(cfg.relay_dir, std::path::PathBuf::from("/var/relay"));
        assert_eq!(cfg.filter_rules.len(), 2);
    }

    #[test]
    fn task_rules_take_priority() {
        let mut cfg = SubTaskConfig::new("t1", "s1");
        cfg.filter_rules = vec![FilterRule::new("shop", "orders", FilterAction::Do)];
        copy_config_from_source(&mut cfg, &source()).unwrap();

        // The colliding source rule was skipped; the other was appended.
        assert_eq!(cfg.filter_rules.len(), 2);
        assert_eq!(cfg.filter_rules[0].action, FilterAction::Do);
        assert_eq!(cfg.filter_rules[1].table_pattern, "audit");
    }

    #[test]
    fn case_sensitivity_is_disjunction() {
        let mut insensitive_source = source();
        insensitive_source.case_sensitive = false;

        let mut cfg = SubTaskConfig::new("t1", "s1");
        cfg.case_sensitive = true;
        copy_config_from_source(&mut cfg, &insensitive_source).unwrap();
        assert!(cfg.case_sensitive);

        let mut cfg = SubTaskConfig::new("t2", "s1");
        copy_config_from_source(&mut cfg, &insensitive_source).unwrap();
        assert!(!cfg.case_sensitive);
    }

    #[test]
    fn projection_is_idempotent() {
        let source = source();
        let mut once = SubTaskConfig::new("t1", "s1");
        once.filter_rules = vec![FilterRule::new("shop", "orders", FilterAction::Do)];
        copy_config_from_source(&mut once, &source).unwrap();

        let mut twice = once.clone();
        copy_config_from_source(&mut twice, &source).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn for_each_projects_every_entry() {
        let mut cfgs = HashMap::new();
        cfgs.insert("t1".to_string(), SubTaskConfig::new("t1", "s1"));
        cfgs.insert("t2".to_string(), SubTaskConfig::new("t2", "s1"));
        copy_config_from_source_for_each(&mut cfgs, &source()).unwrap();
        for cfg in cfgs.values() {
            assert_eq!(cfg.server_id, 429);
            assert!(cfg.use_relay);
        }
    }
}
