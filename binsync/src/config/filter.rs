//! Binlog event filter rules and the compiled filter used to merge them.

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What to do with events matching a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    /// Replicate matching events.
    #[default]
    Do,
    /// Drop matching events.
    Ignore,
}

/// One filter rule, keyed by its schema/table pattern pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    /// Schema name or `*`.
    pub schema_pattern: String,
    /// Table name or `*`. Empty matches schema-level events.
    pub table_pattern: String,
    /// Event kinds the rule applies to; empty means all.
    pub events: Vec<String>,
    pub action: FilterAction,
}

impl FilterRule {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, action: FilterAction) -> Self {
        Self {
            schema_pattern: schema.into(),
            table_pattern: table.into(),
            events: Vec::new(),
            action,
        }
    }

    /// Identity of the rule at the given case-sensitivity.
    fn key(&self, case_sensitive: bool) -> String {
        let key = format!("{}.{}", self.schema_pattern, self.table_pattern);
        if case_sensitive {
            key
        } else {
            key.to_lowercase()
        }
    }
}

/// A compiled set of filter rules.
///
/// Compilation validates each rule and rejects duplicates, which is what the
/// config projection relies on to give task-level rules priority over
/// source-level ones.
#[derive(Debug, Clone)]
pub struct EventFilter {
    case_sensitive: bool,
    rules: HashMap<String, FilterRule>,
}

impl EventFilter {
    pub fn new(case_sensitive: bool, rules: &[FilterRule]) -> Result<Self, ConfigError> {
        let mut filter = Self {
            case_sensitive,
            rules: HashMap::with_capacity(rules.len()),
        };
        for rule in rules {
            filter.add_rule(rule.clone())?;
        }
        Ok(filter)
    }

    /// Adds one rule, rejecting duplicates of an already-registered pattern
    /// pair.
    pub fn add_rule(&mut self, rule: FilterRule) -> Result<(), ConfigError> {
        if rule.schema_pattern.is_empty() {
            return Err(ConfigError::InvalidFilterRule {
                rule: rule.key(self.case_sensitive),
                reason: "empty schema pattern".to_string(),
            });
        }
        let key = rule.key(self.case_sensitive);
        if self.rules.contains_key(&key) {
            return Err(ConfigError::DuplicateFilterRule(key));
        }
        self.rules.insert(key, rule);
        Ok(())
    }

    /// Looks up the rule covering a schema/table pair, wildcard rules
    /// included.
    pub fn lookup(&self, schema: &str, table: &str) -> Option<&FilterRule> {
        let normalize = |s: &str| {
            if self.case_sensitive {
                s.to_string()
            } else {
                s.to_lowercase()
            }
        };
        let schema = normalize(schema);
        let table = normalize(table);
        for candidate in [
            format!("{schema}.{table}"),
            format!("{schema}.*"),
            format!("*.{table}"),
            "*.*".to_string(),
        ] {
            if let Some(rule) = self.rules.get(&candidate) {
                return Some(rule);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
