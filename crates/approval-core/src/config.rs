//! Engine configuration.
//!
//! Values come from serde (the CLI reads TOML) with `APPROVAL_*` environment
//! variables layered on top by [`EngineConfig::from_env`].

use serde::{Deserialize, Serialize};

/// Upper bound on protected-environment approval counts.
pub const DEFAULT_MAX_ENVIRONMENT_APPROVALS: i64 = 5;

/// Tunables for evaluation and synchronisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Invalid policy-driven rules block merging instead of passing.
    pub invalid_policy_prevents_merge: bool,
    /// Report sync lowers satisfied rules using pipeline findings.
    pub sync_from_findings: bool,
    pub max_environment_approvals: i64,
    /// Lifetime of cached protected-branch lookups.
    pub protected_branch_cache_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            invalid_policy_prevents_merge: true,
            sync_from_findings: true,
            max_environment_approvals: DEFAULT_MAX_ENVIRONMENT_APPROVALS,
            protected_branch_cache_ttl_secs: 60,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any `APPROVAL_*` variables that parse.
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, ignoring values that fail to parse.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("APPROVAL_INVALID_POLICY_PREVENTS_MERGE").and_then(|v| parse_bool(&v)) {
            self.invalid_policy_prevents_merge = v;
        }
        if let Some(v) = lookup("APPROVAL_SYNC_FROM_FINDINGS").and_then(|v| parse_bool(&v)) {
            self.sync_from_findings = v;
        }
        if let Some(v) = lookup("APPROVAL_MAX_ENVIRONMENT_APPROVALS").and_then(|v| v.parse().ok()) {
            self.max_environment_approvals = v;
        }
        if let Some(v) = lookup("APPROVAL_PROTECTED_BRANCH_CACHE_TTL_SECS").and_then(|v| v.parse().ok()) {
            self.protected_branch_cache_ttl_secs = v;
        }
        self
    }

    pub fn protected_branch_cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.protected_branch_cache_ttl_secs)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert!(config.invalid_policy_prevents_merge);
        assert!(config.sync_from_findings);
        assert_eq!(config.max_environment_approvals, 5);
        assert_eq!(config.protected_branch_cache_ttl().as_secs(), 60);
    }

    #[test]
    fn overlay_applies_parsable_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("APPROVAL_INVALID_POLICY_PREVENTS_MERGE", "off"),
            ("APPROVAL_MAX_ENVIRONMENT_APPROVALS", "not-a-number"),
            ("APPROVAL_PROTECTED_BRANCH_CACHE_TTL_SECS", "5"),
        ]);
        let config = EngineConfig::default().overlay(|k| env.get(k).map(|v| v.to_string()));
        assert!(!config.invalid_policy_prevents_merge);
        assert_eq!(config.max_environment_approvals, 5);
        assert_eq!(config.protected_branch_cache_ttl_secs, 5);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: EngineConfig = toml::from_str("sync_from_findings = false\n").unwrap();
        assert!(!config.sync_from_findings);
        assert!(config.invalid_policy_prevents_merge);
    }
}
