//! Branch applicability for approval rules.
//!
//! Patterns follow protected-branch wildcard syntax: `*` matches any sequence
//! of characters, everything else is literal and the whole name must match.

use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::catalog::VulnerabilityState;
use crate::merge_request::ProjectContext;
use crate::rule::RuleDefinition;

/// A compiled branch name pattern.
#[derive(Debug, Clone)]
pub struct BranchPattern {
    raw: String,
    regex: Option<Regex>,
}

impl BranchPattern {
    pub fn new(pattern: &str) -> Self {
        let regex = if pattern.contains('*') {
            let escaped = regex::escape(pattern).replace(r"\*", ".*");
            Regex::new(&format!("^{escaped}$")).ok()
        } else {
            None
        };
        Self {
            raw: pattern.to_string(),
            regex,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_wildcard(&self) -> bool {
        self.regex.is_some()
    }

    pub fn matches(&self, branch: &str) -> bool {
        match &self.regex {
            Some(re) => re.is_match(branch),
            None => self.raw == branch,
        }
    }
}

/// One entry of a project's live protected-branch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedBranch {
    /// Name or wildcard pattern.
    pub name: String,
    #[serde(default)]
    pub code_owner_approval_required: bool,
}

impl ProtectedBranch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code_owner_approval_required: false,
        }
    }

    pub fn requiring_code_owner_approval(mut self) -> Self {
        self.code_owner_approval_required = true;
        self
    }

    pub fn matches(&self, branch: &str) -> bool {
        BranchPattern::new(&self.name).matches(branch)
    }
}

/// Whether `rule` applies to merge requests targeting `branch`.
///
/// Rules scoped to all protected branches consult `live`, which may change
/// independently of the rule. Otherwise an empty pattern list is unrestricted.
pub fn applies_to_branch(rule: &RuleDefinition, branch: &str, live: &[ProtectedBranch]) -> bool {
    if rule.applies_to_all_protected_branches {
        return live.iter().any(|pb| pb.matches(branch));
    }
    if rule.protected_branches.is_empty() {
        return true;
    }
    rule.protected_branches
        .iter()
        .any(|pattern| BranchPattern::new(pattern).matches(branch))
}

/// Digest of everything [`applies_to_branch`] reads apart from the branch.
///
/// `live` only contributes for rules scoped to all protected branches.
pub fn branch_scope_digest(rule: &RuleDefinition, live: &[ProtectedBranch]) -> String {
    fn push(hasher: &mut Sha256, part: &str) {
        hasher.update(part.len().to_le_bytes());
        hasher.update(part.as_bytes());
    }

    let mut hasher = Sha256::new();
    hasher.update(rule.protected_branches.len().to_le_bytes());
    for pattern in &rule.protected_branches {
        push(&mut hasher, pattern);
    }
    if rule.applies_to_all_protected_branches {
        hasher.update(b"all");
        hasher.update(live.len().to_le_bytes());
        for pb in live {
            push(&mut hasher, &pb.name);
        }
    }
    hex::encode(hasher.finalize())
}

/// Whether merges into `branch` need code-owner approval under the project's
/// protected-branch settings.
pub fn branch_requires_code_owner_approval(project: &ProjectContext, branch: &str) -> bool {
    project.code_owner_approval_enabled
        && project
            .protected_branches
            .iter()
            .any(|pb| pb.code_owner_approval_required && pb.matches(branch))
}

/// States that count for a rule: all configured states when the rule applies
/// to the branch, otherwise only `newly_detected` if it was configured.
pub fn effective_vulnerability_states(
    configured: &BTreeSet<VulnerabilityState>,
    applies: bool,
) -> BTreeSet<VulnerabilityState> {
    if applies {
        return configured.clone();
    }
    configured
        .iter()
        .copied()
        .filter(|s| *s == VulnerabilityState::NewlyDetected)
        .collect()
}
