//! Materialisation of project rules onto merge requests.
//!
//! [`project_onto_merge_request`] is the pure half of synchronisation: given
//! a definition and whatever record already exists under its
//! [`ProjectionKey`], it computes the record that should be stored and
//! whether storing it would change anything. The sync crate wraps this with
//! per-key locking and persistence.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::catalog::{ReportType, ScannerId, Severity, VulnerabilityState};
use crate::error::ProjectionError;
use crate::ids::{GroupId, MergeRequestId, PolicyConfigurationId, ProjectedRuleId, RuleId, UserId};
use crate::merge_request::MergeRequestContext;
use crate::rule::{RuleDefinition, RuleKind};

/// Section used for code-owner entries outside any named section.
pub const DEFAULT_CODE_OWNER_SECTION: &str = "codeowners";

// ---------------------------------------------------------------------------
// Attribute bag
// ---------------------------------------------------------------------------

/// The fields of a rule definition copied onto merge-request rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalAttributes {
    approvals_required: u32,
    name: String,
    policy_idx: Option<u32>,
    scanners: BTreeSet<ScannerId>,
    severity_levels: BTreeSet<Severity>,
    vulnerability_states: BTreeSet<VulnerabilityState>,
    vulnerabilities_allowed: u32,
    policy_configuration_id: Option<PolicyConfigurationId>,
}

fn clamp_count(n: i64) -> u32 {
    u32::try_from(n.max(0)).unwrap_or(u32::MAX)
}

impl ApprovalAttributes {
    pub fn from_definition(def: &RuleDefinition) -> Self {
        Self {
            approvals_required: clamp_count(def.approvals_required),
            name: def.name.clone(),
            policy_idx: def.policy_idx,
            scanners: def.scanners.clone(),
            severity_levels: def.severity_levels.clone(),
            vulnerability_states: def.vulnerability_states.clone(),
            vulnerabilities_allowed: clamp_count(def.vulnerabilities_allowed),
            policy_configuration_id: def.policy_configuration_id,
        }
    }

    /// Attributes for a rule without scanner filters, such as a code-owner rule.
    pub fn named(name: impl Into<String>, approvals_required: u32) -> Self {
        Self {
            approvals_required,
            name: name.into(),
            policy_idx: None,
            scanners: BTreeSet::new(),
            severity_levels: BTreeSet::new(),
            vulnerability_states: BTreeSet::new(),
            vulnerabilities_allowed: 0,
            policy_configuration_id: None,
        }
    }

    pub fn approvals_required(&self) -> u32 {
        self.approvals_required
    }

    pub fn set_approvals_required(&mut self, n: u32) {
        self.approvals_required = n;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy_idx(&self) -> Option<u32> {
        self.policy_idx
    }

    pub fn scanners(&self) -> &BTreeSet<ScannerId> {
        &self.scanners
    }

    pub fn severity_levels(&self) -> &BTreeSet<Severity> {
        &self.severity_levels
    }

    pub fn vulnerability_states(&self) -> &BTreeSet<VulnerabilityState> {
        &self.vulnerability_states
    }

    pub fn vulnerabilities_allowed(&self) -> u32 {
        self.vulnerabilities_allowed
    }

    pub fn policy_configuration_id(&self) -> Option<PolicyConfigurationId> {
        self.policy_configuration_id
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Identity of a projected rule within its merge request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum ProjectionKey {
    /// Policy-driven rules, linked to the definition that produced them.
    Source {
        merge_request: MergeRequestId,
        source_rule: RuleId,
    },
    /// One rule per report type.
    ReportType {
        merge_request: MergeRequestId,
        report_type: ReportType,
    },
    /// Code-owner rules, one per pattern and section.
    CodeOwner {
        merge_request: MergeRequestId,
        pattern: String,
        section: String,
    },
}

impl ProjectionKey {
    /// Key under which `def` is projected onto `merge_request`.
    pub fn for_definition(
        def: &RuleDefinition,
        merge_request: MergeRequestId,
    ) -> Result<Self, ProjectionError> {
        let report_type = def
            .report_type
            .ok_or_else(|| ProjectionError::MissingReportType(def.name.clone()))?;

        if report_type.keyed_by_source() {
            let source_rule = def
                .id
                .ok_or_else(|| ProjectionError::MissingSourceRule(def.name.clone()))?;
            Ok(Self::Source {
                merge_request,
                source_rule,
            })
        } else {
            Ok(Self::ReportType {
                merge_request,
                report_type,
            })
        }
    }

    pub fn code_owner(merge_request: MergeRequestId, pattern: &str, section: &str) -> Self {
        Self::CodeOwner {
            merge_request,
            pattern: pattern.to_string(),
            section: section.to_string(),
        }
    }

    pub fn merge_request(&self) -> MergeRequestId {
        match self {
            Self::Source { merge_request, .. }
            | Self::ReportType { merge_request, .. }
            | Self::CodeOwner { merge_request, .. } => *merge_request,
        }
    }

    /// Flat string form used as a unique column by storage backends.
    ///
    /// The code-owner section is length-prefixed, so a `:` inside the
    /// section or pattern cannot make two keys collide.
    pub fn storage_key(&self) -> String {
        match self {
            Self::Source {
                merge_request,
                source_rule,
            } => format!("mr:{merge_request}:source:{source_rule}"),
            Self::ReportType {
                merge_request,
                report_type,
            } => format!("mr:{merge_request}:report:{report_type}"),
            Self::CodeOwner {
                merge_request,
                pattern,
                section,
            } => format!("mr:{merge_request}:code_owner:{}:{section}:{pattern}", section.len()),
        }
    }
}

impl std::fmt::Display for ProjectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.storage_key())
    }
}

// ---------------------------------------------------------------------------
// Projected rule
// ---------------------------------------------------------------------------

/// A rule materialised onto one merge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectedMergeRequestRule {
    pub id: ProjectedRuleId,
    pub merge_request_id: MergeRequestId,
    #[serde(default)]
    pub source_rule_id: Option<RuleId>,
    pub kind: RuleKind,
    #[serde(default)]
    pub report_type: Option<ReportType>,
    /// Code-owner section; `None` for every other kind.
    #[serde(default)]
    pub section: Option<String>,
    pub attributes: ApprovalAttributes,
    #[serde(default)]
    pub users: BTreeSet<UserId>,
    #[serde(default)]
    pub groups: BTreeSet<GroupId>,
    /// Recorded on merge; empty until then.
    #[serde(default)]
    pub approved_approvers: BTreeSet<UserId>,
}

/// Everything but the generated id.
#[derive(Serialize)]
struct ContentView<'a> {
    merge_request_id: MergeRequestId,
    source_rule_id: Option<RuleId>,
    kind: RuleKind,
    report_type: Option<ReportType>,
    section: Option<&'a str>,
    attributes: &'a ApprovalAttributes,
    users: &'a BTreeSet<UserId>,
    groups: &'a BTreeSet<GroupId>,
    approved_approvers: &'a BTreeSet<UserId>,
}

impl ProjectedMergeRequestRule {
    pub fn name(&self) -> &str {
        self.attributes.name()
    }

    pub fn approvals_required(&self) -> u32 {
        self.attributes.approvals_required()
    }

    pub fn is_code_owner(&self) -> bool {
        self.kind == RuleKind::CodeOwner
    }

    pub fn is_any_approver(&self) -> bool {
        self.kind == RuleKind::AnyApprover
    }

    pub fn is_scan_finding(&self) -> bool {
        self.report_type == Some(ReportType::ScanFinding)
    }

    /// Created from a scan result policy.
    pub fn is_policy_driven(&self) -> bool {
        self.is_scan_finding()
            || (self.report_type == Some(ReportType::LicenseScanning)
                && self.attributes.policy_configuration_id().is_some())
    }

    /// Key this record is stored under, if it was produced by projection.
    pub fn key(&self) -> Option<ProjectionKey> {
        let merge_request = self.merge_request_id;
        if self.is_code_owner() {
            return Some(ProjectionKey::CodeOwner {
                merge_request,
                pattern: self.name().to_string(),
                section: self
                    .section
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CODE_OWNER_SECTION.to_string()),
            });
        }
        let report_type = self.report_type?;
        match (report_type.keyed_by_source(), self.source_rule_id) {
            (true, Some(source_rule)) => Some(ProjectionKey::Source {
                merge_request,
                source_rule,
            }),
            (true, None) => None,
            (false, _) => Some(ProjectionKey::ReportType {
                merge_request,
                report_type,
            }),
        }
    }

    /// A fresh code-owner rule for `entry` on `merge_request`.
    pub fn code_owner(merge_request: MergeRequestId, entry: &CodeOwnerEntry) -> Self {
        Self {
            id: ProjectedRuleId::new(),
            merge_request_id: merge_request,
            source_rule_id: None,
            kind: RuleKind::CodeOwner,
            report_type: None,
            section: Some(entry.section.clone()),
            attributes: ApprovalAttributes::named(&entry.pattern, entry.approvals_required.unwrap_or(0)),
            users: entry.users.clone(),
            groups: entry.groups.clone(),
            approved_approvers: BTreeSet::new(),
        }
    }

    /// SHA-256 over the serialised content, excluding the id.
    pub fn fingerprint(&self) -> String {
        let view = ContentView {
            merge_request_id: self.merge_request_id,
            source_rule_id: self.source_rule_id,
            kind: self.kind,
            report_type: self.report_type,
            section: self.section.as_deref(),
            attributes: &self.attributes,
            users: &self.users,
            groups: &self.groups,
            approved_approvers: &self.approved_approvers,
        };
        let bytes = serde_json::to_vec(&view).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// One line of a CODEOWNERS file resolved to approvers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeOwnerEntry {
    pub pattern: String,
    #[serde(default = "default_section")]
    pub section: String,
    #[serde(default)]
    pub optional: bool,
    /// Only present for sections that declare a count.
    #[serde(default)]
    pub approvals_required: Option<u32>,
    #[serde(default)]
    pub users: BTreeSet<UserId>,
    #[serde(default)]
    pub groups: BTreeSet<GroupId>,
}

fn default_section() -> String {
    DEFAULT_CODE_OWNER_SECTION.to_string()
}

impl CodeOwnerEntry {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            section: default_section(),
            optional: false,
            approvals_required: None,
            users: BTreeSet::new(),
            groups: BTreeSet::new(),
        }
    }

    pub fn in_section(mut self, section: impl Into<String>) -> Self {
        self.section = section.into();
        self
    }

    pub fn with_users(mut self, users: impl IntoIterator<Item = UserId>) -> Self {
        self.users = users.into_iter().collect();
        self
    }

    pub fn with_approvals_required(mut self, n: u32) -> Self {
        self.approvals_required = Some(n);
        self
    }

    pub fn key(&self, merge_request: MergeRequestId) -> ProjectionKey {
        ProjectionKey::code_owner(merge_request, &self.pattern, &self.section)
    }
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// What storing a projection would do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionChange {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    pub key: ProjectionKey,
    pub rule: ProjectedMergeRequestRule,
    pub change: ProjectionChange,
}

impl Projection {
    pub fn needs_write(&self) -> bool {
        self.change != ProjectionChange::Unchanged
    }

    /// Require no approvals, recomputing the change against `existing`.
    pub fn waive_approvals(&mut self, existing: Option<&ProjectedMergeRequestRule>) {
        self.rule.attributes.set_approvals_required(0);
        self.change = change_against(existing, &self.rule);
    }
}

fn change_against(
    existing: Option<&ProjectedMergeRequestRule>,
    rule: &ProjectedMergeRequestRule,
) -> ProjectionChange {
    match existing {
        None => ProjectionChange::Created,
        Some(prev) if prev.fingerprint() == rule.fingerprint() => ProjectionChange::Unchanged,
        Some(_) => ProjectionChange::Updated,
    }
}

/// Compute the merge-request rule for `def`.
///
/// `existing` is the record currently stored under the definition's key. Its
/// id and materialised approvers are kept; every attribute is overwritten.
pub fn project_onto_merge_request(
    def: &RuleDefinition,
    mr: &MergeRequestContext,
    existing: Option<&ProjectedMergeRequestRule>,
) -> Result<Projection, ProjectionError> {
    if let Some(project) = &mr.project {
        if project.id != def.project_id {
            return Err(ProjectionError::ProjectMismatch {
                rule: def.name.clone(),
                merge_request: mr.id,
            });
        }
    }

    let key = ProjectionKey::for_definition(def, mr.id)?;

    let (id, approved_approvers) = match existing {
        Some(rule) => (rule.id, rule.approved_approvers.clone()),
        None => (ProjectedRuleId::new(), BTreeSet::new()),
    };

    let rule = ProjectedMergeRequestRule {
        id,
        merge_request_id: mr.id,
        source_rule_id: def.id,
        kind: RuleKind::ReportApprover,
        report_type: def.report_type,
        section: None,
        attributes: def.to_approval_attributes(),
        users: def.users.clone(),
        groups: def.groups.clone(),
        approved_approvers,
    };

    let change = change_against(existing, &rule);
    Ok(Projection { key, rule, change })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ProjectId;
    use crate::merge_request::ProjectContext;

    fn mr() -> MergeRequestContext {
        MergeRequestContext::new(MergeRequestId(42), ProjectContext::new(ProjectId(1)), "main", UserId(1))
    }

    fn scan_finding_rule() -> RuleDefinition {
        RuleDefinition::report_approver(ProjectId(1), "Scan finding", ReportType::ScanFinding)
            .with_id(RuleId(7))
            .with_approvals_required(2)
            .with_protected_branches(["main"])
            .with_policy(PolicyConfigurationId(3), 0)
            .with_users([UserId(5)])
    }

    #[test]
    fn keys_follow_report_type() {
        let key = ProjectionKey::for_definition(&scan_finding_rule(), MergeRequestId(42)).unwrap();
        assert_eq!(
            key,
            ProjectionKey::Source {
                merge_request: MergeRequestId(42),
                source_rule: RuleId(7)
            }
        );
        assert_eq!(key.storage_key(), "mr:42:source:7");

        let vuln = RuleDefinition::report_approver(ProjectId(1), "Vulnerability-Check", ReportType::Vulnerability);
        let key = ProjectionKey::for_definition(&vuln, MergeRequestId(42)).unwrap();
        assert_eq!(key.storage_key(), "mr:42:report:vulnerability");
    }

    #[test]
    fn missing_report_type_cannot_be_keyed() {
        let regular = RuleDefinition::new(ProjectId(1), "QA");
        assert!(matches!(
            ProjectionKey::for_definition(&regular, MergeRequestId(1)),
            Err(ProjectionError::MissingReportType(_))
        ));
    }

    #[test]
    fn source_keyed_rules_need_an_id() {
        let mut rule = scan_finding_rule();
        rule.id = None;
        assert!(matches!(
            ProjectionKey::for_definition(&rule, MergeRequestId(1)),
            Err(ProjectionError::MissingSourceRule(_))
        ));
    }

    #[test]
    fn projection_forces_report_approver_kind() {
        let def = scan_finding_rule().with_kind(RuleKind::Regular);
        let projection = project_onto_merge_request(&def, &mr(), None).unwrap();
        assert_eq!(projection.change, ProjectionChange::Created);
        assert_eq!(projection.rule.kind, RuleKind::ReportApprover);
        assert_eq!(projection.rule.report_type, Some(ReportType::ScanFinding));
        assert_eq!(projection.rule.approvals_required(), 2);
        assert_eq!(projection.rule.users, BTreeSet::from([UserId(5)]));
        assert_eq!(projection.rule.key(), Some(projection.key.clone()));
    }

    #[test]
    fn reprojecting_unchanged_definition_is_a_no_op() {
        let def = scan_finding_rule();
        let first = project_onto_merge_request(&def, &mr(), None).unwrap();
        let second = project_onto_merge_request(&def, &mr(), Some(&first.rule)).unwrap();
        assert_eq!(second.change, ProjectionChange::Unchanged);
        assert!(!second.needs_write());
        assert_eq!(second.rule, first.rule);
    }

    #[test]
    fn changed_definition_updates_in_place() {
        let def = scan_finding_rule();
        let first = project_onto_merge_request(&def, &mr(), None).unwrap();
        let changed = def.with_approvals_required(3);
        let second = project_onto_merge_request(&changed, &mr(), Some(&first.rule)).unwrap();
        assert_eq!(second.change, ProjectionChange::Updated);
        assert_eq!(second.rule.id, first.rule.id);
        assert_eq!(second.rule.approvals_required(), 3);
    }

    #[test]
    fn foreign_project_rules_are_rejected() {
        let def = RuleDefinition::report_approver(ProjectId(2), "Vulnerability-Check", ReportType::Vulnerability);
        assert!(matches!(
            project_onto_merge_request(&def, &mr(), None),
            Err(ProjectionError::ProjectMismatch { .. })
        ));
    }

    #[test]
    fn fingerprint_ignores_id() {
        let def = scan_finding_rule();
        let a = project_onto_merge_request(&def, &mr(), None).unwrap().rule;
        let mut b = a.clone();
        b.id = ProjectedRuleId::new();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.users.insert(UserId(99));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn code_owner_rules_key_by_pattern_and_section() {
        let entry = CodeOwnerEntry::new("*.rb").in_section("Backend").with_approvals_required(2);
        let rule = ProjectedMergeRequestRule::code_owner(MergeRequestId(4), &entry);
        assert!(rule.is_code_owner());
        assert_eq!(rule.approvals_required(), 2);
        assert_eq!(rule.key(), Some(entry.key(MergeRequestId(4))));
        assert_eq!(
            entry.key(MergeRequestId(4)).storage_key(),
            "mr:4:code_owner:7:Backend:*.rb"
        );
    }

    #[test]
    fn code_owner_keys_with_colons_stay_distinct() {
        let a = ProjectionKey::code_owner(MergeRequestId(1), "c", "a:b");
        let b = ProjectionKey::code_owner(MergeRequestId(1), "b:c", "a");
        assert_ne!(a.storage_key(), b.storage_key());
    }

    #[test]
    fn waived_projection_matches_a_waived_record() {
        let def = scan_finding_rule();
        let mut first = project_onto_merge_request(&def, &mr(), None).unwrap();
        first.waive_approvals(None);
        assert_eq!(first.change, ProjectionChange::Created);
        assert_eq!(first.rule.approvals_required(), 0);

        let mut again = project_onto_merge_request(&def, &mr(), Some(&first.rule)).unwrap();
        assert_eq!(again.change, ProjectionChange::Updated);
        again.waive_approvals(Some(&first.rule));
        assert_eq!(again.change, ProjectionChange::Unchanged);
    }

    #[test]
    fn attributes_clamp_negative_counts() {
        let def = RuleDefinition::new(ProjectId(1), "x").with_approvals_required(-4);
        assert_eq!(def.to_approval_attributes().approvals_required(), 0);
    }
}
