//! Project-level approval rule definitions and their validation.
//!
//! A [`RuleDefinition`] is the declarative record configured on a project,
//! either by hand or by a security policy. Rules arrive from callers as
//! loosely-typed [`RuleParams`] and are converted with
//! [`RuleDefinition::build`], which reports every type-level problem at once.
//! Cross-rule invariants (name uniqueness, the single any-approver rule,
//! reserved names) are checked by [`RuleDefinition::validate`] against the
//! other rules of the same project.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{
    default_severities, default_vulnerability_states, ReportType, ScannerId, Severity,
    UnknownVocabulary, VulnerabilityState,
};
use crate::error::ValidationErrors;
use crate::ids::{GroupId, PolicyConfigurationId, ProjectId, RuleId, UserId};
use crate::matcher::{self, ProtectedBranch};
use crate::projection::ApprovalAttributes;

// ---------------------------------------------------------------------------
// Rule kind
// ---------------------------------------------------------------------------

/// Discriminator for an approval rule's purpose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    #[default]
    Regular,
    CodeOwner,
    ReportApprover,
    AnyApprover,
}

impl RuleKind {
    pub const ALL: [RuleKind; 4] = [
        RuleKind::Regular,
        RuleKind::CodeOwner,
        RuleKind::ReportApprover,
        RuleKind::AnyApprover,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::CodeOwner => "code_owner",
            Self::ReportApprover => "report_approver",
            Self::AnyApprover => "any_approver",
        }
    }
}

impl FromStr for RuleKind {
    type Err = UnknownVocabulary;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownVocabulary {
                vocabulary: "rule type",
                value: s.to_string(),
            })
    }
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Rule definition
// ---------------------------------------------------------------------------

/// A project-level approval rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// `None` until the rule has been persisted by its owner.
    #[serde(default)]
    pub id: Option<RuleId>,
    pub project_id: ProjectId,
    pub name: String,
    #[serde(default, rename = "rule_type")]
    pub kind: RuleKind,
    #[serde(default)]
    pub approvals_required: i64,
    /// Empty means every scanner.
    #[serde(default)]
    pub scanners: BTreeSet<ScannerId>,
    /// Empty means every severity.
    #[serde(default = "default_severities")]
    pub severity_levels: BTreeSet<Severity>,
    #[serde(default = "default_vulnerability_states")]
    pub vulnerability_states: BTreeSet<VulnerabilityState>,
    #[serde(default)]
    pub vulnerabilities_allowed: i64,
    #[serde(default)]
    pub report_type: Option<ReportType>,
    #[serde(default)]
    pub applies_to_all_protected_branches: bool,
    /// Branch name patterns. Empty means every branch.
    #[serde(default)]
    pub protected_branches: Vec<String>,
    #[serde(default)]
    pub users: BTreeSet<UserId>,
    #[serde(default)]
    pub groups: BTreeSet<GroupId>,
    #[serde(default)]
    pub policy_configuration_id: Option<PolicyConfigurationId>,
    #[serde(default)]
    pub policy_idx: Option<u32>,
}

impl RuleDefinition {
    /// A regular rule with no approvers and default filters.
    pub fn new(project_id: ProjectId, name: impl Into<String>) -> Self {
        Self {
            id: None,
            project_id,
            name: name.into(),
            kind: RuleKind::Regular,
            approvals_required: 0,
            scanners: BTreeSet::new(),
            severity_levels: default_severities(),
            vulnerability_states: default_vulnerability_states(),
            vulnerabilities_allowed: 0,
            report_type: None,
            applies_to_all_protected_branches: false,
            protected_branches: Vec::new(),
            users: BTreeSet::new(),
            groups: BTreeSet::new(),
            policy_configuration_id: None,
            policy_idx: None,
        }
    }

    /// A `report_approver` rule of the given report type.
    pub fn report_approver(
        project_id: ProjectId,
        name: impl Into<String>,
        report_type: ReportType,
    ) -> Self {
        Self::new(project_id, name)
            .with_kind(RuleKind::ReportApprover)
            .with_report_type(report_type)
    }

    pub fn with_id(mut self, id: RuleId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_kind(mut self, kind: RuleKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_approvals_required(mut self, n: i64) -> Self {
        self.approvals_required = n;
        self
    }

    pub fn with_report_type(mut self, report_type: ReportType) -> Self {
        self.report_type = Some(report_type);
        self
    }

    pub fn with_scanners(mut self, scanners: impl IntoIterator<Item = ScannerId>) -> Self {
        self.assign_scanners(Some(scanners));
        self
    }

    pub fn with_severity_levels(mut self, levels: impl IntoIterator<Item = Severity>) -> Self {
        self.severity_levels = levels.into_iter().collect();
        self
    }

    pub fn with_vulnerability_states(
        mut self,
        states: impl IntoIterator<Item = VulnerabilityState>,
    ) -> Self {
        self.vulnerability_states = states.into_iter().collect();
        self
    }

    pub fn with_vulnerabilities_allowed(mut self, n: i64) -> Self {
        self.vulnerabilities_allowed = n;
        self
    }

    pub fn with_protected_branches<S: Into<String>>(
        mut self,
        branches: impl IntoIterator<Item = S>,
    ) -> Self {
        self.protected_branches = branches.into_iter().map(Into::into).collect();
        self
    }

    pub fn applying_to_all_protected_branches(mut self) -> Self {
        self.applies_to_all_protected_branches = true;
        self
    }

    pub fn with_users(mut self, users: impl IntoIterator<Item = UserId>) -> Self {
        self.users = users.into_iter().collect();
        self
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = GroupId>) -> Self {
        self.groups = groups.into_iter().collect();
        self
    }

    pub fn with_policy(mut self, configuration: PolicyConfigurationId, idx: u32) -> Self {
        self.policy_configuration_id = Some(configuration);
        self.policy_idx = Some(idx);
        self
    }

    /// Replace the scanner set. A missing value becomes the empty set, which
    /// means "all scanners", never "no scanners".
    pub fn assign_scanners<I>(&mut self, values: Option<I>)
    where
        I: IntoIterator<Item = ScannerId>,
    {
        self.scanners = values
            .map(|v| v.into_iter().collect())
            .unwrap_or_default();
    }

    pub fn is_report_approver(&self) -> bool {
        self.kind == RuleKind::ReportApprover
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

    pub fn is_license_scanning(&self) -> bool {
        self.report_type == Some(ReportType::LicenseScanning)
    }

    /// Created by a scan result policy rather than configured by hand.
    pub fn is_policy_driven(&self) -> bool {
        self.is_scan_finding()
            || (self.is_license_scanning() && self.policy_configuration_id.is_some())
    }

    /// Whether the rule governs merge requests targeting `branch`.
    pub fn applies_to_branch(&self, branch: &str, live: &[ProtectedBranch]) -> bool {
        matcher::applies_to_branch(self, branch, live)
    }

    /// Vulnerability states that count for a merge request targeting `branch`.
    pub fn vulnerability_states_for_branch(
        &self,
        branch: &str,
        live: &[ProtectedBranch],
    ) -> BTreeSet<VulnerabilityState> {
        matcher::effective_vulnerability_states(
            &self.vulnerability_states,
            self.applies_to_branch(branch, live),
        )
    }

    /// The subset of fields copied onto merge-request rules.
    pub fn to_approval_attributes(&self) -> ApprovalAttributes {
        ApprovalAttributes::from_definition(self)
    }

    /// Check this rule against the other rules of its project.
    ///
    /// `siblings` may contain the rule itself; entries with the same id are
    /// ignored. All violations are returned together.
    pub fn validate(&self, siblings: &[RuleDefinition]) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.name.trim().is_empty() {
            errors.add("name", "can't be blank");
        }
        check_numeric_ranges(self.approvals_required, self.vulnerabilities_allowed, &mut errors);

        let unsupported: Vec<String> = self
            .scanners
            .iter()
            .filter(|s| !s.is_supported())
            .map(ToString::to_string)
            .collect();
        if !unsupported.is_empty() {
            errors.add(
                "scanners",
                format!("contains unsupported scanners: {}", unsupported.join(", ")),
            );
        }

        let others = siblings
            .iter()
            .filter(|s| s.project_id == self.project_id)
            .filter(|s| self.id.is_none() || s.id != self.id);

        let mut name_taken = false;
        let mut any_approver_taken = false;
        for other in others {
            if other.kind == self.kind && other.name == self.name && self.same_uniqueness_scope(other)
            {
                name_taken = true;
            }
            if self.is_any_approver() && other.is_any_approver() {
                any_approver_taken = true;
            }
        }
        if name_taken {
            errors.add("name", "has already been taken");
        }
        if any_approver_taken {
            errors.add("rule_type", "any-approver for the project already exists");
        }

        if self.is_scan_finding()
            && !self.applies_to_all_protected_branches
            && self.protected_branches.is_empty()
        {
            errors.add("protected_branches", "can't be blank");
        }

        if self.is_report_approver() {
            match self.report_type {
                None => errors.add("report_type", "can't be blank"),
                Some(_) if !self.is_policy_driven() => self.check_reserved_name(&mut errors),
                Some(_) => {}
            }
        }

        errors.into_result()
    }

    /// Scan-finding rule names only collide within one policy.
    fn same_uniqueness_scope(&self, other: &RuleDefinition) -> bool {
        if !self.is_scan_finding() {
            return true;
        }
        other.is_scan_finding()
            && other.policy_configuration_id == self.policy_configuration_id
            && other.policy_idx == self.policy_idx
    }

    fn check_reserved_name(&self, errors: &mut ValidationErrors) {
        let Some(report_type) = self.report_type else {
            return;
        };
        if let Some(reserved) = report_type.reserved_name() {
            if self.name != reserved {
                errors.add(
                    "report_type",
                    format!("{report_type} rules must be named {reserved}"),
                );
            }
        }
        if let Some(owner) = ReportType::for_reserved_name(&self.name) {
            if owner != report_type {
                errors.add(
                    "report_type",
                    format!("name {} is reserved for {owner} rules", self.name),
                );
            }
        }
    }

    /// Convert loosely-typed input, reporting every malformed field.
    pub fn build(params: RuleParams) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();

        let name = params.name.unwrap_or_default();
        if name.trim().is_empty() {
            errors.add("name", "can't be blank");
        }

        let kind = match params.rule_type.as_deref() {
            None => RuleKind::Regular,
            Some(raw) => parse_or_record(raw, "rule_type", &mut errors).unwrap_or_default(),
        };

        let report_type = params
            .report_type
            .as_deref()
            .and_then(|raw| parse_or_record::<ReportType>(raw, "report_type", &mut errors));

        let approvals_required =
            integer_field(params.approvals_required.as_ref(), "approvals_required", &mut errors);
        let vulnerabilities_allowed = integer_field(
            params.vulnerabilities_allowed.as_ref(),
            "vulnerabilities_allowed",
            &mut errors,
        );
        check_numeric_ranges(approvals_required, vulnerabilities_allowed, &mut errors);

        let scanners: BTreeSet<ScannerId> = params
            .scanners
            .unwrap_or_default()
            .iter()
            .filter_map(|raw| parse_or_record(raw, "scanners", &mut errors))
            .collect();
        if scanners.iter().any(|s| !s.is_supported()) {
            errors.add("scanners", "contains unsupported scanners");
        }

        let severity_levels = match params.severity_levels {
            None => default_severities(),
            Some(raw) => raw
                .iter()
                .filter_map(|s| parse_or_record(s, "severity_levels", &mut errors))
                .collect(),
        };

        let vulnerability_states = match params.vulnerability_states {
            None => default_vulnerability_states(),
            Some(raw) => raw
                .iter()
                .filter_map(|s| parse_or_record(s, "vulnerability_states", &mut errors))
                .collect(),
        };

        errors.into_result()?;

        Ok(Self {
            id: params.id.map(RuleId),
            project_id: ProjectId(params.project_id),
            name,
            kind,
            approvals_required,
            scanners,
            severity_levels,
            vulnerability_states,
            vulnerabilities_allowed,
            report_type,
            applies_to_all_protected_branches: params.applies_to_all_protected_branches,
            protected_branches: params.protected_branches,
            users: params.users.into_iter().map(UserId).collect(),
            groups: params.groups.into_iter().map(GroupId).collect(),
            policy_configuration_id: params.policy_configuration_id.map(PolicyConfigurationId),
            policy_idx: params.policy_idx,
        })
    }
}

// ---------------------------------------------------------------------------
// Loose input
// ---------------------------------------------------------------------------

/// Untyped rule attributes as submitted by a caller.
///
/// Numeric fields are raw JSON values so that `1.1` or `"one"` can be
/// reported as field errors instead of failing deserialisation wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleParams {
    #[serde(default)]
    pub id: Option<u64>,
    pub project_id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rule_type: Option<String>,
    #[serde(default)]
    pub approvals_required: Option<Value>,
    #[serde(default)]
    pub scanners: Option<Vec<String>>,
    #[serde(default)]
    pub severity_levels: Option<Vec<String>>,
    #[serde(default)]
    pub vulnerability_states: Option<Vec<String>>,
    #[serde(default)]
    pub vulnerabilities_allowed: Option<Value>,
    #[serde(default)]
    pub report_type: Option<String>,
    #[serde(default)]
    pub applies_to_all_protected_branches: bool,
    #[serde(default)]
    pub protected_branches: Vec<String>,
    #[serde(default)]
    pub users: Vec<u64>,
    #[serde(default)]
    pub groups: Vec<u64>,
    #[serde(default)]
    pub policy_configuration_id: Option<u64>,
    #[serde(default)]
    pub policy_idx: Option<u32>,
}

fn parse_or_record<T>(raw: &str, field: &'static str, errors: &mut ValidationErrors) -> Option<T>
where
    T: FromStr<Err = UnknownVocabulary>,
{
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            errors.add(field, format!("contains {e}"));
            None
        }
    }
}

fn integer_field(value: Option<&Value>, field: &'static str, errors: &mut ValidationErrors) -> i64 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => i,
            None => {
                errors.add(field, "must be an integer");
                0
            }
        },
        Some(_) => {
            errors.add(field, "is not a number");
            0
        }
    }
}

fn check_numeric_ranges(approvals_required: i64, vulnerabilities_allowed: i64, errors: &mut ValidationErrors) {
    if approvals_required < 0 {
        errors.add("approvals_required", "must be greater than or equal to 0");
    }
    if vulnerabilities_allowed < 0 {
        errors.add("vulnerabilities_allowed", "must be greater than or equal to 0");
    }
}
