//! Per merge request state of one approval rule.
//!
//! [`WrappedRule`] pairs a rule (a project definition or a rule already
//! materialised onto the merge request) with the merge request it is being
//! evaluated for, and derives everything the approval widget and the merge
//! check need: effective required approvals, approvers, who has approved,
//! and whether the rule is satisfied.
//!
//! # Invariants
//!
//! - A code-owner rule that requires approval on the target branch and has
//!   at least one approver needs at least [`MIN_CODE_OWNER_APPROVALS`].
//! - Off the rule's branches only `newly_detected` findings count.
//! - Evaluation never mutates its inputs; wrapping the same inputs twice
//!   yields identical results.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::catalog::{ReportType, VulnerabilityState};
use crate::config::EngineConfig;
use crate::directory::MembershipDirectory;
use crate::error::ContextError;
use crate::ids::{GroupId, UserId};
use crate::matcher;
use crate::obs;
use crate::merge_request::{ApprovalTally, MergeRequestContext, ProjectContext};
use crate::projection::{ProjectedMergeRequestRule, DEFAULT_CODE_OWNER_SECTION};
use crate::rule::{RuleDefinition, RuleKind};

/// Floor for code-owner rules that apply at all.
pub const MIN_CODE_OWNER_APPROVALS: u32 = 1;

/// The fields of a rule that evaluation reads.
pub trait ApprovalRuleView {
    fn kind(&self) -> RuleKind;
    fn report_type(&self) -> Option<ReportType>;
    fn name(&self) -> &str;
    fn approvals_required(&self) -> u32;
    fn users(&self) -> &BTreeSet<UserId>;
    fn groups(&self) -> &BTreeSet<GroupId>;
    /// Code-owner section, if the rule has one.
    fn section(&self) -> Option<&str>;
    fn vulnerability_states(&self) -> &BTreeSet<VulnerabilityState>;
    /// Approvers recorded when the merge request was merged.
    fn materialized_approvers(&self) -> Option<&BTreeSet<UserId>>;
    fn policy_driven(&self) -> bool;
    /// Definition that decides branch applicability, when known.
    fn source(&self) -> Option<&RuleDefinition>;
}

impl ApprovalRuleView for RuleDefinition {
    fn kind(&self) -> RuleKind {
        self.kind
    }

    fn report_type(&self) -> Option<ReportType> {
        self.report_type
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn approvals_required(&self) -> u32 {
        self.to_approval_attributes().approvals_required()
    }

    fn users(&self) -> &BTreeSet<UserId> {
        &self.users
    }

    fn groups(&self) -> &BTreeSet<GroupId> {
        &self.groups
    }

    fn section(&self) -> Option<&str> {
        None
    }

    fn vulnerability_states(&self) -> &BTreeSet<VulnerabilityState> {
        &self.vulnerability_states
    }

    fn materialized_approvers(&self) -> Option<&BTreeSet<UserId>> {
        None
    }

    fn policy_driven(&self) -> bool {
        self.is_policy_driven()
    }

    fn source(&self) -> Option<&RuleDefinition> {
        Some(self)
    }
}

impl ApprovalRuleView for ProjectedMergeRequestRule {
    fn kind(&self) -> RuleKind {
        self.kind
    }

    fn report_type(&self) -> Option<ReportType> {
        self.report_type
    }

    fn name(&self) -> &str {
        self.attributes.name()
    }

    fn approvals_required(&self) -> u32 {
        self.attributes.approvals_required()
    }

    fn users(&self) -> &BTreeSet<UserId> {
        &self.users
    }

    fn groups(&self) -> &BTreeSet<GroupId> {
        &self.groups
    }

    fn section(&self) -> Option<&str> {
        self.section.as_deref()
    }

    fn vulnerability_states(&self) -> &BTreeSet<VulnerabilityState> {
        self.attributes.vulnerability_states()
    }

    fn materialized_approvers(&self) -> Option<&BTreeSet<UserId>> {
        Some(&self.approved_approvers)
    }

    fn policy_driven(&self) -> bool {
        self.is_policy_driven()
    }

    fn source(&self) -> Option<&RuleDefinition> {
        None
    }
}

/// Caller-supplied inputs shared by every rule of one merge request.
#[derive(Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub merge_request: &'a MergeRequestContext,
    pub tally: &'a ApprovalTally,
    pub directory: &'a dyn MembershipDirectory,
    pub config: &'a EngineConfig,
}

/// A rule evaluated against one merge request.
pub struct WrappedRule<'a, R: ApprovalRuleView + ?Sized> {
    ctx: EvaluationContext<'a>,
    project: &'a ProjectContext,
    rule: &'a R,
    source: Option<&'a RuleDefinition>,
}

impl<'a, R: ApprovalRuleView + ?Sized> WrappedRule<'a, R> {
    /// Fails fast when the context is not fully formed.
    pub fn new(ctx: EvaluationContext<'a>, rule: &'a R) -> Result<Self, ContextError> {
        let mr = ctx.merge_request;
        let project = mr
            .project
            .as_ref()
            .ok_or(ContextError::MissingProject(mr.id))?;
        if ctx.tally.merge_request_id != mr.id {
            return Err(ContextError::MergeRequestMismatch {
                expected: mr.id,
                actual: ctx.tally.merge_request_id,
            });
        }
        Ok(Self {
            ctx,
            project,
            rule,
            source: rule.source(),
        })
    }

    /// Use `source` for branch applicability of a materialised rule.
    pub fn with_source(mut self, source: &'a RuleDefinition) -> Self {
        self.source = Some(source);
        self
    }

    pub fn project(&self) -> &ProjectContext {
        self.project
    }

    pub fn rule(&self) -> &R {
        self.rule
    }

    fn is_any_approver(&self) -> bool {
        self.rule.kind() == RuleKind::AnyApprover
    }

    /// Display name. Scan-finding rules drop their trailing sequence number.
    pub fn name(&self) -> &str {
        let name = self.rule.name();
        if self.rule.report_type() != Some(ReportType::ScanFinding) {
            return name;
        }
        match name.rsplit_once(char::is_whitespace) {
            Some((head, tail)) if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) => head,
            _ => name,
        }
    }

    /// Eligible approvers: rule users plus members of rule groups, without
    /// the author unless the project allows self-approval.
    pub fn approvers(&self) -> BTreeSet<UserId> {
        if self.is_any_approver() {
            return BTreeSet::new();
        }
        let mut approvers: BTreeSet<UserId> = self.rule.users().clone();
        for group in self.rule.groups() {
            approvers.extend(self.ctx.directory.group_members(*group));
        }
        if !self.project.author_approval_allowed {
            approvers.remove(&self.ctx.merge_request.author);
        }
        approvers
    }

    /// Whether the target branch needs code-owner approval for this rule's
    /// section.
    pub fn branch_requires_code_owner_approval(&self) -> bool {
        let section = self.rule.section().unwrap_or(DEFAULT_CODE_OWNER_SECTION);
        if self.ctx.merge_request.is_section_optional(section) {
            return false;
        }
        matcher::branch_requires_code_owner_approval(self.project, &self.ctx.merge_request.target_branch)
    }

    pub fn approvals_required(&self) -> u32 {
        let configured = self.rule.approvals_required();
        if self.rule.kind() != RuleKind::CodeOwner {
            return configured;
        }
        if !self.branch_requires_code_owner_approval() || self.approvers().is_empty() {
            0
        } else {
            configured.max(MIN_CODE_OWNER_APPROVALS)
        }
    }

    fn applies_to_target_branch(&self) -> bool {
        let target = &self.ctx.merge_request.target_branch;
        match self.source {
            Some(def) => def.applies_to_branch(target, &self.project.protected_branches),
            None => *target == self.project.default_branch,
        }
    }

    pub fn effective_vulnerability_states(&self) -> BTreeSet<VulnerabilityState> {
        matcher::effective_vulnerability_states(
            self.rule.vulnerability_states(),
            self.applies_to_target_branch(),
        )
    }

    /// Approvers whose approval counts towards this rule.
    pub fn approved_approvers(&self) -> BTreeSet<UserId> {
        if self.ctx.merge_request.is_merged() {
            if let Some(recorded) = self.rule.materialized_approvers() {
                if !recorded.is_empty() {
                    return recorded.clone();
                }
            }
        }
        let approvals = &self.ctx.tally.approved_by;
        if self.is_any_approver() {
            return approvals.clone();
        }
        self.approvers().intersection(approvals).copied().collect()
    }

    pub fn unactioned_approvers(&self) -> BTreeSet<UserId> {
        let approved = self.approved_approvers();
        self.approvers().difference(&approved).copied().collect()
    }

    /// Approvers who left a non-system comment.
    pub fn commented_approvers(&self) -> BTreeSet<UserId> {
        let commenters = self.ctx.tally.commenters();
        self.approvers().intersection(&commenters).copied().collect()
    }

    pub fn approvals_left(&self) -> u32 {
        let approved = u32::try_from(self.approved_approvers().len()).unwrap_or(u32::MAX);
        self.approvals_required().saturating_sub(approved)
    }

    /// The rule can never be satisfied: more approvals are still needed than
    /// there are approvers left to give them.
    pub fn invalid_rule(&self) -> bool {
        if self.is_any_approver() {
            return false;
        }
        let left = self.approvals_left() as usize;
        self.approvals_required() > 0 && left > self.unactioned_approvers().len()
    }

    pub fn allow_merge_when_invalid(&self) -> bool {
        !self.ctx.config.invalid_policy_prevents_merge
            || self.project.policy_management_project
            || !self.rule.policy_driven()
    }

    pub fn approved(&self) -> bool {
        self.approvals_left() == 0 || (self.invalid_rule() && self.allow_merge_when_invalid())
    }

    pub fn result(&self) -> WrappedRuleResult {
        let result = WrappedRuleResult {
            name: self.name().to_string(),
            kind: self.rule.kind(),
            report_type: self.rule.report_type(),
            effective_approvals_required: self.approvals_required(),
            effective_vulnerability_states: self.effective_vulnerability_states(),
            approvals_left: self.approvals_left(),
            approved: self.approved(),
            invalid: self.invalid_rule(),
            allow_merge_when_invalid: self.allow_merge_when_invalid(),
            approvers: self.approvers(),
            approved_approvers: self.approved_approvers(),
            unactioned_approvers: self.unactioned_approvers(),
            commented_approvers: self.commented_approvers(),
        };
        obs::emit_rule_evaluated(
            &result.name,
            result.effective_approvals_required,
            result.approvals_left,
            result.approved,
        );
        result
    }
}

/// Derived evaluation outcome. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedRuleResult {
    pub name: String,
    pub kind: RuleKind,
    pub report_type: Option<ReportType>,
    pub effective_approvals_required: u32,
    pub effective_vulnerability_states: BTreeSet<VulnerabilityState>,
    pub approvals_left: u32,
    pub approved: bool,
    pub invalid: bool,
    pub allow_merge_when_invalid: bool,
    pub approvers: BTreeSet<UserId>,
    pub approved_approvers: BTreeSet<UserId>,
    pub unactioned_approvers: BTreeSet<UserId>,
    pub commented_approvers: BTreeSet<UserId>,
}

/// Evaluate every rule of a merge request.
pub fn evaluate_all<R: ApprovalRuleView>(
    ctx: EvaluationContext<'_>,
    rules: &[R],
) -> Result<Vec<WrappedRuleResult>, ContextError> {
    rules
        .iter()
        .map(|rule| WrappedRule::new(ctx, rule).map(|w| w.result()))
        .collect()
}
