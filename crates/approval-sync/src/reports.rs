//! Lower report-driven approvals once pipeline reports satisfy them.

use serde::Serialize;
use tracing::{debug, Instrument};

use approval_core::matcher::effective_vulnerability_states;
use approval_core::obs;
use approval_core::{
    evaluate_report_rule, ContextError, FindingFilter, MergeRequestContext, PipelineReports,
    ProjectedMergeRequestRule, ProjectedRuleId, ReportAction, ReportType, RuleDefinition,
};

use crate::error::SyncResult;
use crate::projector::Synchronizer;

/// What report sync did with one merge-request rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportSyncOutcome {
    pub rule_id: ProjectedRuleId,
    pub name: String,
    pub report_type: Option<ReportType>,
    pub action: ReportAction,
    /// This sync took the stored approval count to zero.
    pub lowered: bool,
}

impl ReportSyncOutcome {
    pub(crate) fn new(rule: &ProjectedMergeRequestRule, action: ReportAction, lowered: bool) -> Self {
        Self {
            rule_id: rule.id,
            name: rule.name().to_string(),
            report_type: rule.report_type,
            action,
            lowered,
        }
    }
}

pub(crate) fn action_label(action: &ReportAction) -> &'static str {
    match action {
        ReportAction::LowerToZero => "lower_to_zero",
        ReportAction::Keep { .. } => "keep",
        ReportAction::NotApplicable => "not_applicable",
    }
}

impl Synchronizer {
    /// Evaluate every report rule of `mr` against `reports`.
    ///
    /// `definitions` supply branch applicability for rules linked to a
    /// source; a rule without one applies only when the merge request
    /// targets the default branch. Merged merge requests are left alone.
    pub async fn sync_report_approvals(
        &self,
        mr: &MergeRequestContext,
        definitions: &[RuleDefinition],
        reports: &PipelineReports,
    ) -> SyncResult<Vec<ReportSyncOutcome>> {
        self.sync_reports_traced(mr, definitions, reports, &[]).await
    }

    pub(crate) async fn sync_reports_traced(
        &self,
        mr: &MergeRequestContext,
        definitions: &[RuleDefinition],
        reports: &PipelineReports,
        handled: &[ProjectedRuleId],
    ) -> SyncResult<Vec<ReportSyncOutcome>> {
        let result = self
            .sync_reports_inner(mr, definitions, reports, handled)
            .instrument(obs::sync_span(mr.id))
            .await;
        if let Err(e) = &result {
            obs::emit_sync_error(mr.id, e);
        }
        result
    }

    /// Report action for `rule`, with vulnerability states degraded when the
    /// rule does not govern the target branch.
    pub(crate) fn report_action(
        &self,
        rule: &ProjectedMergeRequestRule,
        applies: bool,
        reports: &PipelineReports,
    ) -> ReportAction {
        let states = effective_vulnerability_states(rule.attributes.vulnerability_states(), applies);
        let filter = FindingFilter::new(&rule.attributes, states);
        evaluate_report_rule(rule.report_type, &filter, reports, &self.config)
    }

    async fn sync_reports_inner(
        &self,
        mr: &MergeRequestContext,
        definitions: &[RuleDefinition],
        reports: &PipelineReports,
        handled: &[ProjectedRuleId],
    ) -> SyncResult<Vec<ReportSyncOutcome>> {
        if mr.is_merged() {
            debug!("merge request already merged, report sync skipped");
            return Ok(Vec::new());
        }
        let project = mr.project.as_ref().ok_or(ContextError::MissingProject(mr.id))?;

        let listed = self.store.list_for_merge_request(mr.id).await?;
        let mut outcomes = Vec::new();

        for candidate in listed
            .iter()
            .filter(|r| r.report_type.is_some() && !handled.contains(&r.id))
        {
            let lock_key = candidate
                .key()
                .map_or_else(|| candidate.id.to_string(), |k| k.storage_key());
            let _guard = self.locks().lock(&lock_key).await;
            // Re-read under the lock; a projection may have rewritten it.
            let rule = self.store.get(candidate.id).await?;

            let applies = match self.source_of(&rule, definitions) {
                Some(def) => self.applies_to_target_branch(def, mr),
                None => mr.target_branch == project.default_branch,
            };
            let action = self.report_action(&rule, applies, reports);

            let lowered = action == ReportAction::LowerToZero && rule.approvals_required() > 0;
            if lowered {
                self.store.update_approvals_required(rule.id, 0).await?;
            }
            obs::emit_report_synced(mr.id, rule.name(), action_label(&action));
            outcomes.push(ReportSyncOutcome::new(&rule, action, lowered));
        }

        Ok(outcomes)
    }

    fn source_of<'d>(
        &self,
        rule: &ProjectedMergeRequestRule,
        definitions: &'d [RuleDefinition],
    ) -> Option<&'d RuleDefinition> {
        let id = rule.source_rule_id?;
        definitions.iter().find(|def| def.id == Some(id))
    }
}
