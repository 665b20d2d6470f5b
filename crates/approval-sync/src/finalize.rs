//! Record who satisfied each rule when a merge request is merged.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::Instrument;

use approval_core::obs;
use approval_core::{
    ApprovalTally, EngineConfig, EvaluationContext, MembershipDirectory, MergeRequestContext,
    ProjectedRuleId, UserId, WrappedRule,
};

use crate::error::SyncResult;
use crate::projector::Synchronizer;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizedRule {
    pub rule_id: ProjectedRuleId,
    pub name: String,
    pub approved_approvers: BTreeSet<UserId>,
    /// The recorded set differed and was written.
    pub written: bool,
}

impl Synchronizer {
    /// Persist approved approvers for every rule of a merged merge request.
    ///
    /// Any-approver rules record every approval. Unmerged merge requests are
    /// a no-op, and a second call writes nothing new.
    pub async fn finalize_merge(
        &self,
        mr: &MergeRequestContext,
        tally: &ApprovalTally,
        directory: &dyn MembershipDirectory,
    ) -> SyncResult<Vec<FinalizedRule>> {
        let result = self
            .finalize_inner(mr, tally, directory, &self.config)
            .instrument(obs::sync_span(mr.id))
            .await;
        if let Err(e) = &result {
            obs::emit_sync_error(mr.id, e);
        }
        result
    }

    async fn finalize_inner(
        &self,
        mr: &MergeRequestContext,
        tally: &ApprovalTally,
        directory: &dyn MembershipDirectory,
        config: &EngineConfig,
    ) -> SyncResult<Vec<FinalizedRule>> {
        if !mr.is_merged() {
            return Ok(Vec::new());
        }

        let ctx = EvaluationContext {
            merge_request: mr,
            tally,
            directory,
            config,
        };
        let rules = self.store.list_for_merge_request(mr.id).await?;
        let mut finalized = Vec::with_capacity(rules.len());

        for rule in &rules {
            let approved = WrappedRule::new(ctx, rule)?.approved_approvers();
            let written = approved != rule.approved_approvers;
            if written {
                self.store
                    .record_approved_approvers(rule.id, approved.clone())
                    .await?;
            }
            finalized.push(FinalizedRule {
                rule_id: rule.id,
                name: rule.name().to_string(),
                approved_approvers: approved,
                written,
            });
        }

        obs::emit_finalized(mr.id, finalized.len());
        Ok(finalized)
    }
}
