//! Projection of project rules onto merge requests.
//!
//! Every write is a read-then-write against the store, serialised per
//! projection key by [`KeyedLocks`]. Different keys proceed in parallel.

use std::sync::Arc;

use futures::future::try_join_all;
use serde::Serialize;
use tracing::{debug, Instrument};

use approval_core::obs;
use approval_core::{
    branch_scope_digest, EngineConfig, MergeRequestContext, PipelineReports, ProjectedMergeRequestRule,
    ProjectionChange, ProjectionKey, ReportAction, RuleDefinition,
};
use approval_state::MergeRequestRuleStore;

use crate::cache::{BranchCache, BranchLookup, TtlCache};
use crate::error::SyncResult;
use crate::finalize::FinalizedRule;
use crate::locks::KeyedLocks;
use crate::reports::{action_label, ReportSyncOutcome};

/// Result of projecting one definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub key: ProjectionKey,
    /// The record as stored after the sync.
    pub rule: ProjectedMergeRequestRule,
    pub change: ProjectionChange,
    /// What was stored before, if anything.
    pub previous: Option<ProjectedMergeRequestRule>,
}

/// Everything one merge request sync did, handed to post-processors.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub projected: Vec<SyncOutcome>,
    pub reports: Vec<ReportSyncOutcome>,
    pub finalized: Vec<FinalizedRule>,
}

impl SyncReport {
    /// Outcomes that wrote to the store.
    pub fn changed(&self) -> impl Iterator<Item = &SyncOutcome> {
        self.projected
            .iter()
            .filter(|o| o.change != ProjectionChange::Unchanged)
    }
}

/// Write path for one rule store.
pub struct Synchronizer {
    pub(crate) store: Arc<dyn MergeRequestRuleStore>,
    locks: KeyedLocks,
    branches: Arc<BranchCache>,
    pub(crate) config: EngineConfig,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn MergeRequestRuleStore>, config: EngineConfig) -> Self {
        let branches = Arc::new(TtlCache::new(config.protected_branch_cache_ttl()));
        Self {
            store,
            locks: KeyedLocks::new(),
            branches,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn MergeRequestRuleStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The protected-branch cache, shared with [`crate::CacheInvalidation`].
    pub fn branch_cache(&self) -> Arc<BranchCache> {
        Arc::clone(&self.branches)
    }

    pub(crate) fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    /// Whether `def` governs `mr`'s target branch.
    ///
    /// Answers for saved rules are cached under the rule's branch scope and
    /// the project's live protected branches. Unsaved rules are computed
    /// every time.
    pub fn applies_to_target_branch(&self, def: &RuleDefinition, mr: &MergeRequestContext) -> bool {
        let live = mr
            .project
            .as_ref()
            .map(|p| p.protected_branches.as_slice())
            .unwrap_or_default();
        let Some(rule) = def.id else {
            return def.applies_to_branch(&mr.target_branch, live);
        };
        let lookup = BranchLookup {
            project: def.project_id,
            rule,
            branch: mr.target_branch.clone(),
            scope: branch_scope_digest(def, live),
        };
        self.branches
            .get_or_insert_with(lookup, || def.applies_to_branch(&mr.target_branch, live))
    }

    /// Create or update the merge-request rule for `def`.
    ///
    /// Repeating the call with the same inputs writes nothing and reports
    /// [`ProjectionChange::Unchanged`].
    pub async fn project_onto_merge_request(
        &self,
        def: &RuleDefinition,
        mr: &MergeRequestContext,
    ) -> SyncResult<SyncOutcome> {
        self.project_traced(def, mr, None).await.map(|(outcome, _)| outcome)
    }

    async fn project_traced(
        &self,
        def: &RuleDefinition,
        mr: &MergeRequestContext,
        reports: Option<&PipelineReports>,
    ) -> SyncResult<(SyncOutcome, Option<ReportSyncOutcome>)> {
        let result = self
            .project_locked(def, mr, reports)
            .instrument(obs::sync_span(mr.id))
            .await;
        if let Err(e) = &result {
            obs::emit_sync_error(mr.id, e);
        }
        result
    }

    /// Project `def` and, given `reports`, settle its report action before
    /// the single write made under the key's lock.
    async fn project_locked(
        &self,
        def: &RuleDefinition,
        mr: &MergeRequestContext,
        reports: Option<&PipelineReports>,
    ) -> SyncResult<(SyncOutcome, Option<ReportSyncOutcome>)> {
        let key = ProjectionKey::for_definition(def, mr.id)?;
        let _guard = self.locks.lock(&key.storage_key()).await;

        let previous = self.store.find_by_key(&key).await?;
        let mut projection = approval_core::project_onto_merge_request(def, mr, previous.as_ref())?;

        let report = match reports {
            Some(reports) if !mr.is_merged() => {
                let applies = self.applies_to_target_branch(def, mr);
                let action = self.report_action(&projection.rule, applies, reports);
                let waive = action == ReportAction::LowerToZero && projection.rule.approvals_required() > 0;
                if waive {
                    projection.waive_approvals(previous.as_ref());
                }
                let lowered = waive && previous.as_ref().map_or(true, |p| p.approvals_required() > 0);
                Some(ReportSyncOutcome::new(&projection.rule, action, lowered))
            }
            _ => None,
        };

        let change = if projection.needs_write() {
            self.store.upsert(projection.rule.clone()).await?.into()
        } else {
            debug!(key = %key, "projection unchanged, skipping write");
            ProjectionChange::Unchanged
        };
        obs::emit_rule_projected(&projection.key, change);
        if let Some(report) = &report {
            obs::emit_report_synced(mr.id, &report.name, action_label(&report.action));
        }

        let outcome = SyncOutcome {
            key: projection.key,
            rule: projection.rule,
            change,
            previous,
        };
        Ok((outcome, report))
    }

    /// Project every definition concurrently. Fails on the first error.
    pub async fn project_all(
        &self,
        definitions: &[RuleDefinition],
        mr: &MergeRequestContext,
    ) -> SyncResult<Vec<SyncOutcome>> {
        try_join_all(
            definitions
                .iter()
                .map(|def| self.project_onto_merge_request(def, mr)),
        )
        .await
    }

    /// Project the report-approver definitions governing `mr`'s target
    /// branch, lowering those satisfied by `reports` in the same write.
    ///
    /// Stored report rules with no applicable definition are then synced
    /// against `reports` on their own. Without `reports` every projected
    /// rule takes its definition's count.
    pub async fn sync_merge_request(
        &self,
        definitions: &[RuleDefinition],
        mr: &MergeRequestContext,
        reports: Option<&PipelineReports>,
    ) -> SyncResult<SyncReport> {
        let applicable: Vec<&RuleDefinition> = definitions
            .iter()
            .filter(|def| def.is_report_approver() && self.applies_to_target_branch(def, mr))
            .collect();

        let results = try_join_all(
            applicable
                .iter()
                .map(|def| self.project_traced(def, mr, reports)),
        )
        .await?;

        let mut projected = Vec::with_capacity(results.len());
        let mut report_outcomes = Vec::new();
        for (outcome, report) in results {
            projected.push(outcome);
            report_outcomes.extend(report);
        }

        if let Some(reports) = reports {
            let handled: Vec<_> = projected.iter().map(|o| o.rule.id).collect();
            report_outcomes.extend(
                self.sync_reports_traced(mr, definitions, reports, &handled)
                    .await?,
            );
        }

        Ok(SyncReport {
            projected,
            reports: report_outcomes,
            finalized: Vec::new(),
        })
    }
}
