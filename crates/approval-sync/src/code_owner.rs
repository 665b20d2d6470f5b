//! Code-owner rules, one per (merge request, pattern, section).

use tracing::{debug, Instrument};

use approval_core::obs;
use approval_core::{CodeOwnerEntry, MergeRequestId, ProjectedMergeRequestRule, ProjectionChange};
use approval_state::StorageError;

use crate::error::SyncResult;
use crate::projector::{SyncOutcome, Synchronizer};

impl Synchronizer {
    /// Return the code-owner rule for `entry`, creating it on first sight.
    ///
    /// A creator that loses a race against another process falls back to
    /// reading the winner's record.
    pub async fn find_or_create_code_owner_rule(
        &self,
        merge_request: MergeRequestId,
        entry: &CodeOwnerEntry,
    ) -> SyncResult<SyncOutcome> {
        let result = self
            .find_or_create_locked(merge_request, entry)
            .instrument(obs::sync_span(merge_request))
            .await;
        if let Err(e) = &result {
            obs::emit_sync_error(merge_request, e);
        }
        result
    }

    async fn find_or_create_locked(
        &self,
        merge_request: MergeRequestId,
        entry: &CodeOwnerEntry,
    ) -> SyncResult<SyncOutcome> {
        let key = entry.key(merge_request);
        let _guard = self.locks().lock(&key.storage_key()).await;

        if let Some(existing) = self
            .store
            .find_code_owner_rule(merge_request, &entry.pattern, &entry.section)
            .await?
        {
            return Ok(found(key, existing));
        }

        let rule = ProjectedMergeRequestRule::code_owner(merge_request, entry);
        match self.store.insert(rule.clone()).await {
            Ok(()) => {
                obs::emit_rule_projected(&key, ProjectionChange::Created);
                Ok(SyncOutcome {
                    key,
                    rule,
                    change: ProjectionChange::Created,
                    previous: None,
                })
            }
            Err(e) if e.is_conflict() => {
                debug!(key = %key, "code owner rule created concurrently, reading it back");
                let existing = self
                    .store
                    .find_code_owner_rule(merge_request, &entry.pattern, &entry.section)
                    .await?
                    .ok_or_else(|| StorageError::NotFound {
                        key: key.storage_key(),
                    })?;
                Ok(found(key, existing))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Find or create a rule for every entry of a CODEOWNERS file.
    pub async fn sync_code_owner_rules(
        &self,
        merge_request: MergeRequestId,
        entries: &[CodeOwnerEntry],
    ) -> SyncResult<Vec<SyncOutcome>> {
        futures::future::try_join_all(
            entries
                .iter()
                .map(|entry| self.find_or_create_code_owner_rule(merge_request, entry)),
        )
        .await
    }
}

fn found(key: approval_core::ProjectionKey, rule: ProjectedMergeRequestRule) -> SyncOutcome {
    obs::emit_rule_projected(&key, ProjectionChange::Unchanged);
    SyncOutcome {
        key,
        previous: Some(rule.clone()),
        rule,
        change: ProjectionChange::Unchanged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use approval_core::{EngineConfig, RuleKind, UserId};
    use approval_state::{MemoryRuleStore, MergeRequestRuleStore};

    fn synchronizer() -> (Arc<MemoryRuleStore>, Synchronizer) {
        let store = Arc::new(MemoryRuleStore::new());
        (store.clone(), Synchronizer::new(store, EngineConfig::default()))
    }

    #[tokio::test]
    async fn finds_the_rule_it_created() {
        let (store, sync) = synchronizer();
        let entry = CodeOwnerEntry::new("*.js").with_users([UserId(1)]);

        let created = sync
            .find_or_create_code_owner_rule(MergeRequestId(1), &entry)
            .await
            .unwrap();
        let found = sync
            .find_or_create_code_owner_rule(MergeRequestId(1), &entry)
            .await
            .unwrap();

        assert_eq!(created.change, ProjectionChange::Created);
        assert_eq!(found.change, ProjectionChange::Unchanged);
        assert_eq!(found.rule.id, created.rule.id);
        assert_eq!(found.rule.kind, RuleKind::CodeOwner);
        assert_eq!(store.list_for_merge_request(MergeRequestId(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sections_are_distinct_rules() {
        let (store, sync) = synchronizer();
        let entries = vec![
            CodeOwnerEntry::new("*.js"),
            CodeOwnerEntry::new("*.js").in_section("Frontend"),
        ];

        let outcomes = sync.sync_code_owner_rules(MergeRequestId(1), &entries).await.unwrap();
        assert!(outcomes.iter().all(|o| o.change == ProjectionChange::Created));
        assert_eq!(store.list_for_merge_request(MergeRequestId(1)).await.unwrap().len(), 2);
    }
}
