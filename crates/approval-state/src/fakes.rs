//! In-memory fake for [`MergeRequestRuleStore`] (testing and the CLI)

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use approval_core::{MergeRequestId, ProjectedMergeRequestRule, ProjectedRuleId, ProjectionKey, UserId};

use crate::error::StorageError;
use crate::storage_traits::{key_of, merge_upsert, MergeRequestRuleStore, StorageResult, UpsertOutcome};

/// Rules held in a `BTreeMap<storage key, rule>`.
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    rules: Mutex<BTreeMap<String, ProjectedMergeRequestRule>>,
    writes: Mutex<usize>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes performed so far. Unchanged upserts do not count.
    pub fn write_count(&self) -> usize {
        self.writes.lock().map(|w| *w).unwrap_or_default()
    }

    fn rules(&self) -> StorageResult<MutexGuard<'_, BTreeMap<String, ProjectedMergeRequestRule>>> {
        self.rules
            .lock()
            .map_err(|_| StorageError::Backend("rule map lock poisoned".to_string()))
    }

    fn count_write(&self) {
        if let Ok(mut writes) = self.writes.lock() {
            *writes += 1;
        }
    }

    fn update_by_id(
        &self,
        id: ProjectedRuleId,
        apply: impl FnOnce(&mut ProjectedMergeRequestRule),
    ) -> StorageResult<()> {
        let mut rules = self.rules()?;
        let rule = rules
            .values_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StorageError::NotFound { key: id.to_string() })?;
        apply(rule);
        drop(rules);
        self.count_write();
        Ok(())
    }
}

#[async_trait]
impl MergeRequestRuleStore for MemoryRuleStore {
    async fn find_by_key(&self, key: &ProjectionKey) -> StorageResult<Option<ProjectedMergeRequestRule>> {
        Ok(self.rules()?.get(&key.storage_key()).cloned())
    }

    async fn get(&self, id: ProjectedRuleId) -> StorageResult<ProjectedMergeRequestRule> {
        self.rules()?
            .values()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound { key: id.to_string() })
    }

    async fn insert(&self, rule: ProjectedMergeRequestRule) -> StorageResult<()> {
        let key = key_of(&rule)?.storage_key();
        let mut rules = self.rules()?;
        if rules.contains_key(&key) {
            return Err(StorageError::Conflict { key });
        }
        rules.insert(key, rule);
        drop(rules);
        self.count_write();
        Ok(())
    }

    async fn upsert(&self, rule: ProjectedMergeRequestRule) -> StorageResult<UpsertOutcome> {
        let key = key_of(&rule)?.storage_key();
        let mut rules = self.rules()?;
        let (outcome, record) = merge_upsert(rules.get(&key), rule);
        if outcome != UpsertOutcome::Unchanged {
            rules.insert(key, record);
            drop(rules);
            self.count_write();
        }
        Ok(outcome)
    }

    async fn list_for_merge_request(
        &self,
        merge_request: MergeRequestId,
    ) -> StorageResult<Vec<ProjectedMergeRequestRule>> {
        Ok(self
            .rules()?
            .values()
            .filter(|r| r.merge_request_id == merge_request)
            .cloned()
            .collect())
    }

    async fn update_approvals_required(&self, id: ProjectedRuleId, approvals_required: u32) -> StorageResult<()> {
        self.update_by_id(id, |rule| rule.attributes.set_approvals_required(approvals_required))
    }

    async fn record_approved_approvers(&self, id: ProjectedRuleId, approvers: BTreeSet<UserId>) -> StorageResult<()> {
        self.update_by_id(id, |rule| rule.approved_approvers = approvers)
    }

    async fn delete_for_merge_request(&self, merge_request: MergeRequestId) -> StorageResult<usize> {
        let mut rules = self.rules()?;
        let before = rules.len();
        rules.retain(|_, r| r.merge_request_id != merge_request);
        let removed = before - rules.len();
        if removed > 0 {
            self.count_write();
        }
        Ok(removed)
    }
}
