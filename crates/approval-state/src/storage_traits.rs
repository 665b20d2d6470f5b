//! Storage trait for rules materialised onto merge requests.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use approval_core::{
    MergeRequestId, ProjectedMergeRequestRule, ProjectedRuleId, ProjectionChange, ProjectionKey,
    UserId,
};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// What an upsert did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// Stored content already matched; nothing was written.
    Unchanged,
}

impl From<UpsertOutcome> for ProjectionChange {
    fn from(outcome: UpsertOutcome) -> Self {
        match outcome {
            UpsertOutcome::Created => ProjectionChange::Created,
            UpsertOutcome::Updated => ProjectionChange::Updated,
            UpsertOutcome::Unchanged => ProjectionChange::Unchanged,
        }
    }
}

/// Persistence for [`ProjectedMergeRequestRule`]s.
///
/// Guarantees:
/// - At most one record per [`ProjectionKey`].
/// - `upsert` of content equal to the stored record writes nothing and
///   reports [`UpsertOutcome::Unchanged`].
/// - An upserted record keeps the id of the record it replaces.
#[async_trait]
pub trait MergeRequestRuleStore: Send + Sync {
    async fn find_by_key(&self, key: &ProjectionKey) -> StorageResult<Option<ProjectedMergeRequestRule>>;

    /// Retrieve by id. Returns `StorageError::NotFound` if absent.
    async fn get(&self, id: ProjectedRuleId) -> StorageResult<ProjectedMergeRequestRule>;

    /// Store a new record. Fails with `StorageError::Conflict` when its key
    /// is taken.
    async fn insert(&self, rule: ProjectedMergeRequestRule) -> StorageResult<()>;

    /// Create or replace the record stored under the rule's key.
    async fn upsert(&self, rule: ProjectedMergeRequestRule) -> StorageResult<UpsertOutcome>;

    /// All records of one merge request, ordered by storage key.
    async fn list_for_merge_request(
        &self,
        merge_request: MergeRequestId,
    ) -> StorageResult<Vec<ProjectedMergeRequestRule>>;

    async fn update_approvals_required(&self, id: ProjectedRuleId, approvals_required: u32) -> StorageResult<()>;

    /// Persist the approvers who satisfied the rule at merge time.
    async fn record_approved_approvers(&self, id: ProjectedRuleId, approvers: BTreeSet<UserId>) -> StorageResult<()>;

    /// Remove every record of one merge request, returning how many were removed.
    async fn delete_for_merge_request(&self, merge_request: MergeRequestId) -> StorageResult<usize>;

    async fn find_code_owner_rule(
        &self,
        merge_request: MergeRequestId,
        pattern: &str,
        section: &str,
    ) -> StorageResult<Option<ProjectedMergeRequestRule>> {
        self.find_by_key(&ProjectionKey::code_owner(merge_request, pattern, section))
            .await
    }
}

/// Storage key of `rule`, or `StorageError::Unkeyed`.
pub(crate) fn key_of(rule: &ProjectedMergeRequestRule) -> StorageResult<ProjectionKey> {
    rule.key().ok_or_else(|| StorageError::Unkeyed {
        rule: rule.name().to_string(),
    })
}

/// Outcome of replacing `stored` with `incoming`, and the record to write.
pub(crate) fn merge_upsert(
    stored: Option<&ProjectedMergeRequestRule>,
    mut incoming: ProjectedMergeRequestRule,
) -> (UpsertOutcome, ProjectedMergeRequestRule) {
    match stored {
        None => (UpsertOutcome::Created, incoming),
        Some(prev) => {
            incoming.id = prev.id;
            if prev.fingerprint() == incoming.fingerprint() {
                (UpsertOutcome::Unchanged, incoming)
            } else {
                (UpsertOutcome::Updated, incoming)
            }
        }
    }
}
