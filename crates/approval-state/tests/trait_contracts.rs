//! Contract tests for MergeRequestRuleStore.
//!
//! Every check runs against the in-memory fake and the SurrealDB `mem://`
//! backend; both must behave identically.

use std::collections::BTreeSet;

use approval_core::{
    project_onto_merge_request, CodeOwnerEntry, MergeRequestContext, MergeRequestId,
    PolicyConfigurationId, ProjectContext, ProjectId, ProjectedMergeRequestRule, ProjectedRuleId,
    ReportType, RuleDefinition, RuleId, UserId,
};
use approval_state::{MemoryRuleStore, MergeRequestRuleStore, StorageError, SurrealRuleStore, UpsertOutcome};

fn mr(id: u64) -> MergeRequestContext {
    MergeRequestContext::new(MergeRequestId(id), ProjectContext::new(ProjectId(1)), "main", UserId(99))
}

fn scan_finding(rule_id: u64, approvals: i64) -> RuleDefinition {
    RuleDefinition::report_approver(ProjectId(1), "Scan finding", ReportType::ScanFinding)
        .with_id(RuleId(rule_id))
        .with_protected_branches(["main"])
        .with_policy(PolicyConfigurationId(1), 0)
        .with_approvals_required(approvals)
        .with_users([UserId(5)])
}

fn projected(def: &RuleDefinition, mr_id: u64) -> ProjectedMergeRequestRule {
    project_onto_merge_request(def, &mr(mr_id), None).unwrap().rule
}

// ===========================================================================
// Contracts
// ===========================================================================

async fn upsert_creates_then_is_unchanged(store: &dyn MergeRequestRuleStore) {
    let rule = projected(&scan_finding(7, 2), 42);
    assert_eq!(store.upsert(rule.clone()).await.unwrap(), UpsertOutcome::Created);
    assert_eq!(store.upsert(rule.clone()).await.unwrap(), UpsertOutcome::Unchanged);

    let all = store.list_for_merge_request(MergeRequestId(42)).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0], rule);
}

async fn upsert_keeps_stored_id(store: &dyn MergeRequestRuleStore) {
    let first = projected(&scan_finding(7, 2), 42);
    store.upsert(first.clone()).await.unwrap();

    let mut changed = projected(&scan_finding(7, 3), 42);
    changed.id = ProjectedRuleId::new();
    assert_eq!(store.upsert(changed).await.unwrap(), UpsertOutcome::Updated);

    let key = first.key().unwrap();
    let stored = store.find_by_key(&key).await.unwrap().unwrap();
    assert_eq!(stored.id, first.id);
    assert_eq!(stored.approvals_required(), 3);
}

async fn find_by_key_missing_is_none(store: &dyn MergeRequestRuleStore) {
    let key = projected(&scan_finding(1, 1), 5).key().unwrap();
    assert!(store.find_by_key(&key).await.unwrap().is_none());
}

async fn get_unknown_id_is_not_found(store: &dyn MergeRequestRuleStore) {
    let err = store.get(ProjectedRuleId::new()).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
}

async fn insert_conflicts_on_taken_key(store: &dyn MergeRequestRuleStore) {
    let entry = CodeOwnerEntry::new("*.rb").with_users([UserId(1)]);
    store
        .insert(ProjectedMergeRequestRule::code_owner(MergeRequestId(3), &entry))
        .await
        .unwrap();
    let err = store
        .insert(ProjectedMergeRequestRule::code_owner(MergeRequestId(3), &entry))
        .await
        .unwrap_err();
    assert!(err.is_conflict(), "expected conflict, got {err:?}");

    let found = store
        .find_code_owner_rule(MergeRequestId(3), "*.rb", "codeowners")
        .await
        .unwrap();
    assert!(found.is_some());
}

async fn list_is_scoped_and_ordered(store: &dyn MergeRequestRuleStore) {
    store.upsert(projected(&scan_finding(9, 1), 42)).await.unwrap();
    store.upsert(projected(&scan_finding(8, 1), 42)).await.unwrap();
    store.upsert(projected(&scan_finding(8, 1), 43)).await.unwrap();

    let rules = store.list_for_merge_request(MergeRequestId(42)).await.unwrap();
    let sources: Vec<Option<RuleId>> = rules.iter().map(|r| r.source_rule_id).collect();
    assert_eq!(sources, vec![Some(RuleId(8)), Some(RuleId(9))]);
}

async fn updates_by_id(store: &dyn MergeRequestRuleStore) {
    let rule = projected(&scan_finding(7, 2), 42);
    store.upsert(rule.clone()).await.unwrap();

    store.update_approvals_required(rule.id, 0).await.unwrap();
    store
        .record_approved_approvers(rule.id, BTreeSet::from([UserId(5)]))
        .await
        .unwrap();

    let stored = store.get(rule.id).await.unwrap();
    assert_eq!(stored.approvals_required(), 0);
    assert_eq!(stored.approved_approvers, BTreeSet::from([UserId(5)]));

    let err = store
        .update_approvals_required(ProjectedRuleId::new(), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
}

async fn delete_removes_only_one_merge_request(store: &dyn MergeRequestRuleStore) {
    store.upsert(projected(&scan_finding(1, 1), 42)).await.unwrap();
    store.upsert(projected(&scan_finding(2, 1), 42)).await.unwrap();
    store.upsert(projected(&scan_finding(1, 1), 43)).await.unwrap();

    assert_eq!(store.delete_for_merge_request(MergeRequestId(42)).await.unwrap(), 2);
    assert!(store.list_for_merge_request(MergeRequestId(42)).await.unwrap().is_empty());
    assert_eq!(store.list_for_merge_request(MergeRequestId(43)).await.unwrap().len(), 1);
}

async fn unkeyed_rules_are_rejected(store: &dyn MergeRequestRuleStore) {
    let mut rule = projected(&scan_finding(7, 1), 42);
    rule.source_rule_id = None;
    let err = store.upsert(rule).await.unwrap_err();
    assert!(matches!(err, StorageError::Unkeyed { .. }));
}

// ===========================================================================
// Backends
// ===========================================================================

macro_rules! contract_suite {
    ($($name:ident),* $(,)?) => {
        mod memory {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    let store = MemoryRuleStore::new();
                    super::$name(&store).await;
                }
            )*
        }

        mod surreal {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    let store = SurrealRuleStore::in_memory().await.unwrap();
                    super::$name(&store).await;
                }
            )*
        }
    };
}

contract_suite!(
    upsert_creates_then_is_unchanged,
    upsert_keeps_stored_id,
    find_by_key_missing_is_none,
    get_unknown_id_is_not_found,
    insert_conflicts_on_taken_key,
    list_is_scoped_and_ordered,
    updates_by_id,
    delete_removes_only_one_merge_request,
    unkeyed_rules_are_rejected,
);

#[tokio::test]
async fn memory_store_skips_unchanged_writes() {
    let store = MemoryRuleStore::new();
    let rule = projected(&scan_finding(7, 2), 42);
    store.upsert(rule.clone()).await.unwrap();
    store.upsert(rule).await.unwrap();
    assert_eq!(store.write_count(), 1);
}

#[tokio::test]
async fn memory_store_counts_deletes_as_writes() {
    let store = MemoryRuleStore::new();
    store.upsert(projected(&scan_finding(7, 2), 42)).await.unwrap();

    assert_eq!(store.delete_for_merge_request(MergeRequestId(43)).await.unwrap(), 0);
    assert_eq!(store.write_count(), 1);
    assert_eq!(store.delete_for_merge_request(MergeRequestId(42)).await.unwrap(), 1);
    assert_eq!(store.write_count(), 2);
}
