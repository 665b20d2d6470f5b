//! SurrealDB-backed [`MergeRequestRuleStore`]
//!
//! Uniqueness per projection key is enforced by the `idx_rule_key` index, so
//! two processes racing to create the same rule cannot both succeed. The
//! loser's create fails and is retried once as an update.
//!
//! Updates by id are compare-and-swap on the stored fingerprint: the single
//! `UPDATE` only matches the row that was read, and a lost race re-reads.

use std::collections::BTreeSet;

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use approval_core::{MergeRequestId, ProjectedMergeRequestRule, ProjectedRuleId, ProjectionKey, UserId};

use crate::error::StorageError;
use crate::migrations::{self, RULES_TABLE};
use crate::schema::RuleRow;
use crate::storage_traits::{key_of, merge_upsert, MergeRequestRuleStore, StorageResult, UpsertOutcome};

const NAMESPACE: &str = "approvals";
const DATABASE: &str = "main";
const LOCAL_DB_PATH: &str = ".approvals/db";
const MODIFY_ATTEMPTS: usize = 5;

/// The create hit an existing record or a unique index entry.
fn is_unique_violation(err: &surrealdb::Error) -> bool {
    use surrealdb::error::Db;
    matches!(
        err,
        surrealdb::Error::Db(Db::IndexExists { .. } | Db::RecordExists { .. })
    )
}

pub struct SurrealRuleStore {
    db: Surreal<Any>,
}

impl SurrealRuleStore {
    /// Connect to `url`, select `approvals/main` and initialise the schema.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StorageError::Connection(format!("failed to connect to {url}: {e}")))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        Ok(Self { db })
    }

    /// In-memory instance for tests and one-shot CLI runs.
    pub async fn in_memory() -> StorageResult<Self> {
        let store = Self::connect("mem://").await?;
        info!("SurrealRuleStore connected (in-memory)");
        Ok(store)
    }

    /// Connect using `APPROVAL_SURREALDB_URL` or `SURREALDB_URL`, falling back
    /// to local persistence under `.approvals/db`.
    pub async fn from_env() -> StorageResult<Self> {
        let url = std::env::var("APPROVAL_SURREALDB_URL")
            .or_else(|_| std::env::var("SURREALDB_URL"))
            .ok();

        if let Some(url) = url {
            let store = Self::connect(&url).await?;
            info!("SurrealRuleStore connected ({})", url);
            return Ok(store);
        }

        std::fs::create_dir_all(LOCAL_DB_PATH).map_err(|e| {
            StorageError::Connection(format!(
                "Failed to create database directory {LOCAL_DB_PATH}: {e}"
            ))
        })?;
        let url = format!("surrealkv://{LOCAL_DB_PATH}");
        info!("No SURREALDB_URL found, using local persistence: {}", url);
        Self::connect(&url).await
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_by_key(&self, key: String) -> StorageResult<Option<RuleRow>> {
        let mut res = self
            .db
            .query("SELECT * FROM merge_request_rules WHERE rule_key = $key")
            .bind(("key", key))
            .await?;
        let rows: Vec<RuleRow> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_row_by_id(&self, id: ProjectedRuleId) -> StorageResult<RuleRow> {
        let mut res = self
            .db
            .query("SELECT * FROM merge_request_rules WHERE rule_id = $rid")
            .bind(("rid", id.to_string()))
            .await?;
        let rows: Vec<RuleRow> = res.take(0)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::NotFound { key: id.to_string() })
    }

    async fn fetch_by_id(&self, id: ProjectedRuleId) -> StorageResult<ProjectedMergeRequestRule> {
        self.fetch_row_by_id(id).await?.into_rule()
    }

    async fn create_row(&self, row: RuleRow) -> StorageResult<()> {
        let key = row.rule_key.clone();
        let created: Result<Option<RuleRow>, surrealdb::Error> =
            self.db.create(RULES_TABLE).content(row).await;
        match created {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StorageError::Conflict { key }),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_row(&self, row: RuleRow) -> StorageResult<()> {
        self.db
            .query(
                "UPDATE merge_request_rules SET fingerprint = $fingerprint, body = $body \
                 WHERE rule_key = $key",
            )
            .bind(("fingerprint", row.fingerprint))
            .bind(("body", row.body))
            .bind(("key", row.rule_key))
            .await?
            .check()?;
        Ok(())
    }

    /// Replace the row for `row.rule_id` only if its fingerprint is still
    /// `expected`. Returns whether a row was written.
    async fn swap_row(&self, expected: String, row: RuleRow) -> StorageResult<bool> {
        let mut res = self
            .db
            .query(
                "UPDATE merge_request_rules SET fingerprint = $fingerprint, body = $body \
                 WHERE rule_id = $rid AND fingerprint = $expected RETURN AFTER",
            )
            .bind(("fingerprint", row.fingerprint))
            .bind(("body", row.body))
            .bind(("rid", row.rule_id))
            .bind(("expected", expected))
            .await?
            .check()?;
        let updated: Vec<RuleRow> = res.take(0)?;
        Ok(!updated.is_empty())
    }

    async fn modify(
        &self,
        id: ProjectedRuleId,
        apply: impl Fn(&mut ProjectedMergeRequestRule) + Send + Sync,
    ) -> StorageResult<()> {
        for attempt in 1..=MODIFY_ATTEMPTS {
            let row = self.fetch_row_by_id(id).await?;
            let expected = row.fingerprint.clone();
            let mut rule = row.into_rule()?;
            apply(&mut rule);
            if self.swap_row(expected, RuleRow::from_rule(&rule)?).await? {
                return Ok(());
            }
            debug!(rule_id = %id, attempt, "rule changed underneath update, retrying");
        }
        Err(StorageError::Conflict { key: id.to_string() })
    }
}

#[async_trait]
impl MergeRequestRuleStore for SurrealRuleStore {
    async fn find_by_key(&self, key: &ProjectionKey) -> StorageResult<Option<ProjectedMergeRequestRule>> {
        self.fetch_by_key(key.storage_key())
            .await?
            .map(RuleRow::into_rule)
            .transpose()
    }

    async fn get(&self, id: ProjectedRuleId) -> StorageResult<ProjectedMergeRequestRule> {
        self.fetch_by_id(id).await
    }

    async fn insert(&self, rule: ProjectedMergeRequestRule) -> StorageResult<()> {
        let row = RuleRow::from_rule(&rule)?;
        debug!(key = %row.rule_key, "inserting merge request rule");
        self.create_row(row).await
    }

    async fn upsert(&self, rule: ProjectedMergeRequestRule) -> StorageResult<UpsertOutcome> {
        let key = key_of(&rule)?.storage_key();
        let stored = self
            .fetch_by_key(key.clone())
            .await?
            .map(RuleRow::into_rule)
            .transpose()?;

        let (outcome, record) = merge_upsert(stored.as_ref(), rule);
        match outcome {
            UpsertOutcome::Unchanged => Ok(outcome),
            UpsertOutcome::Updated => {
                self.replace_row(RuleRow::from_rule(&record)?).await?;
                Ok(outcome)
            }
            UpsertOutcome::Created => match self.create_row(RuleRow::from_rule(&record)?).await {
                Ok(()) => Ok(outcome),
                Err(e) if e.is_conflict() => {
                    debug!(key = %key, "lost create race, retrying as update");
                    let current = self
                        .fetch_by_key(key.clone())
                        .await?
                        .ok_or(StorageError::NotFound { key })?
                        .into_rule()?;
                    let (retry, record) = merge_upsert(Some(&current), record);
                    if retry == UpsertOutcome::Updated {
                        self.replace_row(RuleRow::from_rule(&record)?).await?;
                    }
                    Ok(retry)
                }
                Err(e) => Err(e),
            },
        }
    }

    async fn list_for_merge_request(
        &self,
        merge_request: MergeRequestId,
    ) -> StorageResult<Vec<ProjectedMergeRequestRule>> {
        let mut res = self
            .db
            .query("SELECT * FROM merge_request_rules WHERE merge_request_id = $mr ORDER BY rule_key ASC")
            .bind(("mr", merge_request.0))
            .await?;
        let rows: Vec<RuleRow> = res.take(0)?;
        rows.into_iter().map(RuleRow::into_rule).collect()
    }

    async fn update_approvals_required(&self, id: ProjectedRuleId, approvals_required: u32) -> StorageResult<()> {
        self.modify(id, |rule| rule.attributes.set_approvals_required(approvals_required))
            .await
    }

    async fn record_approved_approvers(&self, id: ProjectedRuleId, approvers: BTreeSet<UserId>) -> StorageResult<()> {
        self.modify(id, move |rule| rule.approved_approvers = approvers.clone())
            .await
    }

    async fn delete_for_merge_request(&self, merge_request: MergeRequestId) -> StorageResult<usize> {
        let mut res = self
            .db
            .query("DELETE merge_request_rules WHERE merge_request_id = $mr RETURN BEFORE")
            .bind(("mr", merge_request.0))
            .await?;
        let removed: Vec<RuleRow> = res.take(0)?;
        Ok(removed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approval_core::{
        project_onto_merge_request, MergeRequestContext, PolicyConfigurationId, ProjectContext, ProjectId,
        ReportType, RuleDefinition, RuleId,
    };

    fn rule() -> ProjectedMergeRequestRule {
        let def = RuleDefinition::report_approver(ProjectId(1), "Scan finding", ReportType::ScanFinding)
            .with_id(RuleId(7))
            .with_protected_branches(["main"])
            .with_policy(PolicyConfigurationId(1), 0)
            .with_approvals_required(2);
        let mr = MergeRequestContext::new(MergeRequestId(42), ProjectContext::new(ProjectId(1)), "main", UserId(1));
        project_onto_merge_request(&def, &mr, None).unwrap().rule
    }

    #[tokio::test]
    async fn swap_rejects_a_stale_fingerprint() {
        let store = SurrealRuleStore::in_memory().await.unwrap();
        let rule = rule();
        store.upsert(rule.clone()).await.unwrap();
        let stale = store.fetch_row_by_id(rule.id).await.unwrap().fingerprint;

        store.update_approvals_required(rule.id, 0).await.unwrap();

        let mut overwrite = rule.clone();
        overwrite.approved_approvers.insert(UserId(5));
        let swapped = store
            .swap_row(stale, RuleRow::from_rule(&overwrite).unwrap())
            .await
            .unwrap();
        assert!(!swapped);

        let stored = store.get(rule.id).await.unwrap();
        assert_eq!(stored.approvals_required(), 0);
        assert!(stored.approved_approvers.is_empty());
    }
}
