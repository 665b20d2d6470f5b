//! Row layout of the `merge_request_rules` table.

use serde::{Deserialize, Serialize};

use approval_core::ProjectedMergeRequestRule;

use crate::error::StorageError;
use crate::storage_traits::{key_of, StorageResult};

/// One stored rule.
///
/// The rule itself is kept as JSON text in `body`; the other columns exist
/// for indexing and lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub rule_key: String,
    pub rule_id: String,
    pub merge_request_id: u64,
    pub fingerprint: String,
    pub body: String,
}

impl RuleRow {
    pub fn from_rule(rule: &ProjectedMergeRequestRule) -> StorageResult<Self> {
        Ok(Self {
            id: None,
            rule_key: key_of(rule)?.storage_key(),
            rule_id: rule.id.to_string(),
            merge_request_id: rule.merge_request_id.0,
            fingerprint: rule.fingerprint(),
            body: serde_json::to_string(rule)?,
        })
    }

    pub fn into_rule(self) -> StorageResult<ProjectedMergeRequestRule> {
        serde_json::from_str(&self.body).map_err(|e| {
            StorageError::Serialization(format!("row {}: {e}", self.rule_key))
        })
    }
}
