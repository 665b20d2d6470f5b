//! SurrealDB schema for merge-request rules.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

/// Table holding projected merge-request rules.
pub const RULES_TABLE: &str = "merge_request_rules";

/// Define tables and indexes. Safe to call more than once.
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing approval rule schema");
    init_rules_table(db).await?;
    info!("Approval rule schema ready");
    Ok(())
}

/// ```text
/// TABLE merge_request_rules {
///   rule_key:          STRING (unique; one record per projection key)
///   rule_id:           STRING (unique)
///   merge_request_id:  INT    (indexed)
///   fingerprint:       STRING
///   body:              STRING (JSON-encoded rule)
/// }
/// ```
async fn init_rules_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing {RULES_TABLE} table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS merge_request_rules SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_rule_key ON TABLE merge_request_rules COLUMNS rule_key UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_rule_id ON TABLE merge_request_rules COLUMNS rule_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_mr_rules ON TABLE merge_request_rules COLUMNS merge_request_id;
    "#;

    db.query(sql)
        .await
        .and_then(|response| response.check())
        .map_err(|e| StorageError::Connection(format!("schema setup failed: {e}")))?;
    Ok(())
}
