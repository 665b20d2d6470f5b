//! Error types for approval-state

use thiserror::Error;

/// Errors raised by merge-request rule stores.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No record with this id or key
    #[error("rule not found: {key}")]
    NotFound { key: String },

    /// A record already exists under this key
    #[error("rule already exists: {key}")]
    Conflict { key: String },

    /// The record has no projection key and cannot be stored
    #[error("rule {rule} has no projection key")]
    Unkeyed { rule: String },

    /// Could not reach or initialise the backend
    #[error("storage connection failed: {0}")]
    Connection(String),

    /// Backend query failed
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Record could not be encoded or decoded
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl StorageError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
