//! Error types for approval-sync

use thiserror::Error;

use approval_core::{ContextError, ProjectionError};
use approval_state::StorageError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl SyncError {
    /// The caller handed in something that can never succeed on retry.
    pub fn is_caller_error(&self) -> bool {
        !matches!(self, SyncError::Storage(_))
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
