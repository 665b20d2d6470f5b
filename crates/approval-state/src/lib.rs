//! Approval State: persistence for merge-request approval rules
//!
//! ## Layer 0 - Data/Persistence
//!
//! - `MergeRequestRuleStore`: async storage trait keyed by projection key
//! - `MemoryRuleStore`: in-memory fake satisfying the same contract
//! - `SurrealRuleStore`: SurrealDB backend with a unique index per key

mod error;
pub mod fakes;
pub mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::StorageError;
pub use fakes::MemoryRuleStore;
pub use storage_traits::{MergeRequestRuleStore, StorageResult, UpsertOutcome};
pub use surreal_store::SurrealRuleStore;
