//! Approval Sync: the write path for merge-request approval rules
//!
//! ## Layer 2 - Synchronisation
//!
//! - `Synchronizer`: idempotent projection, code-owner rules, report sync
//!   and merge finalisation over a `MergeRequestRuleStore`
//! - `KeyedLocks`: per-key serialisation of read-then-write
//! - `PostProcessingPipeline`: audit and cache invalidation after a sync
//! - `TtlCache`: caller-owned cache for protected-branch lookups

pub mod cache;
pub mod code_owner;
pub mod error;
pub mod finalize;
pub mod locks;
pub mod pipeline;
pub mod projector;
pub mod reports;

pub use cache::{BranchCache, BranchLookup, TtlCache};
pub use error::{SyncError, SyncResult};
pub use finalize::FinalizedRule;
pub use locks::KeyedLocks;
pub use pipeline::{AuditStep, CacheInvalidation, PostProcessingPipeline, PostProcessor};
pub use projector::{SyncOutcome, SyncReport, Synchronizer};
pub use reports::ReportSyncOutcome;
