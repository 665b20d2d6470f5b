//! Structured tracing events for rule projection, evaluation and sync.
//!
//! Every event carries an `event` field so log pipelines can filter on it.
//! Verbosity follows `RUST_LOG`; see [`crate::telemetry::init_tracing`].

use tracing::{debug, info};

use crate::ids::MergeRequestId;
use crate::projection::{ProjectionChange, ProjectionKey};

/// RAII guard that tags every event emitted during one merge request sync.
///
/// ```ignore
/// let _span = SyncSpan::enter(MergeRequestId(42));
/// ```
pub struct SyncSpan {
    _span: tracing::span::EnteredSpan,
}

impl SyncSpan {
    pub fn enter(merge_request: MergeRequestId) -> Self {
        Self {
            _span: sync_span(merge_request).entered(),
        }
    }
}

/// The span behind [`SyncSpan`], for instrumenting futures that must stay
/// `Send`.
pub fn sync_span(merge_request: MergeRequestId) -> tracing::Span {
    tracing::info_span!("approval.sync", merge_request_id = %merge_request)
}

/// A rule was written to (or found unchanged on) a merge request.
pub fn emit_rule_projected(key: &ProjectionKey, change: ProjectionChange) {
    info!(event = "rule.projected", key = %key, change = ?change);
}

pub fn emit_rule_evaluated(rule: &str, approvals_required: u32, approvals_left: u32, approved: bool) {
    debug!(
        event = "rule.evaluated",
        rule = %rule,
        approvals_required = approvals_required,
        approvals_left = approvals_left,
        approved = approved,
    );
}

/// Rule validation rejected input (warning level).
pub fn emit_validation_failed(rule: &str, errors: &dyn std::fmt::Display) {
    tracing::warn!(event = "rule.validation_failed", rule = %rule, errors = %errors);
}

/// Report sync decided an action for one report rule.
pub fn emit_report_synced(merge_request: MergeRequestId, rule: &str, action: &str) {
    info!(
        event = "report.synced",
        merge_request_id = %merge_request,
        rule = %rule,
        action = %action,
    );
}

pub fn emit_finalized(merge_request: MergeRequestId, rules: usize) {
    info!(event = "merge_request.finalized", merge_request_id = %merge_request, rules = rules);
}

/// Synchronisation step failed (warning level).
pub fn emit_sync_error(merge_request: MergeRequestId, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "sync.error", merge_request_id = %merge_request, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_span_enters_without_subscriber() {
        let _span = SyncSpan::enter(MergeRequestId(1));
        emit_finalized(MergeRequestId(1), 0);
    }
}
