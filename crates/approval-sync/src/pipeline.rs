//! Post-processing steps run after a sync returns.
//!
//! The orchestrator builds a [`PostProcessingPipeline`] once and runs it
//! over each [`SyncReport`]. Steps never fail the sync they follow.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use approval_core::{
    creation_events, diff_approvers, AuditEvent, AuditQueue, MembershipDirectory, ProjectionChange,
};

use crate::cache::BranchCache;
use crate::projector::SyncReport;

pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(&self, report: &SyncReport);
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Queues audit events for created rules and approver changes.
///
/// Code-owner rules mirror the CODEOWNERS file and are not audited.
pub struct AuditStep {
    queue: Mutex<AuditQueue>,
    directory: Arc<dyn MembershipDirectory>,
}

impl AuditStep {
    pub fn new(queue: AuditQueue, directory: Arc<dyn MembershipDirectory>) -> Self {
        Self {
            queue: Mutex::new(queue),
            directory,
        }
    }

    /// Take every queued event.
    pub fn drain(&self) -> Vec<AuditEvent> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
    }

    pub fn messages(&self) -> Vec<String> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .messages()
    }
}

impl PostProcessor for AuditStep {
    fn name(&self) -> &'static str {
        "audit"
    }

    fn process(&self, report: &SyncReport) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        for outcome in report.projected.iter().filter(|o| !o.rule.is_code_owner()) {
            match (outcome.change, &outcome.previous) {
                (ProjectionChange::Created, _) => queue.extend(creation_events(&outcome.rule)),
                (ProjectionChange::Updated, Some(before)) => {
                    queue.extend(diff_approvers(before, &outcome.rule, self.directory.as_ref()))
                }
                _ => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cache invalidation
// ---------------------------------------------------------------------------

/// Drops cached branch answers for rules whose projection changed.
pub struct CacheInvalidation {
    branches: Arc<BranchCache>,
}

impl CacheInvalidation {
    pub fn new(branches: Arc<BranchCache>) -> Self {
        Self { branches }
    }
}

impl PostProcessor for CacheInvalidation {
    fn name(&self) -> &'static str {
        "cache_invalidation"
    }

    fn process(&self, report: &SyncReport) {
        let changed: Vec<_> = report.changed().filter_map(|o| o.rule.source_rule_id).collect();
        if changed.is_empty() {
            return;
        }
        let dropped = self
            .branches
            .invalidate_where(|lookup| changed.contains(&lookup.rule));
        debug!(dropped, "invalidated protected branch lookups");
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct PostProcessingPipeline {
    steps: Vec<Arc<dyn PostProcessor>>,
}

impl PostProcessingPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step(mut self, step: Arc<dyn PostProcessor>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run each step in registration order.
    pub fn run(&self, report: &SyncReport) {
        for step in &self.steps {
            debug!(step = step.name(), "running post-processor");
            step.process(report);
        }
    }
}
