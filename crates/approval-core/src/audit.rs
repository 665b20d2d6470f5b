//! Audit events for approval rule changes.
//!
//! Events are produced by comparing rule snapshots and pushed onto a
//! caller-owned [`AuditQueue`]. A queue that is not active drops events.

use serde::{Deserialize, Serialize};

use crate::directory::MembershipDirectory;
use crate::wrapped::ApprovalRuleView;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApproverKind {
    User,
    Group,
}

impl std::fmt::Display for ApproverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => f.write_str("User"),
            Self::Group => f.write_str("Group"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    RuleCreated {
        rule: String,
        approvals_required: u32,
    },
    ApproverAdded {
        rule: String,
        kind: ApproverKind,
        approver: String,
    },
    ApproverRemoved {
        rule: String,
        kind: ApproverKind,
        approver: String,
    },
}

impl AuditEvent {
    pub fn message(&self) -> String {
        match self {
            Self::RuleCreated {
                approvals_required, ..
            } => format!("Added approval rule with number of required approvals of {approvals_required}"),
            Self::ApproverAdded {
                rule,
                kind,
                approver,
            } => format!("Added {kind} {approver} to approval group on {rule} rule"),
            Self::ApproverRemoved {
                rule,
                kind,
                approver,
            } => format!("Removed {kind} {approver} from approval group on {rule} rule"),
        }
    }
}

impl std::fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

/// Events for a newly created rule.
pub fn creation_events<R: ApprovalRuleView + ?Sized>(rule: &R) -> Vec<AuditEvent> {
    vec![AuditEvent::RuleCreated {
        rule: rule.name().to_string(),
        approvals_required: rule.approvals_required(),
    }]
}

/// Approver additions and removals between two snapshots of one rule.
///
/// Users and groups are named through `directory`; unknown ids fall back to
/// their number.
pub fn diff_approvers<R: ApprovalRuleView + ?Sized>(
    before: &R,
    after: &R,
    directory: &dyn MembershipDirectory,
) -> Vec<AuditEvent> {
    let rule = after.name().to_string();
    let mut events = Vec::new();

    for user in after.users().difference(before.users()) {
        events.push(AuditEvent::ApproverAdded {
            rule: rule.clone(),
            kind: ApproverKind::User,
            approver: directory.user_name(*user).unwrap_or_else(|| user.to_string()),
        });
    }
    for user in before.users().difference(after.users()) {
        events.push(AuditEvent::ApproverRemoved {
            rule: rule.clone(),
            kind: ApproverKind::User,
            approver: directory.user_name(*user).unwrap_or_else(|| user.to_string()),
        });
    }
    for group in after.groups().difference(before.groups()) {
        events.push(AuditEvent::ApproverAdded {
            rule: rule.clone(),
            kind: ApproverKind::Group,
            approver: directory.group_name(*group).unwrap_or_else(|| group.to_string()),
        });
    }
    for group in before.groups().difference(after.groups()) {
        events.push(AuditEvent::ApproverRemoved {
            rule: rule.clone(),
            kind: ApproverKind::Group,
            approver: directory.group_name(*group).unwrap_or_else(|| group.to_string()),
        });
    }
    events
}

/// Request-scoped queue of audit events.
#[derive(Debug, Clone, Default)]
pub struct AuditQueue {
    active: bool,
    events: Vec<AuditEvent>,
}

impl AuditQueue {
    pub fn active() -> Self {
        Self {
            active: true,
            events: Vec::new(),
        }
    }

    pub fn inactive() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn push(&mut self, event: AuditEvent) {
        if self.active {
            self.events.push(event);
        }
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = AuditEvent>) {
        for event in events {
            self.push(event);
        }
    }

    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    pub fn messages(&self) -> Vec<String> {
        self.events.iter().map(AuditEvent::message).collect()
    }

    /// Take the recorded events, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<AuditEvent> {
        std::mem::take(&mut self.events)
    }
}
