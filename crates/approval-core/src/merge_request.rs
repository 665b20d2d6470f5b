//! Merge request context handed to evaluation by callers.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::{MergeRequestId, ProjectId, UserId};
use crate::matcher::ProtectedBranch;

/// Lifecycle state of a merge request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRequestState {
    #[default]
    Opened,
    Closed,
    Locked,
    Merged,
}

impl MergeRequestState {
    /// Transition taken when the merge request is merged.
    ///
    /// Only open or locked merge requests can be merged; any other state is
    /// returned unchanged in `Err`.
    pub fn merge(self) -> Result<Self, Self> {
        match self {
            Self::Opened | Self::Locked => Ok(Self::Merged),
            other => Err(other),
        }
    }

    pub fn close(self) -> Result<Self, Self> {
        match self {
            Self::Opened | Self::Locked => Ok(Self::Closed),
            other => Err(other),
        }
    }

    pub fn reopen(self) -> Result<Self, Self> {
        match self {
            Self::Closed => Ok(Self::Opened),
            other => Err(other),
        }
    }

    pub fn is_merged(self) -> bool {
        self == Self::Merged
    }
}

/// Project settings that influence evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectContext {
    pub id: ProjectId,
    #[serde(default = "default_branch_name")]
    pub default_branch: String,
    /// Code-owner approval capability (a licensed feature).
    #[serde(default)]
    pub code_owner_approval_enabled: bool,
    #[serde(default)]
    pub author_approval_allowed: bool,
    /// The project hosts security policies for other projects.
    #[serde(default)]
    pub policy_management_project: bool,
    #[serde(default)]
    pub protected_branches: Vec<ProtectedBranch>,
}

fn default_branch_name() -> String {
    "main".to_string()
}

impl ProjectContext {
    pub fn new(id: ProjectId) -> Self {
        Self {
            id,
            default_branch: default_branch_name(),
            code_owner_approval_enabled: false,
            author_approval_allowed: false,
            policy_management_project: false,
            protected_branches: Vec::new(),
        }
    }

    pub fn with_default_branch(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = branch.into();
        self
    }

    pub fn with_code_owner_approval(mut self) -> Self {
        self.code_owner_approval_enabled = true;
        self
    }

    pub fn with_protected_branch(mut self, branch: ProtectedBranch) -> Self {
        self.protected_branches.push(branch);
        self
    }
}

/// Everything evaluation needs to know about one merge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequestContext {
    pub id: MergeRequestId,
    /// Target project. Evaluation fails without it.
    #[serde(default)]
    pub project: Option<ProjectContext>,
    pub target_branch: String,
    pub author: UserId,
    #[serde(default)]
    pub state: MergeRequestState,
    /// Code-owner sections marked optional in the CODEOWNERS file.
    #[serde(default)]
    pub optional_code_owner_sections: BTreeSet<String>,
}

impl MergeRequestContext {
    pub fn new(id: MergeRequestId, project: ProjectContext, target_branch: impl Into<String>, author: UserId) -> Self {
        Self {
            id,
            project: Some(project),
            target_branch: target_branch.into(),
            author,
            state: MergeRequestState::Opened,
            optional_code_owner_sections: BTreeSet::new(),
        }
    }

    pub fn is_merged(&self) -> bool {
        self.state.is_merged()
    }

    pub fn is_section_optional(&self, section: &str) -> bool {
        self.optional_code_owner_sections.contains(section)
    }
}

/// A note left on a merge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub author: UserId,
    /// Generated by the system rather than written by the author.
    #[serde(default)]
    pub system: bool,
}

/// Approvals and comments recorded on a merge request so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalTally {
    pub merge_request_id: MergeRequestId,
    #[serde(default)]
    pub approved_by: BTreeSet<UserId>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl ApprovalTally {
    pub fn new(merge_request_id: MergeRequestId) -> Self {
        Self {
            merge_request_id,
            ..Self::default()
        }
    }

    pub fn approve(mut self, user: UserId) -> Self {
        self.approved_by.insert(user);
        self
    }

    pub fn comment(mut self, author: UserId) -> Self {
        self.comments.push(Comment { author, system: false });
        self
    }

    pub fn system_note(mut self, author: UserId) -> Self {
        self.comments.push(Comment { author, system: true });
        self
    }

    /// Authors of non-system comments.
    pub fn commenters(&self) -> BTreeSet<UserId> {
        self.comments
            .iter()
            .filter(|c| !c.system)
            .map(|c| c.author)
            .collect()
    }
}
