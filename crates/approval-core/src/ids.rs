//! Strongly-typed identifiers for projects, groups, users, rules and merge requests.

use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(
    /// Project owning rule definitions and protected branches.
    ProjectId
);
numeric_id!(
    /// Group (namespace) that users can be members of.
    GroupId
);
numeric_id!(
    /// A user who can approve, comment or deploy.
    UserId
);
numeric_id!(
    /// Project-level rule definition identifier.
    RuleId
);
numeric_id!(
    /// Merge request identifier (the `iid` scoped to a project is not used).
    MergeRequestId
);
numeric_id!(
    /// Security policy configuration that drives scan-finding rules.
    PolicyConfigurationId
);
numeric_id!(
    /// Protected environment identifier.
    ProtectedEnvironmentId
);
numeric_id!(EnvironmentId);

/// Identifier of a rule materialised onto a merge request.
///
/// Generated by the sync layer when a projection key is seen for the first
/// time; stable across later updates of the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectedRuleId(pub uuid::Uuid);

impl ProjectedRuleId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ProjectedRuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProjectedRuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
