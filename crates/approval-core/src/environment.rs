//! Protected environments and deploy access.
//!
//! A protected environment is owned either by a project (matched against
//! environments by name) or by a group (matched by environment tier across
//! every project below the group).

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::catalog::UnknownVocabulary;
use crate::config::EngineConfig;
use crate::directory::{AccessLevel, MembershipDirectory};
use crate::error::{EnvironmentError, ValidationErrors};
use crate::ids::{EnvironmentId, GroupId, ProjectId, ProtectedEnvironmentId, UserId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentTier {
    Production,
    Staging,
    Testing,
    Development,
    #[default]
    Other,
}

impl EnvironmentTier {
    pub const ALL: [EnvironmentTier; 5] = [
        EnvironmentTier::Production,
        EnvironmentTier::Staging,
        EnvironmentTier::Testing,
        EnvironmentTier::Development,
        EnvironmentTier::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Testing => "testing",
            Self::Development => "development",
            Self::Other => "other",
        }
    }
}

impl FromStr for EnvironmentTier {
    type Err = UnknownVocabulary;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownVocabulary {
                vocabulary: "environment tier",
                value: s.to_string(),
            })
    }
}

impl std::fmt::Display for EnvironmentTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deployment target inside a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: EnvironmentId,
    pub project_id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub tier: EnvironmentTier,
}

impl Environment {
    pub fn new(id: EnvironmentId, project_id: ProjectId, name: impl Into<String>, tier: EnvironmentTier) -> Self {
        Self {
            id,
            project_id,
            name: name.into(),
            tier,
        }
    }
}

/// Owner of a protected environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionScope {
    Project(ProjectId),
    Group(GroupId),
}

/// One grant of deploy rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployAccessLevel {
    User(UserId),
    Group(GroupId),
    /// Anyone at or above this level on the owning container.
    Role(AccessLevel),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedEnvironment {
    pub id: ProtectedEnvironmentId,
    pub name: String,
    pub scope: ProtectionScope,
    #[serde(default)]
    pub deploy_access_levels: Vec<DeployAccessLevel>,
    #[serde(default)]
    pub required_approval_count: i64,
    /// Set by [`with_environment_id`] for project-level entries.
    #[serde(default)]
    pub environment_id: Option<EnvironmentId>,
}

impl ProtectedEnvironment {
    pub fn for_project(id: ProtectedEnvironmentId, project: ProjectId, name: impl Into<String>) -> Self {
        Self::new(id, ProtectionScope::Project(project), name)
    }

    pub fn for_group(id: ProtectedEnvironmentId, group: GroupId, name: impl Into<String>) -> Self {
        Self::new(id, ProtectionScope::Group(group), name)
    }

    fn new(id: ProtectedEnvironmentId, scope: ProtectionScope, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            scope,
            deploy_access_levels: Vec::new(),
            required_approval_count: 0,
            environment_id: None,
        }
    }

    pub fn with_access(mut self, level: DeployAccessLevel) -> Self {
        self.deploy_access_levels.push(level);
        self
    }

    pub fn with_required_approval_count(mut self, n: i64) -> Self {
        self.required_approval_count = n;
        self
    }

    pub fn is_project_level(&self) -> bool {
        matches!(self.scope, ProtectionScope::Project(_))
    }

    pub fn is_group_level(&self) -> bool {
        matches!(self.scope, ProtectionScope::Group(_))
    }

    pub fn validate(&self, config: &EngineConfig) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.name.trim().is_empty() {
            errors.add("name", "can't be blank");
        } else if self.is_group_level() && self.name.parse::<EnvironmentTier>().is_err() {
            let tiers: Vec<&str> = EnvironmentTier::ALL.iter().map(|t| t.as_str()).collect();
            errors.add(
                "name",
                format!("must be one of environment tiers: {}", tiers.join(", ")),
            );
        }

        if self.deploy_access_levels.is_empty() {
            errors.add("deploy_access_levels", "is too short (minimum is 1)");
        }

        if self.required_approval_count < 0 {
            errors.add("required_approval_count", "must be greater than or equal to 0");
        } else if self.required_approval_count > config.max_environment_approvals {
            errors.add(
                "required_approval_count",
                format!(
                    "must be less than or equal to {}",
                    config.max_environment_approvals
                ),
            );
        }

        errors.into_result()
    }

    /// Whether `user` may deploy to this environment.
    pub fn accessible_to(&self, user: UserId, directory: &dyn MembershipDirectory) -> bool {
        if directory.is_admin(user) {
            return true;
        }
        self.deploy_access_levels.iter().any(|grant| match *grant {
            DeployAccessLevel::User(id) => id == user,
            DeployAccessLevel::Group(group) => directory.is_group_member(group, user),
            DeployAccessLevel::Role(required) => {
                self.container_access_level(Some(user), directory) >= required
            }
        })
    }

    /// Project membership for project-level entries, the highest level across
    /// the group hierarchy for group-level ones.
    pub fn container_access_level(&self, user: Option<UserId>, directory: &dyn MembershipDirectory) -> AccessLevel {
        let Some(user) = user else {
            return AccessLevel::NoAccess;
        };
        match self.scope {
            ProtectionScope::Project(project) => directory.project_access_level(project, user),
            ProtectionScope::Group(group) => directory.group_access_level(group, user),
        }
    }

    fn protects(&self, environment: &Environment, hierarchy: &[GroupId]) -> bool {
        match self.scope {
            ProtectionScope::Project(project) => {
                project == environment.project_id && self.name == environment.name
            }
            ProtectionScope::Group(group) => {
                hierarchy.contains(&group) && self.name == environment.tier.as_str()
            }
        }
    }
}

/// Protections that apply to any of `environments`.
///
/// All environments must belong to one project.
pub fn for_environments<'a>(
    protected: &'a [ProtectedEnvironment],
    environments: &[Environment],
    directory: &dyn MembershipDirectory,
) -> Result<Vec<&'a ProtectedEnvironment>, EnvironmentError> {
    let first = environments.first().ok_or(EnvironmentError::NoEnvironments)?;
    if environments.iter().any(|e| e.project_id != first.project_id) {
        return Err(EnvironmentError::MixedProjects);
    }
    let hierarchy = directory.project_group_hierarchy(first.project_id);

    Ok(protected
        .iter()
        .filter(|p| environments.iter().any(|e| p.protects(e, &hierarchy)))
        .collect())
}

/// Link project-level entries to the environment with the same name and project.
pub fn with_environment_id(
    mut protected: Vec<ProtectedEnvironment>,
    environments: &[Environment],
) -> Vec<ProtectedEnvironment> {
    for entry in &mut protected {
        if let ProtectionScope::Project(project) = entry.scope {
            entry.environment_id = environments
                .iter()
                .find(|e| e.project_id == project && e.name == entry.name)
                .map(|e| e.id);
        }
    }
    protected
}

fn in_project(entry: &ProtectedEnvironment, project: Option<ProjectId>) -> bool {
    match project {
        None => true,
        Some(p) => entry.scope == ProtectionScope::Project(p),
    }
}

/// Remove `user` grants, optionally only from one project's entries.
/// Returns the number of grants removed.
pub fn revoke_user(protected: &mut [ProtectedEnvironment], project: Option<ProjectId>, user: UserId) -> usize {
    revoke(protected, project, DeployAccessLevel::User(user))
}

pub fn revoke_group(protected: &mut [ProtectedEnvironment], project: Option<ProjectId>, group: GroupId) -> usize {
    revoke(protected, project, DeployAccessLevel::Group(group))
}

fn revoke(protected: &mut [ProtectedEnvironment], project: Option<ProjectId>, grant: DeployAccessLevel) -> usize {
    let mut removed = 0;
    for entry in protected.iter_mut().filter(|e| in_project(e, project)) {
        let before = entry.deploy_access_levels.len();
        entry.deploy_access_levels.retain(|g| *g != grant);
        removed += before - entry.deploy_access_levels.len();
    }
    removed
}

pub fn sorted_by_name(protected: &mut [ProtectedEnvironment]) {
    protected.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
}
