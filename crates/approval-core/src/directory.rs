//! Membership lookups consumed by approver resolution and deploy access.
//!
//! Membership is owned by an external collaborator; evaluation only needs
//! the narrow read interface in [`MembershipDirectory`]. [`StaticDirectory`]
//! is a serde-friendly in-memory implementation used by the CLI and tests.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::{GroupId, ProjectId, UserId};

/// Membership access levels, ordered from no access to owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    #[default]
    NoAccess,
    Guest,
    Reporter,
    Developer,
    Maintainer,
    Owner,
}

impl AccessLevel {
    /// Numeric value shared with the permission subsystem.
    pub fn value(self) -> u8 {
        match self {
            Self::NoAccess => 0,
            Self::Guest => 10,
            Self::Reporter => 20,
            Self::Developer => 30,
            Self::Maintainer => 40,
            Self::Owner => 50,
        }
    }
}

/// Read-only view of users, groups and project memberships.
pub trait MembershipDirectory: Send + Sync {
    fn is_admin(&self, user: UserId) -> bool;

    /// Direct members of `group`.
    fn group_members(&self, group: GroupId) -> BTreeSet<UserId>;

    /// Membership in `group`, including membership inherited from ancestors.
    fn is_group_member(&self, group: GroupId, user: UserId) -> bool {
        self.group_access_level(group, user) > AccessLevel::NoAccess
    }

    fn project_access_level(&self, project: ProjectId, user: UserId) -> AccessLevel;

    /// Highest access `user` holds on `group` or any of its ancestors.
    fn group_access_level(&self, group: GroupId, user: UserId) -> AccessLevel;

    /// The project's group followed by its ancestors, nearest first.
    fn project_group_hierarchy(&self, project: ProjectId) -> Vec<GroupId>;

    fn user_name(&self, user: UserId) -> Option<String>;

    fn group_name(&self, group: GroupId) -> Option<String>;
}

// ---------------------------------------------------------------------------
// In-memory directory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub user: UserId,
    pub access_level: AccessLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub parent: Option<GroupId>,
    #[serde(default)]
    pub members: Vec<Membership>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub id: ProjectId,
    #[serde(default)]
    pub group: Option<GroupId>,
    #[serde(default)]
    pub members: Vec<Membership>,
}

/// Membership data held entirely in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticDirectory {
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub groups: Vec<GroupEntry>,
    #[serde(default)]
    pub projects: Vec<ProjectEntry>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, id: UserId, name: impl Into<String>) -> Self {
        self.users.push(UserEntry {
            id,
            name: name.into(),
            admin: false,
        });
        self
    }

    pub fn with_admin(mut self, id: UserId, name: impl Into<String>) -> Self {
        self.users.push(UserEntry {
            id,
            name: name.into(),
            admin: true,
        });
        self
    }

    pub fn with_group(mut self, id: GroupId, name: impl Into<String>, parent: Option<GroupId>) -> Self {
        self.groups.push(GroupEntry {
            id,
            name: name.into(),
            parent,
            members: Vec::new(),
        });
        self
    }

    pub fn with_project(mut self, id: ProjectId, group: Option<GroupId>) -> Self {
        self.projects.push(ProjectEntry {
            id,
            group,
            members: Vec::new(),
        });
        self
    }

    /// Add `user` to `group`, creating an unnamed group if it is unknown.
    pub fn add_group_member(&mut self, group: GroupId, user: UserId, access_level: AccessLevel) {
        if !self.groups.iter().any(|g| g.id == group) {
            self.groups.push(GroupEntry {
                id: group,
                name: group.to_string(),
                parent: None,
                members: Vec::new(),
            });
        }
        if let Some(entry) = self.groups.iter_mut().find(|g| g.id == group) {
            entry.members.retain(|m| m.user != user);
            entry.members.push(Membership { user, access_level });
        }
    }

    /// Add `user` to `project`, creating the project entry if it is unknown.
    pub fn add_project_member(&mut self, project: ProjectId, user: UserId, access_level: AccessLevel) {
        if !self.projects.iter().any(|p| p.id == project) {
            self.projects.push(ProjectEntry {
                id: project,
                group: None,
                members: Vec::new(),
            });
        }
        if let Some(entry) = self.projects.iter_mut().find(|p| p.id == project) {
            entry.members.retain(|m| m.user != user);
            entry.members.push(Membership { user, access_level });
        }
    }

    fn group(&self, id: GroupId) -> Option<&GroupEntry> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// `group` followed by its ancestors. Stops at cycles.
    fn ancestry(&self, group: GroupId) -> Vec<GroupId> {
        let mut chain = Vec::new();
        let mut current = Some(group);
        while let Some(id) = current {
            if chain.contains(&id) {
                break;
            }
            chain.push(id);
            current = self.group(id).and_then(|g| g.parent);
        }
        chain
    }
}

fn level_in(members: &[Membership], user: UserId) -> AccessLevel {
    members
        .iter()
        .find(|m| m.user == user)
        .map(|m| m.access_level)
        .unwrap_or_default()
}

impl MembershipDirectory for StaticDirectory {
    fn is_admin(&self, user: UserId) -> bool {
        self.users.iter().any(|u| u.id == user && u.admin)
    }

    fn group_members(&self, group: GroupId) -> BTreeSet<UserId> {
        self.group(group)
            .map(|g| g.members.iter().map(|m| m.user).collect())
            .unwrap_or_default()
    }

    fn project_access_level(&self, project: ProjectId, user: UserId) -> AccessLevel {
        self.projects
            .iter()
            .find(|p| p.id == project)
            .map(|p| level_in(&p.members, user))
            .unwrap_or_default()
    }

    fn group_access_level(&self, group: GroupId, user: UserId) -> AccessLevel {
        self.ancestry(group)
            .into_iter()
            .filter_map(|id| self.group(id))
            .map(|g| level_in(&g.members, user))
            .max()
            .unwrap_or_default()
    }

    fn project_group_hierarchy(&self, project: ProjectId) -> Vec<GroupId> {
        self.projects
            .iter()
            .find(|p| p.id == project)
            .and_then(|p| p.group)
            .map(|g| self.ancestry(g))
            .unwrap_or_default()
    }

    fn user_name(&self, user: UserId) -> Option<String> {
        self.users.iter().find(|u| u.id == user).map(|u| u.name.clone())
    }

    fn group_name(&self, group: GroupId) -> Option<String> {
        self.group(group).map(|g| g.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> StaticDirectory {
        let mut dir = StaticDirectory::new()
            .with_user(UserId(1), "Batman")
            .with_admin(UserId(9), "Root")
            .with_group(GroupId(10), "Parent", None)
            .with_group(GroupId(11), "Child", Some(GroupId(10)))
            .with_project(ProjectId(100), Some(GroupId(11)));
        dir.add_group_member(GroupId(10), UserId(1), AccessLevel::Maintainer);
        dir.add_group_member(GroupId(11), UserId(1), AccessLevel::Developer);
        dir.add_project_member(ProjectId(100), UserId(2), AccessLevel::Reporter);
        dir
    }

    #[test]
    fn access_levels_are_ordered() {
        assert!(AccessLevel::Maintainer > AccessLevel::Developer);
        assert!(AccessLevel::NoAccess < AccessLevel::Guest);
        assert_eq!(AccessLevel::Owner.value(), 50);
    }

    #[test]
    fn group_access_takes_max_over_ancestors() {
        let dir = directory();
        assert_eq!(dir.group_access_level(GroupId(11), UserId(1)), AccessLevel::Maintainer);
        assert_eq!(dir.group_access_level(GroupId(11), UserId(2)), AccessLevel::NoAccess);
        assert!(dir.is_group_member(GroupId(11), UserId(1)));
    }

    #[test]
    fn project_hierarchy_is_nearest_first() {
        let dir = directory();
        assert_eq!(dir.project_group_hierarchy(ProjectId(100)), vec![GroupId(11), GroupId(10)]);
        assert!(dir.project_group_hierarchy(ProjectId(404)).is_empty());
    }

    #[test]
    fn re_adding_member_replaces_level() {
        let mut dir = directory();
        dir.add_project_member(ProjectId(100), UserId(2), AccessLevel::Maintainer);
        assert_eq!(dir.project_access_level(ProjectId(100), UserId(2)), AccessLevel::Maintainer);
    }

    #[test]
    fn cyclic_parents_terminate() {
        let mut dir = StaticDirectory::new()
            .with_group(GroupId(1), "a", Some(GroupId(2)))
            .with_group(GroupId(2), "b", Some(GroupId(1)));
        dir.add_group_member(GroupId(2), UserId(5), AccessLevel::Guest);
        assert_eq!(dir.group_access_level(GroupId(1), UserId(5)), AccessLevel::Guest);
    }

    #[test]
    fn admins_and_names() {
        let dir = directory();
        assert!(dir.is_admin(UserId(9)));
        assert!(!dir.is_admin(UserId(1)));
        assert_eq!(dir.user_name(UserId(1)).as_deref(), Some("Batman"));
        assert_eq!(dir.group_name(GroupId(10)).as_deref(), Some("Parent"));
    }
}
