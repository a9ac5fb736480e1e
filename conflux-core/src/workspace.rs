//! Workspace identity and membership roles.
//!
//! The workspace record carries the directory-level facts: who owns it,
//! who may open it, and with which role. The live document and version
//! counter belong to the room that serializes the workspace's mutations;
//! they are reunited with this record in a [`crate::diff::Snapshot`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Membership role within a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    /// Whether this role may submit pipeline updates.
    pub fn can_edit(&self) -> bool {
        matches!(self, Role::Owner | Role::Editor)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }
}

/// Directory record for one workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    /// Membership roles, including the owner's.
    pub members: HashMap<Uuid, Role>,
}

impl Workspace {
    /// Create a workspace; the creator becomes its owner member.
    pub fn new(name: impl Into<String>, owner_id: Uuid) -> Self {
        let mut members = HashMap::new();
        members.insert(owner_id, Role::Owner);
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            owner_id,
            members,
        }
    }

    pub fn role_of(&self, user_id: &Uuid) -> Option<Role> {
        self.members.get(user_id).copied()
    }

    /// Add or update a membership (invite-accept path).
    ///
    /// The owner's role cannot be demoted through this path.
    pub fn set_member(&mut self, user_id: Uuid, role: Role) {
        if user_id == self.owner_id {
            return;
        }
        self.members.insert(user_id, role);
    }

    /// Remove a membership (explicit leave/removal). The owner cannot be
    /// removed.
    pub fn remove_member(&mut self, user_id: &Uuid) -> bool {
        if *user_id == self.owner_id {
            return false;
        }
        self.members.remove(user_id).is_some()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_permissions() {
        assert!(Role::Owner.can_edit());
        assert!(Role::Editor.can_edit());
        assert!(!Role::Viewer.can_edit());
    }

    #[test]
    fn test_owner_is_member_on_creation() {
        let owner = Uuid::new_v4();
        let ws = Workspace::new("churn-analysis", owner);
        assert_eq!(ws.owner_id, owner);
        assert_eq!(ws.role_of(&owner), Some(Role::Owner));
        assert_eq!(ws.member_count(), 1);
    }

    #[test]
    fn test_set_and_remove_member() {
        let owner = Uuid::new_v4();
        let editor = Uuid::new_v4();
        let mut ws = Workspace::new("q3-forecast", owner);

        ws.set_member(editor, Role::Editor);
        assert_eq!(ws.role_of(&editor), Some(Role::Editor));

        assert!(ws.remove_member(&editor));
        assert_eq!(ws.role_of(&editor), None);
    }

    #[test]
    fn test_owner_cannot_be_demoted_or_removed() {
        let owner = Uuid::new_v4();
        let mut ws = Workspace::new("ab-test", owner);

        ws.set_member(owner, Role::Viewer);
        assert_eq!(ws.role_of(&owner), Some(Role::Owner));

        assert!(!ws.remove_member(&owner));
        assert_eq!(ws.member_count(), 1);
    }

    #[test]
    fn test_unknown_user_has_no_role() {
        let ws = Workspace::new("scratch", Uuid::new_v4());
        assert_eq!(ws.role_of(&Uuid::new_v4()), None);
    }
}
