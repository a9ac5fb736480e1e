//! Workspace directory — explicit create/delete and membership edits.
//!
//! The registry is the authority for "does this workspace exist and
//! what role does this user hold in it". The live document never passes
//! through here; it belongs to the workspace's room.

use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use conflux_core::workspace::{Role, Workspace};

use crate::error::SyncError;

pub struct WorkspaceRegistry {
    workspaces: RwLock<HashMap<Uuid, Workspace>>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self {
            workspaces: RwLock::new(HashMap::new()),
        }
    }

    /// Explicit creation request; the creator becomes the owner.
    pub async fn create(&self, name: impl Into<String>, owner_id: Uuid) -> Workspace {
        let workspace = Workspace::new(name, owner_id);
        let mut workspaces = self.workspaces.write().await;
        workspaces.insert(workspace.id, workspace.clone());
        log::info!("Workspace {} ({}) created by {owner_id}", workspace.id, workspace.name);
        workspace
    }

    /// Explicit deletion; owner only.
    pub async fn delete(&self, workspace_id: Uuid, requester: Uuid) -> Result<(), SyncError> {
        let mut workspaces = self.workspaces.write().await;
        let workspace = workspaces
            .get(&workspace_id)
            .ok_or(SyncError::NotFound(workspace_id))?;
        if workspace.owner_id != requester {
            return Err(SyncError::Forbidden);
        }
        workspaces.remove(&workspace_id);
        log::info!("Workspace {workspace_id} deleted by {requester}");
        Ok(())
    }

    pub async fn get(&self, workspace_id: Uuid) -> Option<Workspace> {
        self.workspaces.read().await.get(&workspace_id).cloned()
    }

    /// The role a user holds in a workspace; `None` when they are not a
    /// member. `NotFound` when the workspace itself is absent.
    pub async fn role_of(&self, workspace_id: Uuid, user_id: Uuid) -> Result<Option<Role>, SyncError> {
        let workspaces = self.workspaces.read().await;
        let workspace = workspaces
            .get(&workspace_id)
            .ok_or(SyncError::NotFound(workspace_id))?;
        Ok(workspace.role_of(&user_id))
    }

    /// Membership creation (invite-accept path); owner only.
    pub async fn invite(
        &self,
        workspace_id: Uuid,
        requester: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Result<(), SyncError> {
        let mut workspaces = self.workspaces.write().await;
        let workspace = workspaces
            .get_mut(&workspace_id)
            .ok_or(SyncError::NotFound(workspace_id))?;
        if workspace.owner_id != requester {
            return Err(SyncError::Forbidden);
        }
        workspace.set_member(user_id, role);
        Ok(())
    }

    /// Membership destruction: the owner may remove anyone, members may
    /// remove themselves.
    pub async fn remove_member(
        &self,
        workspace_id: Uuid,
        requester: Uuid,
        user_id: Uuid,
    ) -> Result<(), SyncError> {
        let mut workspaces = self.workspaces.write().await;
        let workspace = workspaces
            .get_mut(&workspace_id)
            .ok_or(SyncError::NotFound(workspace_id))?;
        if workspace.owner_id != requester && requester != user_id {
            return Err(SyncError::Forbidden);
        }
        if !workspace.remove_member(&user_id) {
            return Err(SyncError::Forbidden);
        }
        Ok(())
    }

    pub async fn count(&self) -> usize {
        self.workspaces.read().await.len()
    }
}

impl Default for WorkspaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
