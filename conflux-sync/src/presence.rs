//! Presence tracking — who is in a workspace, where their cursor is.
//!
//! ```text
//! gateway auth ──► register(workspace, user, conn, role)
//!                        │
//!                        ▼
//!              ┌──────────────────────┐
//!              │ PresenceTracker      │
//!              │  per-workspace rows: │
//!              │  role · connection · │
//!              │  cursor · color ·    │
//!              │  last_seen           │
//!              └──────────────────────┘
//!                        │
//!        list() ◄────────┴────────► prune_idle()
//! ```
//!
//! Cursor updates are advisory and last-write-wins; they are never
//! ordered against the versioned change stream. Disconnects clear the
//! connection and cursor but keep the membership row; only explicit
//! leave/removal destroys it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::RwLock;
use uuid::Uuid;

use conflux_core::workspace::Role;

use crate::error::SyncError;

/// 2D cursor position in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPos {
    pub x: f32,
    pub y: f32,
}

impl CursorPos {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// RGBA display color assigned to a member.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

/// Fixed display palette. Slots are handed out by join order and
/// returned to the pool when a membership row is destroyed, so two
/// members of one workspace never share a color.
pub const PALETTE: [CursorColor; 8] = [
    CursorColor { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }, // blue
    CursorColor { r: 0.91, g: 0.30, b: 0.24, a: 1.0 }, // red
    CursorColor { r: 0.18, g: 0.70, b: 0.42, a: 1.0 }, // green
    CursorColor { r: 0.95, g: 0.61, b: 0.07, a: 1.0 }, // amber
    CursorColor { r: 0.61, g: 0.35, b: 0.88, a: 1.0 }, // purple
    CursorColor { r: 0.10, g: 0.74, b: 0.81, a: 1.0 }, // teal
    CursorColor { r: 0.93, g: 0.39, b: 0.65, a: 1.0 }, // pink
    CursorColor { r: 0.55, g: 0.57, b: 0.62, a: 1.0 }, // slate
];

/// Roster entry as it appears on the wire and in `list()` results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub user_id: Uuid,
    pub name: String,
    pub role: Role,
    pub color: CursorColor,
    pub cursor: Option<CursorPos>,
    /// Derived: `connection_id != None`.
    pub online: bool,
    /// Seconds since the epoch of the last observed activity.
    pub last_seen_secs: u64,
}

impl MemberInfo {
    /// Roster entry with fixed fields for protocol tests.
    pub fn for_test(user_id: Uuid, name: impl Into<String>, role: Role) -> Self {
        Self {
            user_id,
            name: name.into(),
            role,
            color: PALETTE[0],
            cursor: None,
            online: true,
            last_seen_secs: 0,
        }
    }
}

/// One member's live row.
#[derive(Debug, Clone)]
struct MemberState {
    user_id: Uuid,
    name: String,
    role: Role,
    connection_id: Option<Uuid>,
    cursor: Option<CursorPos>,
    color_slot: usize,
    /// Monotonic instant of the last observed frame, for liveness.
    last_activity: Instant,
    /// Wall-clock last-seen, for the roster.
    last_seen: SystemTime,
}

impl MemberState {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_seen = SystemTime::now();
    }

    fn info(&self) -> MemberInfo {
        MemberInfo {
            user_id: self.user_id,
            name: self.name.clone(),
            role: self.role,
            color: PALETTE[self.color_slot % PALETTE.len()],
            cursor: self.cursor,
            online: self.connection_id.is_some(),
            last_seen_secs: self
                .last_seen
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

/// Per-workspace member registry.
#[derive(Debug, Default)]
struct WorkspacePresence {
    members: HashMap<Uuid, MemberState>,
    /// Total joins ever, for the modulo fallback when all slots are taken.
    joined_total: u64,
}

impl WorkspacePresence {
    fn allocate_color(&mut self) -> usize {
        let taken: Vec<usize> = self.members.values().map(|m| m.color_slot).collect();
        let slot = (0..PALETTE.len())
            .find(|slot| !taken.contains(slot))
            .unwrap_or(self.joined_total as usize % PALETTE.len());
        self.joined_total += 1;
        slot
    }
}

/// Process-wide presence registry, one entry per workspace.
///
/// Rows are mutated per-member, so concurrent cursor updates from
/// different users never contend on anything but the map lock.
pub struct PresenceTracker {
    workspaces: RwLock<HashMap<Uuid, WorkspacePresence>>,
    /// connection_id → (workspace_id, user_id) for O(1) disconnects.
    connections: RwLock<HashMap<Uuid, (Uuid, Uuid)>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            workspaces: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a member's connection under a workspace.
    ///
    /// `role` is `None` when the user holds no membership; that is a
    /// `Forbidden` registration. Re-registering an already-online user
    /// supersedes the previous connection (at most one active
    /// connection per workspace/user pair).
    pub async fn register(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
        name: impl Into<String>,
        connection_id: Uuid,
        role: Option<Role>,
    ) -> Result<MemberInfo, SyncError> {
        let role = role.ok_or(SyncError::Forbidden)?;

        let mut workspaces = self.workspaces.write().await;
        let presence = workspaces.entry(workspace_id).or_default();

        let superseded = match presence.members.get_mut(&user_id) {
            Some(member) => {
                let old = member.connection_id.replace(connection_id);
                member.name = name.into();
                member.role = role;
                member.touch();
                old
            }
            None => {
                let slot = presence.allocate_color();
                presence.members.insert(
                    user_id,
                    MemberState {
                        user_id,
                        name: name.into(),
                        role,
                        connection_id: Some(connection_id),
                        cursor: None,
                        color_slot: slot,
                        last_activity: Instant::now(),
                        last_seen: SystemTime::now(),
                    },
                );
                None
            }
        };

        let info = presence.members[&user_id].info();
        drop(workspaces);

        let mut connections = self.connections.write().await;
        if let Some(old) = superseded {
            connections.remove(&old);
            log::debug!("Superseded connection {old} for user {user_id} in {workspace_id}");
        }
        connections.insert(connection_id, (workspace_id, user_id));

        log::info!("Presence: {user_id} registered in {workspace_id} as {}", role.as_str());
        Ok(info)
    }

    /// Clear a connection on disconnect. The membership row survives;
    /// returns the (workspace, user) pair so the caller can broadcast
    /// `user_left`.
    pub async fn unregister(&self, connection_id: Uuid) -> Option<(Uuid, Uuid)> {
        let (workspace_id, user_id) = self.connections.write().await.remove(&connection_id)?;

        let mut workspaces = self.workspaces.write().await;
        if let Some(presence) = workspaces.get_mut(&workspace_id) {
            if let Some(member) = presence.members.get_mut(&user_id) {
                // Only clear if this connection is still the live one.
                if member.connection_id == Some(connection_id) {
                    member.connection_id = None;
                    member.cursor = None;
                    member.touch();
                }
            }
        }

        log::info!("Presence: {user_id} left {workspace_id}");
        Some((workspace_id, user_id))
    }

    /// Overwrite a member's cursor, last-write-wins. Returns the
    /// (workspace, user) pair for fan-out, or `None` for unknown
    /// connections.
    pub async fn update_cursor(&self, connection_id: Uuid, x: f32, y: f32) -> Option<(Uuid, Uuid)> {
        let (workspace_id, user_id) = *self.connections.read().await.get(&connection_id)?;

        let mut workspaces = self.workspaces.write().await;
        let member = workspaces.get_mut(&workspace_id)?.members.get_mut(&user_id)?;
        member.cursor = Some(CursorPos::new(x, y));
        member.touch();
        Some((workspace_id, user_id))
    }

    /// Record heartbeat/frame activity for a connection.
    pub async fn touch(&self, connection_id: Uuid) {
        // Taken as a separate statement so the connections guard drops
        // before the workspaces lock is acquired (same order as the
        // pruner).
        let target = self.connections.read().await.get(&connection_id).copied();
        let Some((workspace_id, user_id)) = target else {
            return;
        };
        let mut workspaces = self.workspaces.write().await;
        if let Some(member) = workspaces
            .get_mut(&workspace_id)
            .and_then(|p| p.members.get_mut(&user_id))
        {
            member.touch();
        }
    }

    /// All members of a workspace, with derived online state.
    pub async fn list(&self, workspace_id: Uuid) -> Vec<MemberInfo> {
        let workspaces = self.workspaces.read().await;
        let mut members: Vec<MemberInfo> = workspaces
            .get(&workspace_id)
            .map(|p| p.members.values().map(MemberState::info).collect())
            .unwrap_or_default();
        members.sort_by_key(|m| m.user_id);
        members
    }

    pub async fn member(&self, workspace_id: Uuid, user_id: Uuid) -> Option<MemberInfo> {
        let workspaces = self.workspaces.read().await;
        workspaces
            .get(&workspace_id)?
            .members
            .get(&user_id)
            .map(MemberState::info)
    }

    /// Mark connections offline whose last activity is older than
    /// `timeout`. Returns the affected (workspace, user) pairs so the
    /// caller can broadcast `user_left` and drop the sockets.
    pub async fn prune_idle(&self, timeout: Duration) -> Vec<(Uuid, Uuid, Uuid)> {
        let mut workspaces = self.workspaces.write().await;
        let mut connections = self.connections.write().await;
        let mut pruned = Vec::new();

        for (workspace_id, presence) in workspaces.iter_mut() {
            for member in presence.members.values_mut() {
                if let Some(conn) = member.connection_id {
                    if member.last_activity.elapsed() > timeout {
                        member.connection_id = None;
                        member.cursor = None;
                        member.last_seen = SystemTime::now();
                        connections.remove(&conn);
                        pruned.push((*workspace_id, member.user_id, conn));
                    }
                }
            }
        }

        if !pruned.is_empty() {
            log::warn!("Presence: pruned {} idle connections", pruned.len());
        }
        pruned
    }

    /// Destroy a membership row (explicit leave/removal) and return its
    /// color slot to the pool.
    pub async fn remove_member(&self, workspace_id: Uuid, user_id: Uuid) -> bool {
        let mut workspaces = self.workspaces.write().await;
        let Some(presence) = workspaces.get_mut(&workspace_id) else {
            return false;
        };
        let Some(member) = presence.members.remove(&user_id) else {
            return false;
        };
        if let Some(conn) = member.connection_id {
            self.connections.write().await.remove(&conn);
        }
        if presence.members.is_empty() {
            workspaces.remove(&workspace_id);
        }
        true
    }

    /// Number of online members in a workspace.
    pub async fn online_count(&self, workspace_id: Uuid) -> usize {
        let workspaces = self.workspaces.read().await;
        workspaces
            .get(&workspace_id)
            .map(|p| {
                p.members
                    .values()
                    .filter(|m| m.connection_id.is_some())
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Client-side cursor throttle ────────────────────────────────────

/// Coalesces high-volume cursor moves to a bounded send frequency.
///
/// Cursor traffic is lossy-tolerant, so dropped intermediate positions
/// are fine; the latest position always wins.
pub struct CursorThrottle {
    interval: Duration,
    last_sent: Instant,
    counter: u64,
}

impl CursorThrottle {
    /// Default 33ms interval ≈ 30 sends per second.
    pub fn new() -> Self {
        Self::with_interval(Duration::from_millis(33))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            // Allow an immediate first send.
            last_sent: Instant::now() - Duration::from_secs(1),
            counter: 0,
        }
    }

    /// Offer a position; returns `(position, timestamp)` when a send is
    /// due, `None` when throttled.
    pub fn offer(&mut self, pos: CursorPos) -> Option<(CursorPos, u64)> {
        if self.last_sent.elapsed() < self.interval {
            return None;
        }
        self.last_sent = Instant::now();
        self.counter += 1;
        Some((pos, self.counter))
    }
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new()
    }
}
