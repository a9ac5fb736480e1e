//! Workspace rooms — one serialized writer per workspace.
//!
//! ```text
//! conn A ──┐                         ┌── conn A
//!          │   ┌───────────────┐     │
//! conn B ──┼──►│ Room (actor)  │─────┼── conn B      (state updates)
//!          │   │  inbox: mpsc  │     │
//! conn C ──┘   │  doc, version │     └── conn C
//!              │  history ring │
//!              └───────┬───────┘
//!                      │ idle
//!                      ▼
//!              WorkspaceStore (snapshot at version V)
//! ```
//!
//! Every mutation of a workspace's document flows through that
//! workspace's room task, one command at a time in arrival order. That
//! single serialization point is the correctness mechanism: there are no
//! concurrent writers to reconcile, so field-level last-writer-wins is
//! enough for all replicas to converge on the same bytes. Rooms for
//! different workspaces share nothing and run fully in parallel.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use uuid::Uuid;

use conflux_core::diff::{ChangeRecord, Snapshot, VersionedDiff};
use conflux_core::graph::PipelineDoc;

use crate::broadcast::FanoutGroup;
use crate::error::SyncError;
use crate::protocol::WireMessage;
use crate::storage::{StoreError, WorkspaceStore};

/// Room tuning knobs.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Retained diff history per room; gaps beyond it resync via full
    /// snapshot.
    pub history_window: usize,
    /// Fan-out channel capacity per attached connection.
    pub fanout_capacity: usize,
    /// Inbox depth before submitters are backpressured.
    pub inbox_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            history_window: 256,
            fanout_capacity: 256,
            inbox_capacity: 64,
        }
    }
}

/// Result of one `apply` call.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// Version assigned to the change (or previously assigned, for
    /// duplicates).
    pub version: u64,
    /// The idempotency key had already been applied; nothing was
    /// re-applied or re-broadcast.
    pub duplicate: bool,
    /// Diffs between the sender's `base_version` and this change.
    /// `None` when the gap fell outside the retained window — the
    /// sender must request a full resync.
    pub missed: Option<Vec<VersionedDiff>>,
}

/// Reply to a resync request.
#[derive(Debug, Clone)]
pub enum SyncResponse {
    /// The retained window covered the gap.
    Diffs(Vec<VersionedDiff>),
    /// Gap too large — full snapshot fallback, always correct.
    Snapshot(Snapshot),
}

enum RoomCommand {
    Apply {
        record: ChangeRecord,
        reply: oneshot::Sender<ApplyOutcome>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    SyncSince {
        since_version: u64,
        reply: oneshot::Sender<SyncResponse>,
    },
    Shutdown {
        reply: oneshot::Sender<Snapshot>,
    },
}

/// State owned exclusively by the room task.
struct RoomState {
    workspace_id: Uuid,
    doc: PipelineDoc,
    version: u64,
    /// idempotency_key → assigned version, for duplicate detection.
    applied: HashMap<Uuid, u64>,
    /// Bounded ring of recent diffs for incremental resync.
    history: VecDeque<VersionedDiff>,
    fanout: Arc<FanoutGroup>,
    history_window: usize,
}

impl RoomState {
    fn apply(&mut self, record: ChangeRecord) -> ApplyOutcome {
        if let Some(&assigned) = self.applied.get(&record.idempotency_key) {
            log::debug!(
                "Room {}: duplicate change {} already at version {assigned}",
                self.workspace_id,
                record.idempotency_key
            );
            return ApplyOutcome {
                version: assigned,
                duplicate: true,
                missed: Some(Vec::new()),
            };
        }

        self.doc.apply_diff(&record.diff);
        self.version += 1;

        let vdiff = VersionedDiff {
            version: self.version,
            origin_user_id: record.origin_user_id,
            diff: record.diff.clone(),
        };
        self.history.push_back(vdiff.clone());
        while self.history.len() > self.history_window {
            self.history.pop_front();
        }
        self.applied.insert(record.idempotency_key, self.version);

        // Everything the sender's base_version missed, excluding its
        // own change.
        let missed = self.collect_range(record.base_version, self.version - 1);

        match WireMessage::state_update(self.workspace_id, &vdiff) {
            Ok(msg) => {
                let _ = self.fanout.broadcast(&msg);
            }
            Err(e) => log::error!("Room {}: failed to encode state update: {e}", self.workspace_id),
        }

        ApplyOutcome {
            version: self.version,
            duplicate: false,
            missed,
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            workspace_id: self.workspace_id,
            version: self.version,
            doc: self.doc.clone(),
        }
    }

    fn sync_since(&self, since_version: u64) -> SyncResponse {
        match self.collect_range(since_version, self.version) {
            Some(diffs) => SyncResponse::Diffs(diffs),
            None => SyncResponse::Snapshot(self.snapshot()),
        }
    }

    /// Diffs with versions in `(after, up_to]`, or `None` when the
    /// retained window no longer covers that range.
    fn collect_range(&self, after: u64, up_to: u64) -> Option<Vec<VersionedDiff>> {
        if after >= up_to {
            return Some(Vec::new());
        }
        let covered = self
            .history
            .front()
            .map(|oldest| oldest.version <= after + 1)
            .unwrap_or(false);
        if !covered {
            return None;
        }
        Some(
            self.history
                .iter()
                .filter(|d| d.version > after && d.version <= up_to)
                .cloned()
                .collect(),
        )
    }
}

async fn run_room(mut state: RoomState, mut inbox: mpsc::Receiver<RoomCommand>) {
    log::info!(
        "Room {} active at version {}",
        state.workspace_id,
        state.version
    );

    while let Some(cmd) = inbox.recv().await {
        match cmd {
            RoomCommand::Apply { record, reply } => {
                let _ = reply.send(state.apply(record));
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(state.snapshot());
            }
            RoomCommand::SyncSince { since_version, reply } => {
                let _ = reply.send(state.sync_since(since_version));
            }
            RoomCommand::Shutdown { reply } => {
                let _ = reply.send(state.snapshot());
                break;
            }
        }
    }

    log::info!("Room {} idle, task exiting", state.workspace_id);
}

/// Handle to a running room task.
///
/// Cloneable; all clones feed the same inbox. The fan-out group is
/// exposed directly so the advisory cursor stream can bypass the
/// serialized apply path entirely.
#[derive(Clone)]
pub struct RoomHandle {
    pub workspace_id: Uuid,
    tx: mpsc::Sender<RoomCommand>,
    fanout: Arc<FanoutGroup>,
}

impl RoomHandle {
    /// Spawn a room task, optionally seeded from a persisted snapshot.
    pub fn spawn(workspace_id: Uuid, initial: Option<Snapshot>, config: &RoomConfig) -> Self {
        let fanout = Arc::new(FanoutGroup::new(config.fanout_capacity));
        let (tx, rx) = mpsc::channel(config.inbox_capacity);

        let (version, doc) = match initial {
            Some(snapshot) => (snapshot.version, snapshot.doc),
            None => (0, PipelineDoc::new()),
        };

        let state = RoomState {
            workspace_id,
            doc,
            version,
            applied: HashMap::new(),
            history: VecDeque::new(),
            fanout: fanout.clone(),
            history_window: config.history_window,
        };
        tokio::spawn(run_room(state, rx));

        Self {
            workspace_id,
            tx,
            fanout,
        }
    }

    /// Serialize a change through the room. Blocks only while the room
    /// is busy applying prior changes.
    pub async fn apply(&self, record: ChangeRecord) -> Result<ApplyOutcome, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Apply { record, reply })
            .await
            .map_err(|_| SyncError::RoomClosed)?;
        rx.await.map_err(|_| SyncError::RoomClosed)
    }

    /// Atomic `{version, full_state}` — never reflects a half-applied
    /// change.
    pub async fn snapshot(&self) -> Result<Snapshot, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Snapshot { reply })
            .await
            .map_err(|_| SyncError::RoomClosed)?;
        rx.await.map_err(|_| SyncError::RoomClosed)
    }

    pub async fn sync_since(&self, since_version: u64) -> Result<SyncResponse, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::SyncSince { since_version, reply })
            .await
            .map_err(|_| SyncError::RoomClosed)?;
        rx.await.map_err(|_| SyncError::RoomClosed)
    }

    /// Add a connection to the fan-out set. Does not send a snapshot —
    /// the join flow requests one explicitly.
    pub async fn attach(&self, connection_id: Uuid, user_id: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.fanout.attach(connection_id, user_id).await
    }

    pub async fn detach(&self, connection_id: &Uuid) {
        self.fanout.detach(connection_id).await;
    }

    /// The room's fan-out group (cursor broadcasts go straight here).
    pub fn fanout(&self) -> &Arc<FanoutGroup> {
        &self.fanout
    }

    pub async fn connection_count(&self) -> usize {
        self.fanout.connection_count().await
    }

    async fn shutdown(&self) -> Result<Snapshot, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Shutdown { reply })
            .await
            .map_err(|_| SyncError::RoomClosed)?;
        rx.await.map_err(|_| SyncError::RoomClosed)
    }
}

/// Maps workspace ids to live rooms; spawns on first attach, tears down
/// (persisting the snapshot) when the last connection detaches.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, RoomHandle>>,
    config: RoomConfig,
    store: Option<Arc<WorkspaceStore>>,
}

impl RoomManager {
    pub fn new(config: RoomConfig, store: Option<Arc<WorkspaceStore>>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            config,
            store,
        }
    }

    /// Get the live room for a workspace, spawning it from the
    /// persisted snapshot if necessary.
    pub async fn get_or_create(&self, workspace_id: Uuid) -> Result<RoomHandle, SyncError> {
        {
            let rooms = self.rooms.read().await;
            if let Some(handle) = rooms.get(&workspace_id) {
                return Ok(handle.clone());
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(handle) = rooms.get(&workspace_id) {
            return Ok(handle.clone());
        }

        let initial = match &self.store {
            Some(store) => match store.load_snapshot(workspace_id) {
                Ok(snapshot) => Some(snapshot),
                Err(StoreError::NotFound(_)) => None,
                Err(StoreError::Corrupted(id)) => {
                    log::error!("Workspace {id} has a corrupted snapshot; marked unavailable");
                    return Err(SyncError::CorruptedSnapshot(id));
                }
                Err(e) => return Err(SyncError::Storage(e.to_string())),
            },
            None => None,
        };

        let handle = RoomHandle::spawn(workspace_id, initial, &self.config);
        rooms.insert(workspace_id, handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, workspace_id: Uuid) -> Option<RoomHandle> {
        self.rooms.read().await.get(&workspace_id).cloned()
    }

    /// Tear down the room if its fan-out set is empty, persisting the
    /// final snapshot first. The write lock is held across the teardown
    /// so a concurrent join cannot observe a half-persisted workspace.
    pub async fn release_if_idle(&self, workspace_id: Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(handle) = rooms.get(&workspace_id).cloned() else {
            return false;
        };
        if !handle.fanout().is_empty().await {
            return false;
        }

        rooms.remove(&workspace_id);
        match handle.shutdown().await {
            Ok(snapshot) => {
                if snapshot.version > 0 {
                    if let Some(store) = &self.store {
                        if let Err(e) = store.save_snapshot(&snapshot) {
                            log::error!(
                                "Failed to persist snapshot for workspace {workspace_id}: {e}"
                            );
                        }
                    }
                }
            }
            Err(e) => log::warn!("Room {workspace_id} shutdown without snapshot: {e}"),
        }
        log::info!("Room {workspace_id} removed (idle)");
        true
    }

    /// Explicit workspace deletion: drop the room and erase the stored
    /// snapshot.
    pub async fn delete(&self, workspace_id: Uuid) -> Result<(), SyncError> {
        let handle = self.rooms.write().await.remove(&workspace_id);
        if let Some(handle) = handle {
            let _ = handle.shutdown().await;
        }
        if let Some(store) = &self.store {
            match store.delete(workspace_id) {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(SyncError::Storage(e.to_string())),
            }
        }
        Ok(())
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
