//! Fan-out broadcast to a workspace's attached connections.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver buffering up to
//! `capacity` messages; a lagging receiver drops old messages rather
//! than stalling the room (the client recovers via `request_sync`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::SyncError;
use crate::protocol::WireMessage;

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct FanoutStats {
    pub messages_sent: u64,
    pub attached_connections: usize,
}

/// The fan-out set for one workspace room.
///
/// The room broadcasts versioned state updates through it; the cursor
/// path broadcasts advisory frames through the same group without going
/// near the room's inbox.
pub struct FanoutGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Attached connections: connection_id → user_id.
    connections: Arc<RwLock<HashMap<Uuid, Uuid>>>,
    capacity: usize,
    /// Lock-free counter — the hot path never takes a lock.
    messages_sent: AtomicU64,
}

impl FanoutGroup {
    /// `capacity` is the per-receiver buffer before a slow connection
    /// starts losing messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            connections: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Attach a connection; returns its receiver.
    pub async fn attach(&self, connection_id: Uuid, user_id: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut connections = self.connections.write().await;
        connections.insert(connection_id, user_id);
        self.sender.subscribe()
    }

    /// Detach a connection from the fan-out set.
    pub async fn detach(&self, connection_id: &Uuid) -> Option<Uuid> {
        let mut connections = self.connections.write().await;
        connections.remove(connection_id)
    }

    /// Broadcast a message to every attached connection.
    ///
    /// Delivery to the message's own sender is filtered at the receiving
    /// end (the connection task skips frames whose sender is itself).
    pub fn broadcast(&self, msg: &WireMessage) -> Result<usize, SyncError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes (zero-copy fast path).
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn stats(&self) -> FanoutStats {
        FanoutStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            attached_connections: self.connections.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe without attaching (server-internal taps, tests).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}
