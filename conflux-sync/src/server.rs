//! WebSocket sync server with workspace-room routing.
//!
//! ```text
//! Client A ──┐
//!            ├── Gateway (auth, admission, heartbeats)
//! Client B ──┘        │
//!                     ▼
//!            PresenceTracker ── roster, cursors, colors
//!                     │
//!                     ▼
//!            Room (workspace_id) ── PipelineDoc + version
//!                     │                   │
//!                     │                   └── WorkspaceStore (RocksDB)
//!              ┌──────┴───────┐
//!              ▼              ▼
//!          Client A       Client B          (fan-out)
//! ```
//!
//! One tokio task per connection. A connection authenticates first,
//! then joins a workspace; all further traffic is mediated between the
//! workspace's room and the fan-out set. Mutations are serialized by
//! the room; cursors bypass it entirely.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use conflux_core::workspace::Role;

use crate::error::{ErrorKind, SyncError};
use crate::gateway::{AdmissionLimiter, ConnectionTable, GatewayConfig, TokenValidator};
use crate::presence::PresenceTracker;
use crate::protocol::{AckPayload, MessageKind, WireMessage};
use crate::registry::WorkspaceRegistry;
use crate::room::{RoomConfig, RoomHandle, RoomManager, SyncResponse};
use crate::storage::{StoreConfig, WorkspaceStore};

type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub gateway: GatewayConfig,
    pub room: RoomConfig,
    /// Persistence path (None = in-memory only)
    pub storage_path: Option<std::path::PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9420".to_string(),
            gateway: GatewayConfig::default(),
            room: RoomConfig::default(),
            storage_path: None,
        }
    }
}

/// Server-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

struct ServerShared {
    config: ServerConfig,
    tokens: TokenValidator,
    limiter: AdmissionLimiter,
    connections: ConnectionTable,
    presence: PresenceTracker,
    registry: WorkspaceRegistry,
    rooms: RoomManager,
    stats: RwLock<ServerStats>,
}

/// The sync server.
pub struct SyncServer {
    shared: Arc<ServerShared>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Result<Self, SyncError> {
        let store = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Some(Arc::new(
                    WorkspaceStore::open(store_config)
                        .map_err(|e| SyncError::Storage(e.to_string()))?,
                ))
            }
            None => None,
        };

        let limiter = AdmissionLimiter::new(
            config.gateway.admission_window,
            config.gateway.max_attempts_per_addr,
        );
        let rooms = RoomManager::new(config.room.clone(), store);

        Ok(Self {
            shared: Arc::new(ServerShared {
                tokens: TokenValidator::new(),
                limiter,
                connections: ConnectionTable::new(),
                presence: PresenceTracker::new(),
                registry: WorkspaceRegistry::new(),
                rooms,
                stats: RwLock::new(ServerStats::default()),
                config,
            }),
        })
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default()).expect("default config opens no storage")
    }

    /// Token table, for issuing test/embedding credentials.
    pub fn tokens(&self) -> &TokenValidator {
        &self.shared.tokens
    }

    /// Workspace directory (create/delete/invite).
    pub fn registry(&self) -> &WorkspaceRegistry {
        &self.shared.registry
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.shared.presence
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.active_rooms = self.shared.rooms.room_count().await;
        stats
    }

    /// Start listening for WebSocket connections. Runs forever.
    pub async fn run(&self) -> Result<(), SyncError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr)
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;
        log::info!("Sync server listening on {}", self.shared.config.bind_addr);

        // Liveness sweep: force-offline members whose connection went
        // silent past the heartbeat timeout.
        let sweeper = self.shared.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweeper.config.gateway.heartbeat_interval);
            loop {
                interval.tick().await;
                sweep_idle(&sweeper).await;
            }
        });

        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| SyncError::Transient(e.to_string()))?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(shared, stream, addr).await {
                    log::debug!("Connection from {addr} ended: {e}");
                }
            });
        }
    }
}

/// Prune members whose connections stopped heartbeating and broadcast
/// their departure.
async fn sweep_idle(shared: &ServerShared) {
    let timeout = shared.config.gateway.heartbeat_timeout;
    for (workspace_id, user_id, connection_id) in shared.presence.prune_idle(timeout).await {
        shared.connections.remove(connection_id).await;
        if let Some(room) = shared.rooms.get(workspace_id).await {
            room.detach(&connection_id).await;
            let _ = room.fanout().broadcast(&WireMessage::user_left(workspace_id, user_id));
            shared.rooms.release_if_idle(workspace_id).await;
        }
    }
}

/// The workspace a connection is currently attached to.
struct JoinedRoom {
    workspace_id: Uuid,
    role: Role,
    room: RoomHandle,
}

async fn send_msg(sink: &mut WsSink, msg: &WireMessage) -> Result<(), SyncError> {
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into()))
        .await
        .map_err(|e| SyncError::Transient(e.to_string()))
}

async fn send_error(
    sink: &mut WsSink,
    kind: ErrorKind,
    detail: impl Into<String>,
    idempotency_key: Option<Uuid>,
) -> Result<(), SyncError> {
    send_msg(sink, &WireMessage::error(kind, detail, idempotency_key)).await
}

/// Detach from the current workspace, broadcasting `user_left` when
/// this connection was the member's live one.
async fn leave_room(
    shared: &ServerShared,
    connection_id: Uuid,
    joined: &mut Option<JoinedRoom>,
    broadcast_rx: &mut Option<broadcast::Receiver<Arc<Vec<u8>>>>,
) {
    let Some(current) = joined.take() else {
        return;
    };
    *broadcast_rx = None;

    current.room.detach(&connection_id).await;
    if let Some((workspace_id, user_id)) = shared.presence.unregister(connection_id).await {
        let _ = current
            .room
            .fanout()
            .broadcast(&WireMessage::user_left(workspace_id, user_id));
    }
    shared.rooms.release_if_idle(current.workspace_id).await;
}

/// Handle a single WebSocket connection end to end.
async fn handle_connection(
    shared: Arc<ServerShared>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), SyncError> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| SyncError::Transient(e.to_string()))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    if shared.limiter.admit(addr.ip()).await.is_err() {
        let _ = send_error(&mut ws_sender, ErrorKind::RateLimited, "admission window saturated", None).await;
        return Err(SyncError::RateLimited);
    }

    // First frame must authenticate, within the heartbeat budget.
    let auth_deadline = shared.config.gateway.heartbeat_timeout;
    let first = tokio::time::timeout(auth_deadline, ws_receiver.next())
        .await
        .map_err(|_| SyncError::Unauthenticated)?;

    let (user_id, display_name) = match first {
        Some(Ok(Message::Binary(data))) => {
            let bytes: Vec<u8> = data.into();
            let msg = WireMessage::decode(&bytes)?;
            let auth = match msg.auth() {
                Ok(auth) => auth,
                Err(_) => {
                    let _ = send_error(&mut ws_sender, ErrorKind::Unauthenticated, "expected authenticate frame", None).await;
                    return Err(SyncError::Unauthenticated);
                }
            };
            match shared.tokens.validate(&auth.token).await {
                Ok(user_id) => (user_id, auth.display_name),
                Err(_) => {
                    let _ = send_error(&mut ws_sender, ErrorKind::Unauthenticated, "invalid token", None).await;
                    return Err(SyncError::Unauthenticated);
                }
            }
        }
        _ => return Err(SyncError::Unauthenticated),
    };

    let connection_id = shared.connections.register(user_id, addr.ip()).await;
    send_msg(&mut ws_sender, &WireMessage::welcome(connection_id, user_id)).await?;
    log::info!("Connection {connection_id} authenticated as {user_id} from {addr}");

    {
        let mut stats = shared.stats.write().await;
        stats.total_connections += 1;
        stats.active_connections += 1;
    }

    let mut joined: Option<JoinedRoom> = None;
    let mut broadcast_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;

    let result = connection_loop(
        &shared,
        connection_id,
        user_id,
        &display_name,
        &mut ws_sender,
        &mut ws_receiver,
        &mut joined,
        &mut broadcast_rx,
    )
    .await;

    // Disconnect path, reached whether the loop ended cleanly or a
    // send failed mid-frame: clear presence (membership survives),
    // drop the connection row, notify the room.
    leave_room(&shared, connection_id, &mut joined, &mut broadcast_rx).await;
    shared.connections.remove(connection_id).await;
    {
        let mut stats = shared.stats.write().await;
        stats.active_connections = stats.active_connections.saturating_sub(1);
    }

    result
}

/// The post-auth message loop for one connection.
#[allow(clippy::too_many_arguments)]
async fn connection_loop(
    shared: &Arc<ServerShared>,
    connection_id: Uuid,
    user_id: Uuid,
    display_name: &str,
    ws_sender: &mut WsSink,
    ws_receiver: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    joined: &mut Option<JoinedRoom>,
    broadcast_rx: &mut Option<broadcast::Receiver<Arc<Vec<u8>>>>,
) -> Result<(), SyncError> {
    let mut liveness = tokio::time::interval(shared.config.gateway.heartbeat_interval);
    liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // Inbound WebSocket frame
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        shared.connections.touch(connection_id).await;
                        shared.presence.touch(connection_id).await;
                        {
                            let mut stats = shared.stats.write().await;
                            stats.total_messages += 1;
                            stats.total_bytes += bytes.len() as u64;
                        }

                        let msg = match WireMessage::decode(&bytes) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::warn!("Undecodable frame from {connection_id}: {e}");
                                continue;
                            }
                        };

                        match msg.kind {
                            MessageKind::JoinWorkspace => {
                                // Re-joining switches workspaces cleanly.
                                leave_room(shared, connection_id, joined, broadcast_rx).await;

                                let workspace_id = msg.workspace_id;
                                let role = match shared.registry.role_of(workspace_id, user_id).await {
                                    Ok(role) => role,
                                    Err(e) => {
                                        send_error(ws_sender, e.wire_kind(), e.to_string(), None).await?;
                                        continue;
                                    }
                                };

                                let room = match shared.rooms.get_or_create(workspace_id).await {
                                    Ok(room) => room,
                                    Err(e) => {
                                        send_error(ws_sender, e.wire_kind(), e.to_string(), None).await?;
                                        continue;
                                    }
                                };

                                let member = match shared
                                    .presence
                                    .register(workspace_id, user_id, display_name, connection_id, role)
                                    .await
                                {
                                    Ok(member) => member,
                                    Err(e) => {
                                        send_error(ws_sender, e.wire_kind(), e.to_string(), None).await?;
                                        shared.rooms.release_if_idle(workspace_id).await;
                                        continue;
                                    }
                                };

                                let rx = room.attach(connection_id, user_id).await;

                                // Snapshot first so the client never diffs
                                // against an unknown baseline.
                                let snapshot = room.snapshot().await?;
                                let roster = shared.presence.list(workspace_id).await;
                                send_msg(ws_sender, &WireMessage::full_state(snapshot, roster)?).await?;

                                let _ = room.fanout().broadcast(&WireMessage::user_joined(workspace_id, &member)?);

                                // register already rejected the no-role case.
                                if let Some(role) = role {
                                    *joined = Some(JoinedRoom { workspace_id, role, room });
                                    *broadcast_rx = Some(rx);
                                }
                                log::info!("{user_id} joined workspace {workspace_id}");
                            }

                            MessageKind::LeaveWorkspace => {
                                leave_room(shared, connection_id, joined, broadcast_rx).await;
                            }

                            MessageKind::PipelineUpdate => {
                                let Some(current) = joined.as_ref() else {
                                    send_error(ws_sender, ErrorKind::Protocol, "not joined to a workspace", None).await?;
                                    continue;
                                };

                                let record = match msg.change_record() {
                                    Ok(record) => record,
                                    Err(e) => {
                                        send_error(ws_sender, ErrorKind::Protocol, e.to_string(), None).await?;
                                        continue;
                                    }
                                };

                                if record.workspace_id != current.workspace_id
                                    || record.origin_user_id != user_id
                                {
                                    send_error(ws_sender, ErrorKind::Protocol, "change record does not match session", Some(record.idempotency_key)).await?;
                                    continue;
                                }

                                // Viewers hold membership but cannot mutate.
                                if !current.role.can_edit() {
                                    send_error(ws_sender, ErrorKind::Forbidden, "viewer role cannot submit updates", Some(record.idempotency_key)).await?;
                                    continue;
                                }

                                let key = record.idempotency_key;
                                let outcome = current.room.apply(record).await?;
                                let ack = AckPayload {
                                    idempotency_key: key,
                                    version: outcome.version,
                                    duplicate: outcome.duplicate,
                                    missed: outcome.missed,
                                };
                                send_msg(ws_sender, &WireMessage::ack(current.workspace_id, &ack)?).await?;
                            }

                            MessageKind::CursorMove => {
                                // Advisory stream: never serialized through
                                // the room, silently dropped when unjoined.
                                let Some(current) = joined.as_ref() else { continue };
                                let Ok(cursor) = msg.cursor_payload() else { continue };
                                if cursor.user_id != user_id {
                                    continue;
                                }
                                shared
                                    .presence
                                    .update_cursor(connection_id, cursor.position.x, cursor.position.y)
                                    .await;
                                current.room.fanout().broadcast_raw(Arc::new(bytes));
                            }

                            MessageKind::RequestSync => {
                                let Some(current) = joined.as_ref() else {
                                    send_error(ws_sender, ErrorKind::Protocol, "not joined to a workspace", None).await?;
                                    continue;
                                };
                                let since = match msg.request_sync_payload() {
                                    Ok(payload) => payload.since_version,
                                    Err(e) => {
                                        send_error(ws_sender, ErrorKind::Protocol, e.to_string(), None).await?;
                                        continue;
                                    }
                                };

                                match current.room.sync_since(since).await? {
                                    SyncResponse::Diffs(diffs) => {
                                        send_msg(ws_sender, &WireMessage::sync_diffs(current.workspace_id, diffs)?).await?;
                                    }
                                    SyncResponse::Snapshot(snapshot) => {
                                        let roster = shared.presence.list(current.workspace_id).await;
                                        send_msg(ws_sender, &WireMessage::full_state(snapshot, roster)?).await?;
                                    }
                                }
                            }

                            MessageKind::Ping => {
                                send_msg(ws_sender, &WireMessage::pong(user_id)).await?;
                            }

                            other => {
                                log::debug!("Unhandled message kind {other:?} from {connection_id}");
                            }
                        }
                    }

                    Some(Ok(Message::Ping(data))) => {
                        shared.connections.touch(connection_id).await;
                        let _ = ws_sender.send(Message::Pong(data)).await;
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {connection_id} closed");
                        break;
                    }

                    Some(Err(e)) => {
                        log::warn!("WebSocket error on {connection_id}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            // Outgoing fan-out from the joined room
            fanned = async {
                match broadcast_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match fanned {
                    Ok(data) => {
                        // Don't echo a sender's own frames back at it.
                        if let Ok(msg) = WireMessage::decode(&data) {
                            if msg.sender == user_id {
                                continue;
                            }
                        }
                        if ws_sender.send(Message::Binary(data.to_vec().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // The client notices the version gap and resyncs.
                        log::warn!("Connection {connection_id} lagged by {n} broadcasts");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        *broadcast_rx = None;
                    }
                }
            }

            // Liveness check for this connection
            _ = liveness.tick() => {
                let idle = match shared.connections.get(connection_id).await {
                    Some(entry) => entry.last_seen.elapsed() > shared.config.gateway.heartbeat_timeout,
                    None => true, // swept by the idle pruner
                };
                if idle {
                    log::warn!("Connection {connection_id} missed heartbeats, closing");
                    break;
                }
            }
        }
    }

    Ok(())
}
