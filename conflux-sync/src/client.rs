//! Sync client — owns the local replica and drives reconnection.
//!
//! ```text
//!        ┌─────────────────────────────────────────────┐
//!        │                ClientCore                   │
//!        │  confirmed doc ◄── acks / state updates     │
//!        │  pending queue ──► resent after resync      │
//!        │  state machine: Disconnected → Reconnecting │
//!        │                 → Resyncing → Active        │
//!        └────────────────────┬────────────────────────┘
//!                             │ reactions (frames out, events up)
//!        ┌────────────────────┴────────────────────────┐
//!        │  SyncClient (WebSocket shell, backoff loop) │
//!        └─────────────────────────────────────────────┘
//! ```
//!
//! Local edits are applied optimistically and queued with a
//! client-generated idempotency key; an entry leaves the queue only on
//! its matching ack, so redelivery after reconnect is safe. The visible
//! document is always `confirmed state + pending replay`, which makes
//! rejection rollback trivial — drop the entry and the optimistic edit
//! evaporates.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, Notify};
use uuid::Uuid;

use conflux_core::diff::{ChangeRecord, GraphDiff, VersionedDiff};
use conflux_core::graph::PipelineDoc;

use crate::error::{ErrorKind, SyncError};
use crate::presence::{CursorPos, CursorThrottle, MemberInfo};
use crate::protocol::{CursorPayload, MessageKind, WireMessage};

/// Client connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Reconnecting,
    /// Connected; waiting for the post-join snapshot/diffs.
    Resyncing,
    Active,
}

/// Events surfaced to the embedding UI.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Resync finished; the replica is at this version.
    Synced { version: u64 },
    /// A remote member's change was applied to the replica.
    RemoteUpdate { version: u64, origin_user_id: Uuid },
    /// A member's advisory cursor moved.
    CursorMoved { user_id: Uuid, position: CursorPos },
    UserJoined(MemberInfo),
    UserLeft { user_id: Uuid },
    /// A queued update was rejected; it has been rolled back locally.
    UpdateRejected { idempotency_key: Uuid, kind: ErrorKind },
}

/// Frames to send and events to emit after processing one input.
#[derive(Debug, Default)]
pub struct Reaction {
    pub outgoing: Vec<WireMessage>,
    pub events: Vec<SyncEvent>,
}

impl Reaction {
    fn event(event: SyncEvent) -> Self {
        Self {
            outgoing: Vec::new(),
            events: vec![event],
        }
    }
}

/// Exponential backoff with a cap, reset on successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    /// Delay before the next attempt: `base * 2^n`, capped.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.attempt.min(16);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// The connection-independent half of the client: replica, queue, and
/// protocol reactions. Pure enough to test without a socket.
pub struct ClientCore {
    workspace_id: Uuid,
    user_id: Uuid,
    state: ConnState,
    /// Server-confirmed document.
    confirmed: PipelineDoc,
    /// Highest server version reflected in `confirmed`.
    version: u64,
    /// Unacknowledged local edits, oldest first.
    pending: VecDeque<ChangeRecord>,
    /// Latest roster received from the server.
    roster: HashMap<Uuid, MemberInfo>,
    /// Stale-frame filter for remote cursors.
    cursor_clocks: HashMap<Uuid, u64>,
    throttle: CursorThrottle,
    /// Pending entries beyond this are refused.
    max_pending: usize,
}

impl ClientCore {
    pub fn new(workspace_id: Uuid, user_id: Uuid) -> Self {
        Self {
            workspace_id,
            user_id,
            state: ConnState::Disconnected,
            confirmed: PipelineDoc::new(),
            version: 0,
            pending: VecDeque::new(),
            roster: HashMap::new(),
            cursor_clocks: HashMap::new(),
            throttle: CursorThrottle::new(),
            max_pending: 10_000,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnState) {
        self.state = state;
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn roster(&self) -> Vec<MemberInfo> {
        let mut members: Vec<MemberInfo> = self.roster.values().cloned().collect();
        members.sort_by_key(|m| m.user_id);
        members
    }

    /// The visible document: confirmed state plus optimistic replay of
    /// everything still in flight.
    pub fn document(&self) -> PipelineDoc {
        let mut doc = self.confirmed.clone();
        for record in &self.pending {
            doc.apply_diff(&record.diff);
        }
        doc
    }

    /// Record a local edit. Optimistically visible immediately; the
    /// frame is returned for sending only while the connection is
    /// active (otherwise it waits in the queue for the next resync).
    pub fn local_update(&mut self, diff: GraphDiff) -> Result<Option<WireMessage>, SyncError> {
        if self.pending.len() >= self.max_pending {
            return Err(SyncError::Transient("outbound queue full".into()));
        }
        let record = ChangeRecord::new(self.workspace_id, self.user_id, self.version, diff);
        self.pending.push_back(record.clone());

        if self.state == ConnState::Active {
            Ok(Some(WireMessage::pipeline_update(&record)?))
        } else {
            Ok(None)
        }
    }

    /// Offer a cursor position; rate-limited, dropped while offline.
    pub fn cursor_move(&mut self, x: f32, y: f32) -> Option<WireMessage> {
        if self.state != ConnState::Active {
            return None;
        }
        let (position, timestamp) = self.throttle.offer(CursorPos::new(x, y))?;
        Some(WireMessage::cursor_move(
            self.workspace_id,
            CursorPayload {
                user_id: self.user_id,
                position,
                timestamp,
            },
        ))
    }

    /// Process one server frame.
    pub fn on_message(&mut self, msg: &WireMessage) -> Result<Reaction, SyncError> {
        match msg.kind {
            MessageKind::Welcome => {
                // Authenticated: re-join and ask for what we missed.
                self.state = ConnState::Resyncing;
                Ok(Reaction {
                    outgoing: vec![
                        WireMessage::join_workspace(self.workspace_id, self.user_id),
                        WireMessage::request_sync(self.workspace_id, self.user_id, self.version),
                    ],
                    events: vec![SyncEvent::Connected],
                })
            }

            MessageKind::FullState => {
                let payload = msg.full_state_payload()?;
                self.confirmed = payload.snapshot.doc;
                self.version = payload.snapshot.version;
                self.roster = payload
                    .members
                    .into_iter()
                    .map(|m| (m.user_id, m))
                    .collect();
                Ok(self.finish_resync())
            }

            MessageKind::SyncDiffs => {
                let payload = msg.sync_diffs_payload()?;
                for diff in &payload.diffs {
                    self.absorb_confirmed(diff);
                }
                if self.state == ConnState::Resyncing {
                    Ok(self.finish_resync())
                } else {
                    Ok(Reaction::event(SyncEvent::Synced { version: self.version }))
                }
            }

            MessageKind::StateUpdate => {
                let diff = msg.versioned_diff()?;
                if diff.version <= self.version {
                    // Already reflected (e.g. delivered late after an
                    // ack's missed list covered it).
                    return Ok(Reaction::default());
                }
                if diff.version > self.version + 1 {
                    // A broadcast was lost somewhere; recover explicitly.
                    log::warn!(
                        "State update gap: have {}, received {}; resyncing",
                        self.version,
                        diff.version
                    );
                    self.state = ConnState::Resyncing;
                    return Ok(Reaction {
                        outgoing: vec![WireMessage::request_sync(
                            self.workspace_id,
                            self.user_id,
                            self.version,
                        )],
                        events: Vec::new(),
                    });
                }
                let event = SyncEvent::RemoteUpdate {
                    version: diff.version,
                    origin_user_id: diff.origin_user_id,
                };
                self.absorb_confirmed(&diff);
                Ok(Reaction::event(event))
            }

            MessageKind::Ack => {
                let ack = msg.ack_payload()?;
                let Some(index) = self
                    .pending
                    .iter()
                    .position(|r| r.idempotency_key == ack.idempotency_key)
                else {
                    return Ok(Reaction::default());
                };
                let record = match self.pending.remove(index) {
                    Some(record) => record,
                    None => return Ok(Reaction::default()),
                };

                match &ack.missed {
                    Some(missed) => {
                        for diff in missed {
                            if diff.version > self.version {
                                self.confirmed.apply_diff(&diff.diff);
                            }
                        }
                        // Replay our own change last; the server
                        // applied it after everything in `missed`.
                        self.confirmed.apply_diff(&record.diff);
                        self.version = self.version.max(ack.version);
                        Ok(Reaction::default())
                    }
                    None => {
                        // Gap beyond the retained window; our change is
                        // applied server-side but our baseline is stale.
                        self.confirmed.apply_diff(&record.diff);
                        self.version = self.version.max(ack.version);
                        self.state = ConnState::Resyncing;
                        Ok(Reaction {
                            outgoing: vec![WireMessage::request_sync(
                                self.workspace_id,
                                self.user_id,
                                self.version,
                            )],
                            events: Vec::new(),
                        })
                    }
                }
            }

            MessageKind::CursorMove => {
                let cursor = msg.cursor_payload()?;
                if cursor.user_id == self.user_id {
                    return Ok(Reaction::default());
                }
                let clock = self.cursor_clocks.entry(cursor.user_id).or_insert(0);
                if cursor.timestamp < *clock {
                    return Ok(Reaction::default()); // reordered frame
                }
                *clock = cursor.timestamp;
                if let Some(member) = self.roster.get_mut(&cursor.user_id) {
                    member.cursor = Some(cursor.position);
                }
                Ok(Reaction::event(SyncEvent::CursorMoved {
                    user_id: cursor.user_id,
                    position: cursor.position,
                }))
            }

            MessageKind::UserJoined => {
                let member = msg.member_payload()?;
                if member.user_id == self.user_id {
                    return Ok(Reaction::default());
                }
                let event = SyncEvent::UserJoined(member.clone());
                self.roster.insert(member.user_id, member);
                Ok(Reaction::event(event))
            }

            MessageKind::UserLeft => {
                let user_id = msg.sender;
                if let Some(member) = self.roster.get_mut(&user_id) {
                    member.online = false;
                    member.cursor = None;
                }
                self.cursor_clocks.remove(&user_id);
                Ok(Reaction::event(SyncEvent::UserLeft { user_id }))
            }

            MessageKind::Error => {
                let payload = msg.error_payload()?;
                match payload.idempotency_key {
                    Some(key) => {
                        // Dropping the entry is the rollback; the visible
                        // document is recomputed without it.
                        self.pending.retain(|r| r.idempotency_key != key);
                        log::warn!("Update {key} rejected: {} ({:?})", payload.detail, payload.kind);
                        Ok(Reaction::event(SyncEvent::UpdateRejected {
                            idempotency_key: key,
                            kind: payload.kind,
                        }))
                    }
                    None => {
                        log::warn!("Server error: {} ({:?})", payload.detail, payload.kind);
                        Ok(Reaction::default())
                    }
                }
            }

            MessageKind::Pong => Ok(Reaction::default()),

            other => {
                log::debug!("Client ignoring message kind {other:?}");
                Ok(Reaction::default())
            }
        }
    }

    /// Fold a confirmed remote diff into the replica.
    fn absorb_confirmed(&mut self, diff: &VersionedDiff) {
        if diff.version <= self.version {
            return;
        }
        self.confirmed.apply_diff(&diff.diff);
        self.version = diff.version;
    }

    /// Resync complete: go active and resend everything still pending,
    /// rebased onto the fresh baseline with the original idempotency
    /// keys (the room deduplicates anything that already landed).
    fn finish_resync(&mut self) -> Reaction {
        self.state = ConnState::Active;
        let mut reaction = Reaction::event(SyncEvent::Synced { version: self.version });

        for record in self.pending.iter_mut() {
            record.base_version = self.version;
        }
        for record in &self.pending {
            match WireMessage::pipeline_update(record) {
                Ok(msg) => reaction.outgoing.push(msg),
                Err(e) => log::error!("Failed to encode pending update: {e}"),
            }
        }
        if !reaction.outgoing.is_empty() {
            log::info!("Resending {} queued updates after resync", reaction.outgoing.len());
        }
        reaction
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9420`.
    pub server_url: String,
    pub token: String,
    pub display_name: String,
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    /// First reconnect delay; doubles up to `backoff_max`.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub heartbeat_interval: Duration,
}

impl ClientConfig {
    pub fn new(
        server_url: impl Into<String>,
        token: impl Into<String>,
        display_name: impl Into<String>,
        workspace_id: Uuid,
        user_id: Uuid,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            token: token.into(),
            display_name: display_name.into(),
            workspace_id,
            user_id,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// The WebSocket shell around [`ClientCore`].
pub struct SyncClient {
    config: ClientConfig,
    core: Arc<Mutex<ClientCore>>,
    outgoing: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    shutdown: Arc<Notify>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let core = ClientCore::new(config.workspace_id, config.user_id);
        Self {
            config,
            core: Arc::new(Mutex::new(core)),
            outgoing: Arc::new(Mutex::new(None)),
            event_tx,
            event_rx: Some(event_rx),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Take the event receiver (can only be taken once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub async fn connection_state(&self) -> ConnState {
        self.core.lock().await.state()
    }

    pub async fn version(&self) -> u64 {
        self.core.lock().await.version()
    }

    pub async fn pending_len(&self) -> usize {
        self.core.lock().await.pending_len()
    }

    /// The optimistic local document.
    pub async fn document(&self) -> PipelineDoc {
        self.core.lock().await.document()
    }

    pub async fn roster(&self) -> Vec<MemberInfo> {
        self.core.lock().await.roster()
    }

    /// Submit a local edit. Applied optimistically; queued across
    /// disconnects.
    pub async fn send_update(&self, diff: GraphDiff) -> Result<(), SyncError> {
        let frame = self.core.lock().await.local_update(diff)?;
        if let Some(msg) = frame {
            self.send_frame(&msg).await?;
        }
        Ok(())
    }

    /// Send a cursor position (rate-limited, lossy).
    pub async fn send_cursor(&self, x: f32, y: f32) -> Result<(), SyncError> {
        let frame = self.core.lock().await.cursor_move(x, y);
        if let Some(msg) = frame {
            self.send_frame(&msg).await?;
        }
        Ok(())
    }

    /// Stop the reconnect loop and close the connection.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    async fn send_frame(&self, msg: &WireMessage) -> Result<(), SyncError> {
        let encoded = msg.encode()?;
        let guard = self.outgoing.lock().await;
        match guard.as_ref() {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| SyncError::Transient("connection writer gone".into())),
            None => Ok(()), // offline: the edit stays queued in the core
        }
    }

    async fn emit(&self, events: Vec<SyncEvent>) {
        for event in events {
            let _ = self.event_tx.send(event).await;
        }
    }

    /// Run the connect/reconnect loop until [`shutdown`](Self::shutdown).
    pub async fn run(&self) {
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_max);

        loop {
            self.core.lock().await.set_state(ConnState::Reconnecting);

            match tokio_tungstenite::connect_async(&self.config.server_url).await {
                Ok((ws_stream, _)) => {
                    backoff.reset();
                    let finished = self.drive(ws_stream).await;
                    self.core.lock().await.set_state(ConnState::Disconnected);
                    *self.outgoing.lock().await = None;
                    self.emit(vec![SyncEvent::Disconnected]).await;
                    if finished {
                        return; // shutdown requested
                    }
                }
                Err(e) => {
                    log::debug!("Connect failed: {e}");
                }
            }

            let delay = backoff.next_delay();
            log::info!("Reconnecting in {delay:?} (attempt {})", backoff.attempts());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => return,
            }
        }
    }

    /// Drive one established connection; returns true on shutdown.
    async fn drive(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> bool {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Writer task decouples protocol handling from socket sends.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        *self.outgoing.lock().await = Some(out_tx.clone());
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_sender
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        // Re-authenticate; the Welcome reply triggers join + resync.
        let auth = WireMessage::authenticate(&self.config.token, &self.config.display_name);
        match auth.encode() {
            Ok(encoded) => {
                if out_tx.send(encoded).await.is_err() {
                    writer.abort();
                    return false;
                }
            }
            Err(e) => {
                log::error!("Failed to encode authenticate frame: {e}");
                writer.abort();
                return false;
            }
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let finished = loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(tokio_tungstenite::tungstenite::Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let msg = match WireMessage::decode(&bytes) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    log::warn!("Undecodable server frame: {e}");
                                    continue;
                                }
                            };
                            let reaction = {
                                let mut core = self.core.lock().await;
                                match core.on_message(&msg) {
                                    Ok(reaction) => reaction,
                                    Err(e) => {
                                        log::warn!("Protocol error on {:?}: {e}", msg.kind);
                                        continue;
                                    }
                                }
                            };
                            for out in &reaction.outgoing {
                                match out.encode() {
                                    Ok(encoded) => {
                                        if out_tx.send(encoded).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => log::error!("Failed to encode frame: {e}"),
                                }
                            }
                            self.emit(reaction.events).await;
                        }
                        Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None => {
                            break false;
                        }
                        Some(Err(e)) => {
                            log::debug!("WebSocket read error: {e}");
                            break false;
                        }
                        _ => {}
                    }
                }

                _ = heartbeat.tick() => {
                    let ping = WireMessage::ping(self.config.user_id);
                    match ping.encode() {
                        Ok(encoded) => {
                            if out_tx.send(encoded).await.is_err() {
                                break false;
                            }
                        }
                        Err(e) => log::error!("Failed to encode ping: {e}"),
                    }
                }

                _ = self.shutdown.notified() => {
                    break true;
                }
            }
        };

        writer.abort();
        finished
    }
}
