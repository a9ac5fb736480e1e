//! End-to-end tests for the synchronization engine.
//!
//! These start a real server and connect real WebSocket clients,
//! verifying the join/update/ack/resync flows across the full stack.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use conflux_core::diff::{ChangeRecord, GraphDiff};
use conflux_core::workspace::Role;
use conflux_sync::client::{ClientConfig, ConnState, SyncClient, SyncEvent};
use conflux_sync::error::ErrorKind;
use conflux_sync::protocol::{MessageKind, WireMessage};
use conflux_sync::room::RoomConfig;
use conflux_sync::server::{ServerConfig, SyncServer};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port; returns the server handle and port.
async fn start_test_server(config: ServerConfig) -> (Arc<SyncServer>, u16) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..config
    };
    let server = Arc::new(SyncServer::new(config).unwrap());
    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    // Give the listener time to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (server, port)
}

async fn start_default_server() -> (Arc<SyncServer>, u16) {
    start_test_server(ServerConfig::default()).await
}

/// Connect, authenticate, and consume the Welcome frame.
async fn connect_authed(port: u16, token: &str, name: &str) -> WsStream {
    let url = format!("ws://127.0.0.1:{port}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let auth = WireMessage::authenticate(token, name).encode().unwrap();
    ws.send(Message::Binary(auth.into())).await.unwrap();

    let welcome = recv_msg(&mut ws).await;
    assert_eq!(welcome.kind, MessageKind::Welcome, "expected Welcome frame");
    ws
}

/// Receive the next protocol message, failing after two seconds.
async fn recv_msg(ws: &mut WsStream) -> WireMessage {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Binary(data) = frame {
            let bytes: Vec<u8> = data.into();
            return WireMessage::decode(&bytes).unwrap();
        }
    }
}

/// Skip frames until one of the wanted kind arrives.
async fn recv_kind(ws: &mut WsStream, kind: MessageKind) -> WireMessage {
    for _ in 0..16 {
        let msg = recv_msg(ws).await;
        if msg.kind == kind {
            return msg;
        }
    }
    panic!("never received {kind:?}");
}

async fn send(ws: &mut WsStream, msg: &WireMessage) {
    ws.send(Message::Binary(msg.encode().unwrap().into()))
        .await
        .unwrap();
}

fn node_diff(node: Uuid, value: serde_json::Value) -> GraphDiff {
    let mut diff = GraphDiff::new();
    diff.set_node(node, value);
    diff
}

/// Provision a workspace with an owner and a second member.
async fn workspace_with_member(
    server: &SyncServer,
    role: Role,
) -> (Uuid, Uuid, String, Uuid, String) {
    let owner = Uuid::new_v4();
    let member = Uuid::new_v4();
    let ws = server.registry().create("shared-analysis", owner).await;
    server.registry().invite(ws.id, owner, member, role).await.unwrap();

    let owner_token = server.tokens().issue(owner).await;
    let member_token = server.tokens().issue(member).await;
    (ws.id, owner, owner_token, member, member_token)
}

#[tokio::test]
async fn test_unauthenticated_connection_is_refused() {
    let (_server, port) = start_default_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let auth = WireMessage::authenticate("tok-forged", "Mallory").encode().unwrap();
    ws.send(Message::Binary(auth.into())).await.unwrap();

    let reply = recv_msg(&mut ws).await;
    assert_eq!(reply.kind, MessageKind::Error);
    assert_eq!(reply.error_payload().unwrap().kind, ErrorKind::Unauthenticated);
}

#[tokio::test]
async fn test_join_receives_full_state_and_roster() {
    let (server, port) = start_default_server().await;
    let (ws_id, owner, owner_token, ..) = workspace_with_member(&server, Role::Editor).await;

    let mut ws = connect_authed(port, &owner_token, "Alice").await;
    send(&mut ws, &WireMessage::join_workspace(ws_id, owner)).await;

    let full = recv_kind(&mut ws, MessageKind::FullState).await;
    let payload = full.full_state_payload().unwrap();
    assert_eq!(payload.snapshot.workspace_id, ws_id);
    assert_eq!(payload.snapshot.version, 0);
    assert!(payload.snapshot.doc.is_empty());
    assert_eq!(payload.members.len(), 1);
    assert_eq!(payload.members[0].user_id, owner);
    assert!(payload.members[0].online);
}

#[tokio::test]
async fn test_join_unknown_workspace_is_not_found() {
    let (server, port) = start_default_server().await;
    let user = Uuid::new_v4();
    let token = server.tokens().issue(user).await;

    let mut ws = connect_authed(port, &token, "Alice").await;
    send(&mut ws, &WireMessage::join_workspace(Uuid::new_v4(), user)).await;

    let reply = recv_kind(&mut ws, MessageKind::Error).await;
    assert_eq!(reply.error_payload().unwrap().kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn test_non_member_join_is_forbidden() {
    let (server, port) = start_default_server().await;
    let owner = Uuid::new_v4();
    let ws_id = server.registry().create("private", owner).await.id;

    let outsider = Uuid::new_v4();
    let token = server.tokens().issue(outsider).await;
    let mut ws = connect_authed(port, &token, "Eve").await;
    send(&mut ws, &WireMessage::join_workspace(ws_id, outsider)).await;

    let reply = recv_kind(&mut ws, MessageKind::Error).await;
    assert_eq!(reply.error_payload().unwrap().kind, ErrorKind::Forbidden);
}

#[tokio::test]
async fn test_update_acked_and_broadcast() {
    let (server, port) = start_default_server().await;
    let (ws_id, owner, owner_token, member, member_token) =
        workspace_with_member(&server, Role::Editor).await;

    let mut alice = connect_authed(port, &owner_token, "Alice").await;
    send(&mut alice, &WireMessage::join_workspace(ws_id, owner)).await;
    recv_kind(&mut alice, MessageKind::FullState).await;

    let mut bob = connect_authed(port, &member_token, "Bob").await;
    send(&mut bob, &WireMessage::join_workspace(ws_id, member)).await;
    recv_kind(&mut bob, MessageKind::FullState).await;
    // Alice sees Bob join.
    recv_kind(&mut alice, MessageKind::UserJoined).await;

    // Alice edits a node.
    let node = Uuid::new_v4();
    let record = ChangeRecord::new(ws_id, owner, 0, node_diff(node, json!({"kind": "dataset"})));
    let key = record.idempotency_key;
    send(&mut alice, &WireMessage::pipeline_update(&record).unwrap()).await;

    // Origin gets the ack with the assigned version.
    let ack = recv_kind(&mut alice, MessageKind::Ack).await.ack_payload().unwrap();
    assert_eq!(ack.idempotency_key, key);
    assert_eq!(ack.version, 1);
    assert!(!ack.duplicate);
    assert_eq!(ack.missed, Some(Vec::new()));

    // The other member gets the state update.
    let update = recv_kind(&mut bob, MessageKind::StateUpdate).await;
    let vdiff = update.versioned_diff().unwrap();
    assert_eq!(vdiff.version, 1);
    assert_eq!(vdiff.origin_user_id, owner);
    assert_eq!(vdiff.diff.nodes[&node], Some(json!({"kind": "dataset"})));
}

#[tokio::test]
async fn test_duplicate_update_not_reapplied_or_rebroadcast() {
    let (server, port) = start_default_server().await;
    let (ws_id, owner, owner_token, member, member_token) =
        workspace_with_member(&server, Role::Editor).await;

    let mut alice = connect_authed(port, &owner_token, "Alice").await;
    send(&mut alice, &WireMessage::join_workspace(ws_id, owner)).await;
    recv_kind(&mut alice, MessageKind::FullState).await;

    let mut bob = connect_authed(port, &member_token, "Bob").await;
    send(&mut bob, &WireMessage::join_workspace(ws_id, member)).await;
    recv_kind(&mut bob, MessageKind::FullState).await;

    let record = ChangeRecord::new(ws_id, owner, 0, node_diff(Uuid::new_v4(), json!(1)));
    send(&mut alice, &WireMessage::pipeline_update(&record).unwrap()).await;
    let first = recv_kind(&mut alice, MessageKind::Ack).await.ack_payload().unwrap();

    // Redeliver the same change record.
    send(&mut alice, &WireMessage::pipeline_update(&record).unwrap()).await;
    let second = recv_kind(&mut alice, MessageKind::Ack).await.ack_payload().unwrap();

    assert_eq!(first.version, 1);
    assert_eq!(second.version, 1, "duplicate must return the original version");
    assert!(second.duplicate);

    // Bob sees exactly one state update.
    recv_kind(&mut bob, MessageKind::StateUpdate).await;
    let extra = timeout(Duration::from_millis(300), async {
        loop {
            let msg = recv_msg(&mut bob).await;
            if msg.kind == MessageKind::StateUpdate {
                return msg;
            }
        }
    })
    .await;
    assert!(extra.is_err(), "duplicate must not be re-broadcast");
}

#[tokio::test]
async fn test_viewer_update_rejected_and_not_broadcast() {
    let (server, port) = start_default_server().await;
    let (ws_id, owner, owner_token, viewer, viewer_token) =
        workspace_with_member(&server, Role::Viewer).await;

    let mut alice = connect_authed(port, &owner_token, "Alice").await;
    send(&mut alice, &WireMessage::join_workspace(ws_id, owner)).await;
    recv_kind(&mut alice, MessageKind::FullState).await;

    let mut eve = connect_authed(port, &viewer_token, "Eve").await;
    send(&mut eve, &WireMessage::join_workspace(ws_id, viewer)).await;
    recv_kind(&mut eve, MessageKind::FullState).await;

    let record = ChangeRecord::new(ws_id, viewer, 0, node_diff(Uuid::new_v4(), json!("nope")));
    let key = record.idempotency_key;
    send(&mut eve, &WireMessage::pipeline_update(&record).unwrap()).await;

    let reply = recv_kind(&mut eve, MessageKind::Error).await.error_payload().unwrap();
    assert_eq!(reply.kind, ErrorKind::Forbidden);
    assert_eq!(reply.idempotency_key, Some(key));

    // Nothing reached the owner's stream.
    let extra = timeout(Duration::from_millis(300), async {
        loop {
            let msg = recv_msg(&mut alice).await;
            if msg.kind == MessageKind::StateUpdate {
                return msg;
            }
        }
    })
    .await;
    assert!(extra.is_err(), "viewer edits must never appear in the update stream");
}

#[tokio::test]
async fn test_stale_base_version_ack_carries_missed_diffs() {
    let (server, port) = start_default_server().await;
    let (ws_id, owner, owner_token, member, member_token) =
        workspace_with_member(&server, Role::Editor).await;

    let mut alice = connect_authed(port, &owner_token, "Alice").await;
    send(&mut alice, &WireMessage::join_workspace(ws_id, owner)).await;
    recv_kind(&mut alice, MessageKind::FullState).await;

    let mut bob = connect_authed(port, &member_token, "Bob").await;
    send(&mut bob, &WireMessage::join_workspace(ws_id, member)).await;
    recv_kind(&mut bob, MessageKind::FullState).await;

    // Alice advances the workspace twice.
    for i in 0..2u64 {
        let record = ChangeRecord::new(ws_id, owner, i, node_diff(Uuid::new_v4(), json!(i)));
        send(&mut alice, &WireMessage::pipeline_update(&record).unwrap()).await;
        recv_kind(&mut alice, MessageKind::Ack).await;
    }

    // Bob submits against version 0 — accepted, ack lists what he missed.
    let record = ChangeRecord::new(ws_id, member, 0, node_diff(Uuid::new_v4(), json!("late")));
    send(&mut bob, &WireMessage::pipeline_update(&record).unwrap()).await;
    let ack = recv_kind(&mut bob, MessageKind::Ack).await.ack_payload().unwrap();

    assert_eq!(ack.version, 3);
    let missed: Vec<u64> = ack.missed.unwrap().iter().map(|d| d.version).collect();
    assert_eq!(missed, vec![1, 2]);
}

#[tokio::test]
async fn test_request_sync_diff_path() {
    let (server, port) = start_default_server().await;
    let (ws_id, owner, owner_token, ..) = workspace_with_member(&server, Role::Editor).await;

    let mut alice = connect_authed(port, &owner_token, "Alice").await;
    send(&mut alice, &WireMessage::join_workspace(ws_id, owner)).await;
    recv_kind(&mut alice, MessageKind::FullState).await;

    for i in 0..5u64 {
        let record = ChangeRecord::new(ws_id, owner, i, node_diff(Uuid::new_v4(), json!(i)));
        send(&mut alice, &WireMessage::pipeline_update(&record).unwrap()).await;
        recv_kind(&mut alice, MessageKind::Ack).await;
    }

    send(&mut alice, &WireMessage::request_sync(ws_id, owner, 3)).await;
    let diffs = recv_kind(&mut alice, MessageKind::SyncDiffs).await
        .sync_diffs_payload()
        .unwrap()
        .diffs;
    assert_eq!(diffs.iter().map(|d| d.version).collect::<Vec<_>>(), vec![4, 5]);
}

#[tokio::test]
async fn test_request_sync_falls_back_to_snapshot_beyond_window() {
    // Tiny retained window so a large gap forces the snapshot path.
    let config = ServerConfig {
        room: RoomConfig {
            history_window: 4,
            ..RoomConfig::default()
        },
        ..ServerConfig::default()
    };
    let (server, port) = start_test_server(config).await;
    let (ws_id, owner, owner_token, ..) = workspace_with_member(&server, Role::Editor).await;

    let mut alice = connect_authed(port, &owner_token, "Alice").await;
    send(&mut alice, &WireMessage::join_workspace(ws_id, owner)).await;
    recv_kind(&mut alice, MessageKind::FullState).await;

    for i in 0..30u64 {
        let record = ChangeRecord::new(ws_id, owner, i, node_diff(Uuid::new_v4(), json!(i)));
        send(&mut alice, &WireMessage::pipeline_update(&record).unwrap()).await;
        recv_kind(&mut alice, MessageKind::Ack).await;
    }

    // A client 30 versions behind gets the full snapshot, not diffs.
    send(&mut alice, &WireMessage::request_sync(ws_id, owner, 0)).await;
    let full = recv_kind(&mut alice, MessageKind::FullState).await
        .full_state_payload()
        .unwrap();
    assert_eq!(full.snapshot.version, 30);
    assert_eq!(full.snapshot.doc.node_count(), 30);
}

#[tokio::test]
async fn test_sync_client_end_to_end_convergence() {
    let (server, port) = start_default_server().await;
    let (ws_id, owner, owner_token, member, member_token) =
        workspace_with_member(&server, Role::Editor).await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut alice = SyncClient::new(ClientConfig::new(&url, &owner_token, "Alice", ws_id, owner));
    let mut alice_events = alice.take_event_rx().unwrap();
    let alice = Arc::new(alice);
    let alice_runner = alice.clone();
    tokio::spawn(async move { alice_runner.run().await });

    // Wait for Alice to finish her initial sync.
    wait_for_synced(&mut alice_events).await;
    assert_eq!(alice.connection_state().await, ConnState::Active);

    let mut bob = SyncClient::new(ClientConfig::new(&url, &member_token, "Bob", ws_id, member));
    let mut bob_events = bob.take_event_rx().unwrap();
    let bob = Arc::new(bob);
    let bob_runner = bob.clone();
    tokio::spawn(async move { bob_runner.run().await });
    wait_for_synced(&mut bob_events).await;

    // Alice edits; Bob converges.
    let node = Uuid::new_v4();
    alice
        .send_update(node_diff(node, json!({"kind": "chart", "x": "date"})))
        .await
        .unwrap();

    wait_for_remote_update(&mut bob_events).await;
    let bob_doc = bob.document().await;
    assert_eq!(bob_doc.node(&node).unwrap()["kind"], "chart");
    assert_eq!(bob.version().await, 1);
    assert_eq!(alice.pending_len().await, 0, "ack must clear the queue");

    alice.shutdown();
    bob.shutdown();
}

#[tokio::test]
async fn test_sync_client_queues_edits_until_server_appears() {
    // The server starts *after* the client: the client backs off,
    // reconnects, resyncs, and only then flushes its queue.
    let port = free_port().await;
    let url = format!("ws://127.0.0.1:{port}");

    let owner = Uuid::new_v4();
    let ws_id;
    let token = "tok-early-bird".to_string();

    let mut config = ClientConfig::new(&url, &token, "Alice", Uuid::nil(), owner);
    config.backoff_base = Duration::from_millis(50);
    config.backoff_max = Duration::from_millis(200);

    // Server provisioned but not yet listening.
    let server = Arc::new(
        SyncServer::new(ServerConfig {
            bind_addr: format!("127.0.0.1:{port}"),
            ..ServerConfig::default()
        })
        .unwrap(),
    );
    ws_id = server.registry().create("late-start", owner).await.id;
    server.tokens().insert(token.clone(), owner).await;
    config.workspace_id = ws_id;

    let mut client = SyncClient::new(config);
    let mut events = client.take_event_rx().unwrap();
    let client = Arc::new(client);
    let runner = client.clone();
    tokio::spawn(async move { runner.run().await });

    // Edits made while the server is down stay queued.
    let node = Uuid::new_v4();
    client.send_update(node_diff(node, json!({"offline": true}))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(client.pending_len().await, 1);
    assert_eq!(client.document().await.node(&node).unwrap()["offline"], true);

    // Bring the server up; the client reconnects and flushes.
    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    wait_for_synced(&mut events).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while client.pending_len().await > 0 {
        assert!(tokio::time::Instant::now() < deadline, "queue never drained");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(client.version().await, 1);

    client.shutdown();
}

async fn wait_for_synced(events: &mut tokio::sync::mpsc::Receiver<SyncEvent>) {
    let deadline = Duration::from_secs(5);
    timeout(deadline, async {
        while let Some(event) = events.recv().await {
            if matches!(event, SyncEvent::Synced { .. }) {
                return;
            }
        }
        panic!("event channel closed before sync");
    })
    .await
    .expect("timed out waiting for sync");
}

async fn wait_for_remote_update(events: &mut tokio::sync::mpsc::Receiver<SyncEvent>) {
    timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if matches!(event, SyncEvent::RemoteUpdate { .. }) {
                return;
            }
        }
        panic!("event channel closed before update");
    })
    .await
    .expect("timed out waiting for remote update");
}
