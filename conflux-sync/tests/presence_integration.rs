//! Integration tests for presence: cursors, rosters, and liveness.
//!
//! These start a real server and connect raw WebSocket clients,
//! verifying cursor fan-out, color assignment, and heartbeat-driven
//! departure through the full network stack.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use conflux_core::workspace::Role;
use conflux_sync::gateway::GatewayConfig;
use conflux_sync::presence::CursorPos;
use conflux_sync::protocol::{CursorPayload, MessageKind, WireMessage};
use conflux_sync::server::{ServerConfig, SyncServer};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

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
    tokio::time::sleep(Duration::from_millis(50)).await;
    (server, port)
}

async fn connect_and_join(port: u16, token: &str, name: &str, ws_id: Uuid, user: Uuid) -> WsStream {
    let url = format!("ws://127.0.0.1:{port}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let auth = WireMessage::authenticate(token, name).encode().unwrap();
    ws.send(Message::Binary(auth.into())).await.unwrap();
    let welcome = recv_msg(&mut ws).await;
    assert_eq!(welcome.kind, MessageKind::Welcome);

    let join = WireMessage::join_workspace(ws_id, user).encode().unwrap();
    ws.send(Message::Binary(join.into())).await.unwrap();
    recv_kind(&mut ws, MessageKind::FullState).await;
    ws
}

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

/// Workspace with `n` editor members; returns (workspace, [(user, token)]).
async fn provision(server: &SyncServer, n: usize) -> (Uuid, Vec<(Uuid, String)>) {
    let owner = Uuid::new_v4();
    let ws = server.registry().create("presence-study", owner).await;
    let mut members = vec![(owner, server.tokens().issue(owner).await)];
    for _ in 1..n {
        let user = Uuid::new_v4();
        server.registry().invite(ws.id, owner, user, Role::Editor).await.unwrap();
        members.push((user, server.tokens().issue(user).await));
    }
    (ws.id, members)
}

#[tokio::test]
async fn test_cursor_broadcast_reaches_others_not_sender() {
    let (server, port) = start_test_server(ServerConfig::default()).await;
    let (ws_id, members) = provision(&server, 2).await;
    let (alice_id, alice_token) = &members[0];
    let (bob_id, bob_token) = &members[1];

    let mut alice = connect_and_join(port, alice_token, "Alice", ws_id, *alice_id).await;
    let mut bob = connect_and_join(port, bob_token, "Bob", ws_id, *bob_id).await;
    recv_kind(&mut alice, MessageKind::UserJoined).await;

    // Bob moves his cursor.
    let cursor = WireMessage::cursor_move(ws_id, CursorPayload {
        user_id: *bob_id,
        position: CursorPos::new(320.0, 240.0),
        timestamp: 1,
    });
    send(&mut bob, &cursor).await;

    // Alice sees it.
    let seen = recv_kind(&mut alice, MessageKind::CursorMove).await.cursor_payload().unwrap();
    assert_eq!(seen.user_id, *bob_id);
    assert_eq!(seen.position, CursorPos::new(320.0, 240.0));

    // Bob gets no echo.
    let echo = timeout(Duration::from_millis(300), async {
        loop {
            let msg = recv_msg(&mut bob).await;
            if msg.kind == MessageKind::CursorMove {
                return msg;
            }
        }
    })
    .await;
    assert!(echo.is_err(), "cursor frames must not echo to their sender");
}

#[tokio::test]
async fn test_cursor_position_lands_in_roster() {
    let (server, port) = start_test_server(ServerConfig::default()).await;
    let (ws_id, members) = provision(&server, 2).await;
    let (alice_id, alice_token) = &members[0];
    let (bob_id, bob_token) = &members[1];

    let mut alice = connect_and_join(port, alice_token, "Alice", ws_id, *alice_id).await;
    send(&mut alice, &WireMessage::cursor_move(ws_id, CursorPayload {
        user_id: *alice_id,
        position: CursorPos::new(64.0, 32.0),
        timestamp: 1,
    }))
    .await;
    // Give the tracker a moment to absorb the advisory frame.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A later joiner sees Alice's cursor in the full-state roster.
    let mut bob = connect_and_join(port, bob_token, "Bob", ws_id, *bob_id).await;
    send(&mut bob, &WireMessage::leave_workspace(ws_id, *bob_id)).await;

    let roster = server.presence().list(ws_id).await;
    let alice_row = roster.iter().find(|m| m.user_id == *alice_id).unwrap();
    assert_eq!(alice_row.cursor, Some(CursorPos::new(64.0, 32.0)));
    assert_eq!(alice_row.name, "Alice");
}

#[tokio::test]
async fn test_members_get_distinct_palette_colors() {
    let (server, port) = start_test_server(ServerConfig::default()).await;
    let (ws_id, members) = provision(&server, 3).await;

    let mut sockets = Vec::new();
    for (i, (user, token)) in members.iter().enumerate() {
        sockets.push(connect_and_join(port, token, &format!("User{i}"), ws_id, *user).await);
    }

    let roster = server.presence().list(ws_id).await;
    assert_eq!(roster.len(), 3);
    let mut colors: Vec<String> = roster.iter().map(|m| format!("{:?}", m.color)).collect();
    colors.sort();
    colors.dedup();
    assert_eq!(colors.len(), 3, "coexisting members must not share a color");

    drop(sockets);
}

#[tokio::test]
async fn test_disconnect_broadcasts_user_left_and_clears_presence() {
    let (server, port) = start_test_server(ServerConfig::default()).await;
    let (ws_id, members) = provision(&server, 2).await;
    let (alice_id, alice_token) = &members[0];
    let (bob_id, bob_token) = &members[1];

    let mut alice = connect_and_join(port, alice_token, "Alice", ws_id, *alice_id).await;
    let bob = connect_and_join(port, bob_token, "Bob", ws_id, *bob_id).await;
    recv_kind(&mut alice, MessageKind::UserJoined).await;

    drop(bob); // hard disconnect

    let left = recv_kind(&mut alice, MessageKind::UserLeft).await;
    assert_eq!(left.sender, *bob_id);

    // Membership survives; presence is cleared.
    let roster = server.presence().list(ws_id).await;
    let bob_row = roster.iter().find(|m| m.user_id == *bob_id).unwrap();
    assert!(!bob_row.online);
    assert!(bob_row.cursor.is_none());
}

#[tokio::test]
async fn test_silent_connection_is_swept_by_heartbeat() {
    let config = ServerConfig {
        gateway: GatewayConfig {
            heartbeat_interval: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_millis(250),
            ..GatewayConfig::default()
        },
        ..ServerConfig::default()
    };
    let (server, port) = start_test_server(config).await;
    let (ws_id, members) = provision(&server, 2).await;
    let (alice_id, alice_token) = &members[0];
    let (bob_id, bob_token) = &members[1];

    let mut alice = connect_and_join(port, alice_token, "Alice", ws_id, *alice_id).await;
    let _bob = connect_and_join(port, bob_token, "Bob", ws_id, *bob_id).await;
    recv_kind(&mut alice, MessageKind::UserJoined).await;

    // Bob goes silent; Alice keeps heartbeating and waits for the
    // server to declare him gone.
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut bob_left = false;
    while !bob_left {
        assert!(Instant::now() < deadline, "idle connection never swept");
        send(&mut alice, &WireMessage::ping(*alice_id)).await;
        if let Ok(Some(Ok(Message::Binary(data)))) =
            timeout(Duration::from_millis(100), alice.next()).await
        {
            let bytes: Vec<u8> = data.into();
            if let Ok(msg) = WireMessage::decode(&bytes) {
                if msg.kind == MessageKind::UserLeft && msg.sender == *bob_id {
                    bob_left = true;
                }
            }
        }
    }

    // Presence never reports him online after the timeout.
    let roster = server.presence().list(ws_id).await;
    let bob_row = roster.iter().find(|m| m.user_id == *bob_id).unwrap();
    assert!(!bob_row.online);
}
