//! Integration tests for end-to-end WebSocket drawing sessions.
//!
//! These tests start a real server and connect real clients,
//! verifying the full pipeline: ingress, durable log, fan-out, history.

use futures_util::{SinkExt, StreamExt};
use p5sync_collab::client::{CanvasClient, ClientEvent, ConnectionState};
use p5sync_collab::config::ServerConfig;
use p5sync_collab::operation::{Point, Segment, Stroke};
use p5sync_collab::protocol::ServerMessage;
use p5sync_collab::server::SyncServer;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return its URL and handle.
async fn start_test_server() -> (String, Arc<SyncServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::new(config).unwrap());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (format!("ws://127.0.0.1:{port}"), server)
}

fn stroke(x: f64) -> Stroke {
    Stroke::Pencil {
        color: Some("#112233".into()),
        segments: vec![Segment::new(Point::new(0.0, 0.0), Point::new(x, x))],
    }
}

async fn next_event(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event within timeout")
        .expect("event channel open")
}

/// Connect a client and wait until its initial history has arrived, which
/// also means it is subscribed to its room.
async fn joined_client(
    url: &str,
    room: &str,
    id: &str,
) -> (CanvasClient, mpsc::Receiver<ClientEvent>, Vec<p5sync_collab::Operation>) {
    let mut client = CanvasClient::new(url, room, id);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);
    match next_event(&mut events).await {
        ClientEvent::History(history) => (client, events, history),
        other => panic!("Expected history, got {other:?}"),
    }
}

async fn raw_socket(url: &str) -> RawSocket {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send_raw(ws: &mut RawSocket, text: &str) {
    ws.send(Message::Text(text.to_string().into())).await.unwrap();
}

async fn recv_raw(ws: &mut RawSocket) -> Option<ServerMessage> {
    loop {
        match timeout(Duration::from_millis(500), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return Some(ServerMessage::decode(text.as_str()).unwrap())
            }
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (url, server) = start_test_server().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.stats().await.total_connections, 1);
}

#[tokio::test]
async fn test_client_connects_and_receives_history() {
    let (url, _server) = start_test_server().await;
    let (client, _events, history) = joined_client(&url, "fresh", "alice").await;

    assert!(history.is_empty());
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_broadcast_to_peer_and_history_for_late_joiner() {
    let (url, _server) = start_test_server().await;
    let (alice, mut alice_events, _) = joined_client(&url, "x", "alice").await;
    let (_bob, mut bob_events, _) = joined_client(&url, "x", "bob").await;

    let sent = alice.draw(stroke(5.0)).await.unwrap();

    match next_event(&mut bob_events).await {
        ClientEvent::Remote(op) => {
            assert_eq!(op.id, "alice");
            assert_eq!(op.stroke, sent.stroke);
        }
        other => panic!("Expected remote op, got {other:?}"),
    }
    assert!(timeout(Duration::from_millis(200), alice_events.recv()).await.is_err());

    let (_carol, _, history) = joined_client(&url, "x", "carol").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, "alice");
    assert!(history[0].timestamp.is_some());
}

#[tokio::test]
async fn test_clear_then_draw_leaves_only_new_stroke() {
    let (url, _server) = start_test_server().await;
    let (alice, _alice_events, _) = joined_client(&url, "x", "alice").await;
    let (_bob, mut bob_events, _) = joined_client(&url, "x", "bob").await;

    alice.draw(stroke(1.0)).await.unwrap();
    alice.clear().await.unwrap();
    alice.draw(stroke(2.0)).await.unwrap();

    // Bob sees all three in order, the clear included
    let mut modes = Vec::new();
    for _ in 0..3 {
        match next_event(&mut bob_events).await {
            ClientEvent::Remote(op) => modes.push(op.mode().to_string()),
            other => panic!("Expected remote op, got {other:?}"),
        }
    }
    assert_eq!(modes, vec!["pencil", "clear", "pencil"]);

    let (_carol, _, history) = joined_client(&url, "x", "carol").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].stroke, stroke(2.0));
}

#[tokio::test]
async fn test_history_of_unknown_room_is_empty() {
    let (url, server) = start_test_server().await;
    let mut ws = raw_socket(&url).await;

    send_raw(&mut ws, r#"{"event":"request_history","data":{"room":"never-seen"}}"#).await;
    assert_eq!(recv_raw(&mut ws).await, Some(ServerMessage::DispatchHistory(Vec::new())));
    assert!(server.hub().registry().get("never-seen").await.is_some());
}

#[tokio::test]
async fn test_request_history_without_room_uses_default() {
    let (url, server) = start_test_server().await;
    let mut ws = raw_socket(&url).await;

    send_raw(&mut ws, r#"{"event":"request_history"}"#).await;
    assert_eq!(recv_raw(&mut ws).await, Some(ServerMessage::DispatchHistory(Vec::new())));
    assert!(server.hub().registry().get("default").await.is_some());
}

#[tokio::test]
async fn test_invalid_operations_are_dropped() {
    let (url, server) = start_test_server().await;
    let (_bob, mut bob_events, _) = joined_client(&url, "x", "bob").await;
    let mut ws = raw_socket(&url).await;

    // Outside the canvas, unknown mode, null coordinate, not JSON
    send_raw(
        &mut ws,
        r#"{"event":"draw","data":{"room":"x","id":"eve","mode":"pencil",
            "lines":[{"start":{"x":0,"y":0},"end":{"x":1281,"y":10}}]}}"#,
    )
    .await;
    send_raw(&mut ws, r#"{"event":"draw","data":{"room":"x","id":"eve","mode":"spray"}}"#).await;
    send_raw(
        &mut ws,
        r#"{"event":"draw","data":{"room":"x","id":"eve","mode":"pencil",
            "lines":[{"start":{"x":null,"y":0},"end":{"x":1,"y":1}}]}}"#,
    )
    .await;
    send_raw(&mut ws, "garbage").await;

    // The connection survives and a valid draw still goes through
    send_raw(
        &mut ws,
        r#"{"event":"draw","data":{"room":"x","id":"eve","mode":"rubber",
            "circles":[{"center":{"x":20,"y":20},"radius":3}]}}"#,
    )
    .await;

    match next_event(&mut bob_events).await {
        ClientEvent::Remote(op) => assert_eq!(op.mode().as_str(), "rubber"),
        other => panic!("Expected the valid op only, got {other:?}"),
    }

    let stats = server.stats().await;
    assert_eq!(stats.rejected, 2);
    assert_eq!(stats.total_messages, 6);

    let history = server.hub().registry().get("x").await.unwrap().log().snapshot().await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_author_is_not_echoed() {
    let (url, _server) = start_test_server().await;
    let (_bob, mut bob_events, _) = joined_client(&url, "x", "bob").await;

    let mut ws = raw_socket(&url).await;
    send_raw(&mut ws, r#"{"event":"request_history","data":{"room":"x"}}"#).await;
    assert!(matches!(recv_raw(&mut ws).await, Some(ServerMessage::DispatchHistory(_))));

    send_raw(&mut ws, r#"{"event":"draw","data":{"room":"x","id":"raw","mode":"clear"}}"#).await;
    assert!(matches!(next_event(&mut bob_events).await, ClientEvent::Remote(_)));
    assert_eq!(recv_raw(&mut ws).await, None);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (url, _server) = start_test_server().await;
    let (alice, _, _) = joined_client(&url, "r1", "alice").await;
    let (_bob, mut bob_events, _) = joined_client(&url, "r2", "bob").await;

    alice.draw(stroke(3.0)).await.unwrap();
    assert!(timeout(Duration::from_millis(200), bob_events.recv()).await.is_err());

    let (_carol, _, history) = joined_client(&url, "r2", "carol").await;
    assert!(history.is_empty());
}

#[tokio::test]
async fn test_reconnect_rehydrates_missed_operations() {
    let (url, _server) = start_test_server().await;
    let (alice, _, _) = joined_client(&url, "x", "alice").await;
    let (mut bob, mut bob_events, _) = joined_client(&url, "x", "bob").await;

    bob.disconnect().await;
    assert_eq!(next_event(&mut bob_events).await, ClientEvent::Disconnected);
    assert_eq!(bob.connection_state().await, ConnectionState::Disconnected);

    alice.draw(stroke(4.0)).await.unwrap();
    alice.draw(stroke(6.0)).await.unwrap();
    // Let the server commit both before bob asks
    tokio::time::sleep(Duration::from_millis(100)).await;

    bob.reconnect().await.unwrap();
    assert_eq!(next_event(&mut bob_events).await, ClientEvent::Connected);
    match next_event(&mut bob_events).await {
        ClientEvent::History(history) => {
            let strokes: Vec<_> = history.into_iter().map(|op| op.stroke).collect();
            assert_eq!(strokes, vec![stroke(4.0), stroke(6.0)]);
        }
        other => panic!("Expected history, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connection_stats() {
    let (url, server) = start_test_server().await;
    {
        let (_alice, _, _) = joined_client(&url, "x", "alice").await;
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.active_rooms, 1);
    }

    // Dropping the client closes its socket
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = server.stats().await;
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.total_connections, 1);
}
