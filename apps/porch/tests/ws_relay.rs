use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use porch_client_core::media::{MediaConstraints, MediaStack, MockMediaStack};
use porch_client_core::session::{RoomEvent, RoomSession, SessionOptions};
use porch_client_core::transport::WebSocketChannel;

const WAIT: Duration = Duration::from_secs(10);

type Rooms = Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>;

/// Minimal room relay: every frame sent into a room fans out to all members
/// of that room, the sender included.
async fn spawn_relay() -> SocketAddr {
    let rooms: Rooms = Arc::new(Mutex::new(HashMap::new()));
    let app = Router::new()
        .route("/ws/:room", get(ws_handler))
        .with_state(rooms);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room): Path<String>,
    State(rooms): State<Rooms>,
) -> impl IntoResponse {
    let sender = rooms
        .lock()
        .unwrap()
        .entry(room)
        .or_insert_with(|| broadcast::channel(256).0)
        .clone();
    ws.on_upgrade(move |socket| relay_member(socket, sender))
}

async fn relay_member(socket: WebSocket, sender: broadcast::Sender<String>) {
    let mut fanout = sender.subscribe();
    let (mut write, mut read) = socket.split();

    let forward = tokio::spawn(async move {
        while let Ok(text) = fanout.recv().await {
            if write.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = read.next().await {
        if let WsMessage::Text(text) = frame {
            let _ = sender.send(text);
        }
    }
    forward.abort();
}

async fn session_over_ws(
    addr: SocketAddr,
    room: &str,
    username: &str,
) -> (RoomSession, Arc<MockMediaStack>) {
    let channel = WebSocketChannel::connect(
        &format!("http://{addr}"),
        room,
        username,
        Some("seashell"),
    )
    .await
    .expect("websocket connect");
    let (media_tx, media_rx) = mpsc::unbounded_channel();
    let media = MockMediaStack::new(media_tx);
    let session = RoomSession::spawn(
        SessionOptions::new(username).with_constraints(MediaConstraints::AUDIO_VIDEO),
        channel,
        Arc::clone(&media) as Arc<dyn MediaStack>,
        media_rx,
    );
    (session, media)
}

#[tokio::test]
async fn two_clients_negotiate_over_a_real_websocket_relay() {
    let addr = spawn_relay().await;

    let (alice, _alice_media) = session_over_ws(addr, "driftwood", "alice").await;
    let (bob, _bob_media) = session_over_ws(addr, "driftwood", "bob").await;

    let alice_view = timeout(WAIT, async {
        loop {
            if let Some(observer) = alice.peer("bob") {
                return observer;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("alice never saw bob");
    let bob_view = timeout(WAIT, async {
        loop {
            if let Some(observer) = bob.peer("alice") {
                return observer;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bob never saw alice");

    assert!(
        timeout(WAIT, alice_view.wait_connected())
            .await
            .expect("alice connect timed out")
    );
    assert!(
        timeout(WAIT, bob_view.wait_connected())
            .await
            .expect("bob connect timed out")
    );
}

#[tokio::test]
async fn chat_crosses_the_relay() {
    let addr = spawn_relay().await;

    let (alice, _alice_media) = session_over_ws(addr, "boardwalk", "alice").await;
    let (bob, _bob_media) = session_over_ws(addr, "boardwalk", "bob").await;
    let mut bob_events = bob.events().await.expect("bob events");

    // Make sure bob has seen alice before she speaks, so we know the relay
    // round-trip is up.
    timeout(WAIT, async {
        loop {
            if bob.peer("alice").is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bob never saw alice");

    alice.send_chat("meet you on the porch").expect("chat send");

    let message = timeout(WAIT, async {
        loop {
            match bob_events.recv().await {
                Some(RoomEvent::Chat {
                    username, message, ..
                }) if username == "alice" => return message,
                Some(_) => {}
                None => panic!("bob's event stream closed"),
            }
        }
    })
    .await
    .expect("chat never arrived");
    assert_eq!(message, "meet you on the porch");
}

#[tokio::test]
async fn rooms_are_isolated() {
    let addr = spawn_relay().await;

    let (alice, _alice_media) = session_over_ws(addr, "porch-a", "alice").await;
    let (bob, _bob_media) = session_over_ws(addr, "porch-b", "bob").await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(alice.peer("bob").is_none());
    assert!(bob.peer("alice").is_none());
}
