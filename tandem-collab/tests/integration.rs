//! End-to-end rooms over real WebSockets.
//!
//! Each test starts an in-process relay and connects rooms through
//! `WsConnector`, verifying sync, presence and reconnect behavior.

mod common;

use common::{eventually, Relay};
use std::sync::Arc;

use tandem_collab::{
    ConnectionState, CursorPosition, MessageType, Room, RoomConfig, RoomEvent, RoomEvents, RoomInfo, Transport,
    TransportEvent, TransportMessage, User, WsConnector,
};
use tokio::time::{timeout, Duration};

fn room_info(user: &str) -> RoomInfo {
    RoomInfo {
        room_id: "design-review".into(),
        project_id: "tandem".into(),
        local_user: User::with_id(user, user.to_uppercase()),
    }
}

fn fast_config() -> RoomConfig {
    RoomConfig {
        reconnect_interval: 50,
        timeout: 2_000,
        ..RoomConfig::default()
    }
}

async fn join(relay: &Relay, user: &str) -> (Room, RoomEvents) {
    let room = Room::with_websocket(&relay.url(), room_info(user), fast_config());
    let events = room.events();
    room.connect().await.unwrap();
    (room, events)
}

async fn wait_for<F: Fn(&RoomEvent) -> bool>(events: &mut RoomEvents, pred: F) -> RoomEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("room alive");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event within timeout")
}

#[tokio::test]
async fn test_room_connects_to_relay() {
    let relay = Relay::start().await;
    let (room, mut events) = join(&relay, "alice").await;

    assert!(room.is_online());
    assert_eq!(events.recv().await, Some(RoomEvent::Connected));
    assert!(matches!(events.recv().await, Some(RoomEvent::UserJoined(u)) if u.id == "alice"));
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let relay = Relay::start().await;
    let (alice, _alice_events) = join(&relay, "alice").await;
    let (bob, mut bob_events) = join(&relay, "bob").await;
    wait_for(&mut bob_events, |e| matches!(e, RoomEvent::Connected)).await;

    let a = alice.open_document("notes", "hello").unwrap();
    let b = bob.open_document("notes", "hello").unwrap();

    a.insert(5, " world").unwrap();
    assert_eq!(a.content().unwrap(), "hello world");
    b.delete(0, 5).unwrap();

    assert!(
        eventually(|| a.content().unwrap() == " world" && b.content().unwrap() == " world").await,
        "replicas diverged: {:?} vs {:?}",
        a.content(),
        b.content()
    );
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let relay = Relay::start().await;
    let (alice, _alice_events) = join(&relay, "alice").await;
    let a = alice.open_document("notes", "").unwrap();
    a.insert(0, "written before bob arrived").unwrap();

    let bob = Room::with_websocket(&relay.url(), room_info("bob"), fast_config());
    let b = bob.open_document("notes", "").unwrap();
    bob.connect().await.unwrap();

    // Alice answers bob's join with her full state.
    assert!(eventually(|| b.content().unwrap() == "written before bob arrived").await);
}

#[tokio::test]
async fn test_presence_join_cursor_leave() {
    let relay = Relay::start().await;
    let (alice, mut alice_events) = join(&relay, "alice").await;
    let (bob, _bob_events) = join(&relay, "bob").await;

    let joined = wait_for(&mut alice_events, |e| {
        matches!(e, RoomEvent::UserJoined(u) if u.id == "bob")
    })
    .await;
    assert_eq!(joined, RoomEvent::UserJoined(User::with_id("bob", "BOB")));
    let ids: Vec<String> = alice.users().into_iter().map(|u| u.id).collect();
    assert_eq!(ids, vec!["alice", "bob"]);

    // Bob learns about alice from her presence reply.
    assert!(eventually(|| bob.presence("alice").is_some()).await);

    bob.update_cursor(CursorPosition {
        document_id: Some("notes".into()),
        offset: 3,
    });
    wait_for(&mut alice_events, |e| {
        matches!(e, RoomEvent::PresenceChanged { user_id, state }
            if user_id == "bob" && state.cursor.as_ref().map(|c| c.offset) == Some(3))
    })
    .await;

    bob.destroy();
    let left = wait_for(&mut alice_events, |e| matches!(e, RoomEvent::UserLeft { .. })).await;
    assert_eq!(
        left,
        RoomEvent::UserLeft {
            user_id: "bob".into()
        }
    );
    assert!(alice.presence("bob").is_none());
    assert!(bob.is_destroyed());
}

#[tokio::test]
async fn test_quiet_peer_outlives_idle_timeout() {
    let relay = Relay::start().await;
    let config = RoomConfig {
        idle_timeout: 300,
        ..fast_config()
    };
    let alice = Room::with_websocket(&relay.url(), room_info("alice"), config.clone());
    let mut alice_events = alice.events();
    alice.connect().await.unwrap();
    let bob = Room::with_websocket(&relay.url(), room_info("bob"), config);
    bob.connect().await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, RoomEvent::UserJoined(u) if u.id == "bob")).await;

    // Neither side edits or moves a cursor for three idle windows.
    tokio::time::sleep(Duration::from_millis(900)).await;

    let ids: Vec<String> = alice.users().into_iter().map(|u| u.id).collect();
    assert_eq!(ids, vec!["alice", "bob"]);
    assert!(bob.presence("alice").is_some());
    while let Some(event) = alice_events.try_recv() {
        assert!(!matches!(event, RoomEvent::UserLeft { .. }), "bob expired: {event:?}");
    }
}

#[tokio::test]
async fn test_offline_edits_arrive_after_reconnect() {
    let relay = Relay::start().await;
    let (alice, mut alice_events) = join(&relay, "alice").await;
    let (bob, mut bob_events) = join(&relay, "bob").await;
    let a = alice.open_document("notes", "base").unwrap();
    let b = bob.open_document("notes", "base").unwrap();

    relay.drop_connections();
    wait_for(&mut alice_events, |e| matches!(e, RoomEvent::Disconnected { clean: false })).await;
    wait_for(&mut bob_events, |e| matches!(e, RoomEvent::Disconnected { clean: false })).await;

    // Accepted locally while the link is down.
    a.insert(4, "!").unwrap();
    assert_eq!(a.content().unwrap(), "base!");

    wait_for(&mut alice_events, |e| matches!(e, RoomEvent::Connected)).await;
    wait_for(&mut bob_events, |e| matches!(e, RoomEvent::Connected)).await;

    assert!(eventually(|| b.content().unwrap() == "base!").await);
    assert!(alice.is_online() && bob.is_online());
}

#[tokio::test]
async fn test_reconnect_gives_up_when_relay_is_gone() {
    let relay = Relay::start().await;
    let config = RoomConfig {
        reconnect_interval: 10,
        max_reconnect_attempts: 2,
        ..RoomConfig::default()
    };
    let room = Room::with_websocket(&relay.url(), room_info("alice"), config);
    let mut events = room.events();
    room.connect().await.unwrap();

    relay.shutdown();

    let mut attempts = Vec::new();
    while attempts.len() < 2 {
        let event = wait_for(&mut events, |e| matches!(e, RoomEvent::Reconnecting { .. })).await;
        if let RoomEvent::Reconnecting { attempt, .. } = event {
            attempts.push(attempt);
        }
    }
    assert!(eventually(|| room.transport().state() == ConnectionState::Disconnected).await);

    assert_eq!(attempts, vec![1, 2]);
    assert!(!room.is_online());
}

#[tokio::test]
async fn test_raw_transport_relays_messages() {
    let relay = Relay::start().await;
    let url = Transport::room_url(&relay.url(), "raw");
    let config = RoomConfig::default().transport();
    let sender = Transport::new("raw", url.clone(), Arc::new(WsConnector::new()), config.clone());
    let receiver = Transport::new("raw", url, Arc::new(WsConnector::new()), config);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _sub = receiver.subscribe(move |event| {
        if let TransportEvent::Message(msg) = event {
            let _ = tx.send(msg.clone());
        }
    });

    receiver.connect().await.unwrap();
    sender.connect().await.unwrap();
    let update = TransportMessage::document_update("raw", "doc", vec![1, 2, 3]).unwrap();
    sender.send(update.clone());

    let got = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(got.kind, MessageType::DocumentUpdate);
    assert_eq!(got, update);
}
