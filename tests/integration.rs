//! End-to-end tests for room fan-out, persistence, and lifecycle.
//!
//! Most tests drive the core over in-memory channels; the last ones start a
//! real WebSocket server and connect real clients.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use scribble_collab::bus::{Bus, ProcessBus};
use scribble_collab::protocol::BusMessage;
use scribble_collab::server::{CollabServer, OpenAccess, ServerConfig};
use scribble_collab::storage::{MemorySnapshotStore, SnapshotStore, StoreError};
use scribble_collab::transport::{memory_channel, MemoryPeer};
use scribble_collab::{CollabConfig, NullBus, RoomManager};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

/// Config with the snapshot ticker far away so fan-out assertions see only
/// frames the test itself produces.
fn quiet_config() -> CollabConfig {
    CollabConfig {
        snapshot_request_interval: Duration::from_secs(600),
        ..CollabConfig::for_testing()
    }
}

fn new_manager(store: Arc<dyn SnapshotStore>, bus: Arc<dyn Bus>) -> Arc<RoomManager> {
    RoomManager::new(quiet_config(), store, bus)
}

async fn join_peer(manager: &Arc<RoomManager>, doc_id: &str) -> MemoryPeer {
    let (channel, peer) = memory_channel(32);
    manager.join(doc_id, Box::new(channel)).await;
    // Hand-off to the room runs on a spawned task
    sleep(Duration::from_millis(30)).await;
    peer
}

async fn recv_frame(peer: &mut MemoryPeer) -> Vec<u8> {
    timeout(Duration::from_secs(2), peer.recv())
        .await
        .expect("frame should arrive")
        .expect("channel should stay open")
}

async fn assert_silent(peer: &mut MemoryPeer) {
    let result = timeout(Duration::from_millis(150), peer.recv()).await;
    assert!(result.is_err(), "expected no frame, got {:?}", result);
}

/// Store double that counts saves.
struct CountingStore {
    inner: MemorySnapshotStore,
    saves: AtomicUsize,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: MemorySnapshotStore::new(),
            saves: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SnapshotStore for CountingStore {
    async fn save(&self, doc_id: &str, payload: &[u8]) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(doc_id, payload).await
    }

    async fn load(&self, doc_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.load(doc_id).await
    }
}

/// Store double whose saves always fail.
struct FailingStore;

#[async_trait]
impl SnapshotStore for FailingStore {
    async fn save(&self, _doc_id: &str, _payload: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::Database("injected failure".to_string()))
    }

    async fn load(&self, _doc_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_single_instance_fan_out() {
    let manager = new_manager(Arc::new(MemorySnapshotStore::new()), Arc::new(NullBus));

    let mut p1 = join_peer(&manager, "D1").await;
    let mut p2 = join_peer(&manager, "D1").await;

    p1.send(vec![0x01, 0xAA, 0xBB]).await.unwrap();

    assert_eq!(recv_frame(&mut p2).await, vec![0x01, 0xAA, 0xBB]);
    // The sender never sees its own frame
    assert_silent(&mut p1).await;
}

#[tokio::test]
async fn test_empty_frames_are_ignored() {
    let manager = new_manager(Arc::new(MemorySnapshotStore::new()), Arc::new(NullBus));

    let mut p1 = join_peer(&manager, "D1").await;
    let mut p2 = join_peer(&manager, "D1").await;

    p1.send(Vec::new()).await.unwrap();
    assert_silent(&mut p2).await;
}

#[tokio::test]
async fn test_opaque_payloads_fan_out_verbatim() {
    let manager = new_manager(Arc::new(MemorySnapshotStore::new()), Arc::new(NullBus));

    let mut p1 = join_peer(&manager, "D1").await;
    let mut p2 = join_peer(&manager, "D1").await;

    // Awareness, control, and even unknown-tag frames travel untouched
    for frame in [
        vec![0x10, b'{', b'}'],
        vec![0x11, 1, 2, 3],
        vec![0x7F, 0xFF],
    ] {
        p1.send(frame.clone()).await.unwrap();
        assert_eq!(recv_frame(&mut p2).await, frame);
    }
}

#[tokio::test]
async fn test_snapshot_persists_and_acks_sender_only() {
    let store = Arc::new(CountingStore::new());
    let manager = new_manager(store.clone(), Arc::new(NullBus));

    let mut p1 = join_peer(&manager, "D1").await;
    let mut p2 = join_peer(&manager, "D1").await;

    p1.send(vec![0x02, 0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();

    // Peers get the frame verbatim, kind byte included
    assert_eq!(recv_frame(&mut p2).await, vec![0x02, 0xDE, 0xAD, 0xBE, 0xEF]);
    // The sender alone gets the ack
    assert_eq!(recv_frame(&mut p1).await, vec![0x22]);
    assert_silent(&mut p2).await;

    // Persisted with the kind byte stripped, exactly once
    assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    assert_eq!(
        store.load("D1").await.unwrap(),
        Some(vec![0xDE, 0xAD, 0xBE, 0xEF])
    );
}

#[tokio::test]
async fn test_snapshot_failure_acks_failure_and_keeps_room_alive() {
    let manager = new_manager(Arc::new(FailingStore), Arc::new(NullBus));

    let mut p1 = join_peer(&manager, "D1").await;
    let mut p2 = join_peer(&manager, "D1").await;

    p1.send(vec![0x02, 0x01]).await.unwrap();

    assert_eq!(recv_frame(&mut p2).await, vec![0x02, 0x01]);
    assert_eq!(recv_frame(&mut p1).await, vec![0x21]);

    // The room keeps serving after the failure
    p1.send(vec![0x01, 0x05]).await.unwrap();
    assert_eq!(recv_frame(&mut p2).await, vec![0x01, 0x05]);
    assert_eq!(manager.room_count().await, 1);
}

#[tokio::test]
async fn test_cross_instance_fan_out_with_echo_suppression() {
    let bus = Arc::new(ProcessBus::default());
    let s1 = new_manager(Arc::new(MemorySnapshotStore::new()), bus.clone());
    let s2 = new_manager(Arc::new(MemorySnapshotStore::new()), bus.clone());

    let mut c1 = join_peer(&s1, "D2").await;
    let mut c2 = join_peer(&s2, "D2").await;

    // Probe subscription observing the publishes themselves
    let mut probe = bus.subscribe("room:D2").await.unwrap();

    c1.send(vec![0x01, 0x01]).await.unwrap();

    // Exactly one publish, carrying the frame and a 16-hex sender tag
    let published = timeout(Duration::from_secs(2), probe.recv())
        .await
        .expect("publish should be observed")
        .expect("probe should stay subscribed");
    let msg = BusMessage::decode(&published).unwrap();
    assert_eq!(msg.kind, "broadcast");
    assert_eq!(msg.doc_id, "D2");
    assert_eq!(msg.data, vec![0x01, 0x01]);
    assert_eq!(msg.sender_id.len(), 16);
    assert!(msg.sender_id.chars().all(|c| c.is_ascii_hexdigit()));
    let no_more = timeout(Duration::from_millis(150), probe.recv()).await;
    assert!(no_more.is_err(), "only one publish expected");

    // The peer instance delivers; the originating client hears nothing
    assert_eq!(recv_frame(&mut c2).await, vec![0x01, 0x01]);
    assert_silent(&mut c1).await;
}

#[tokio::test]
async fn test_cross_instance_is_not_republished() {
    let bus = Arc::new(ProcessBus::default());
    let s1 = new_manager(Arc::new(MemorySnapshotStore::new()), bus.clone());
    let s2 = new_manager(Arc::new(MemorySnapshotStore::new()), bus.clone());

    let mut c1 = join_peer(&s1, "D2").await;
    let mut c2a = join_peer(&s2, "D2").await;
    let mut c2b = join_peer(&s2, "D2").await;

    c1.send(vec![0x01, 0x42]).await.unwrap();

    // Both peer-instance clients get exactly one copy each
    assert_eq!(recv_frame(&mut c2a).await, vec![0x01, 0x42]);
    assert_eq!(recv_frame(&mut c2b).await, vec![0x01, 0x42]);
    assert_silent(&mut c2a).await;
    assert_silent(&mut c2b).await;
    assert_silent(&mut c1).await;
}

#[tokio::test]
async fn test_local_clients_receive_once_despite_bus_echo() {
    // Two local clients plus a shared bus: the loop-back copy of the
    // publish must not double-deliver to the non-sender.
    let bus = Arc::new(ProcessBus::default());
    let manager = new_manager(Arc::new(MemorySnapshotStore::new()), bus);

    let mut p1 = join_peer(&manager, "D2").await;
    let mut p2 = join_peer(&manager, "D2").await;

    p1.send(vec![0x01, 0x07]).await.unwrap();

    assert_eq!(recv_frame(&mut p2).await, vec![0x01, 0x07]);
    assert_silent(&mut p2).await;
    assert_silent(&mut p1).await;
}

#[tokio::test]
async fn test_malformed_bus_message_is_skipped() {
    let bus = Arc::new(ProcessBus::default());
    let manager = new_manager(Arc::new(MemorySnapshotStore::new()), bus.clone());

    let mut p1 = join_peer(&manager, "D2").await;

    bus.publish("room:D2", b"not json at all").await.unwrap();
    assert_silent(&mut p1).await;

    // A well-formed peer message still goes through afterwards
    let good = BusMessage::broadcast("D2", vec![0x01, 0x09], "ffffffffffffffff");
    bus.publish("room:D2", &good.encode().unwrap()).await.unwrap();
    assert_eq!(recv_frame(&mut p1).await, vec![0x01, 0x09]);
}

#[tokio::test]
async fn test_room_teardown_and_fresh_join() {
    let bus = Arc::new(ProcessBus::default());
    let manager = new_manager(Arc::new(MemorySnapshotStore::new()), bus.clone());

    let p1 = join_peer(&manager, "D3").await;
    assert_eq!(manager.room_count().await, 1);
    assert_eq!(bus.subscriber_count("room:D3"), 1);

    p1.disconnect();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(manager.room_count().await, 0);
    assert_eq!(bus.subscriber_count("room:D3"), 0);

    // A later join builds a fresh room with a fresh subscription
    let _p2 = join_peer(&manager, "D3").await;
    assert_eq!(manager.room_count().await, 1);
    assert_eq!(bus.subscriber_count("room:D3"), 1);
}

#[tokio::test]
async fn test_periodic_snapshot_request_reaches_every_client() {
    let manager = RoomManager::new(
        CollabConfig::for_testing(),
        Arc::new(MemorySnapshotStore::new()),
        Arc::new(NullBus),
    );

    let mut p1 = join_peer(&manager, "D4").await;
    let mut p2 = join_peer(&manager, "D4").await;

    assert_eq!(recv_frame(&mut p1).await, vec![0x20]);
    assert_eq!(recv_frame(&mut p2).await, vec![0x20]);
}

#[tokio::test]
async fn test_empty_room_swept_by_ticker() {
    let bus = Arc::new(ProcessBus::default());
    let manager = RoomManager::new(
        CollabConfig::for_testing(),
        Arc::new(MemorySnapshotStore::new()),
        bus,
    );

    let p1 = join_peer(&manager, "D4").await;
    p1.disconnect();

    // Removal may happen via on-empty or the ticker sweep; either way the
    // room is gone shortly after the grace period.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.room_count().await, 0);
}

#[tokio::test]
async fn test_empty_with_racing_join_lands_in_live_room() {
    let bus = Arc::new(ProcessBus::default());
    let manager = new_manager(Arc::new(MemorySnapshotStore::new()), bus.clone());

    let p1 = join_peer(&manager, "D5").await;
    // Disconnect and immediately join again, racing the removal path
    p1.disconnect();
    let (channel, mut p2) = memory_channel(32);
    manager.join("D5", Box::new(channel)).await;

    sleep(Duration::from_millis(200)).await;

    // Exactly one live room, the new client registered in it, with a live
    // bus subscription
    assert_eq!(manager.room_count().await, 1);
    assert_eq!(manager.client_count("D5").await, Some(1));
    assert_eq!(bus.subscriber_count("room:D5"), 1);

    // And the room actually works: a peer message reaches the new client
    let peer_msg = BusMessage::broadcast("D5", vec![0x01, 0x33], "eeeeeeeeeeeeeeee");
    bus.publish("room:D5", &peer_msg.encode().unwrap())
        .await
        .unwrap();
    assert_eq!(recv_frame(&mut p2).await, vec![0x01, 0x33]);
}

#[tokio::test]
async fn test_slow_client_is_dropped_others_keep_receiving() {
    let manager = RoomManager::new(
        CollabConfig {
            client_write_deadline: Duration::from_millis(100),
            ..quiet_config()
        },
        Arc::new(MemorySnapshotStore::new()),
        Arc::new(NullBus),
    );

    let mut p1 = join_peer(&manager, "D6").await;
    // Tiny buffer and a peer that never reads: writes stall into the
    // deadline once the buffer fills
    let (channel, _stuck) = memory_channel(1);
    manager.join("D6", Box::new(channel)).await;
    sleep(Duration::from_millis(30)).await;
    let mut p3 = join_peer(&manager, "D6").await;
    assert_eq!(manager.client_count("D6").await, Some(3));

    for i in 0..3 {
        p1.send(vec![0x01, i]).await.unwrap();
    }

    // The healthy receiver sees everything
    for i in 0..3 {
        assert_eq!(recv_frame(&mut p3).await, vec![0x01, i]);
    }

    // The stalled client is eventually removed; the others stay
    sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.client_count("D6").await, Some(2));
}

// --- WebSocket end-to-end ---

async fn start_ws_server() -> (u16, Arc<MemorySnapshotStore>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let store = Arc::new(MemorySnapshotStore::new());
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        collab: quiet_config(),
    };
    let server = CollabServer::new(config, store.clone(), Arc::new(NullBus), Arc::new(OpenAccess));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    sleep(Duration::from_millis(50)).await;
    (port, store)
}

fn ws_request(port: u16, doc_id: &str, caller: Option<&str>) -> tokio_tungstenite::tungstenite::handshake::client::Request {
    let mut request = format!("ws://127.0.0.1:{port}/ws/{doc_id}")
        .into_client_request()
        .unwrap();
    if let Some(caller) = caller {
        request
            .headers_mut()
            .insert("authorization", format!("Bearer {caller}").parse().unwrap());
    }
    request
}

#[tokio::test]
async fn test_ws_clients_collaborate() {
    let (port, store) = start_ws_server().await;

    let (mut ws1, _) = tokio_tungstenite::connect_async(ws_request(port, "doc-ws", Some("alice")))
        .await
        .unwrap();
    let (mut ws2, _) = tokio_tungstenite::connect_async(ws_request(port, "doc-ws", Some("bob")))
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    ws1.send(Message::Binary(vec![0x01, 0xAB].into()))
        .await
        .unwrap();

    let received = timeout(Duration::from_secs(2), ws2.next())
        .await
        .expect("frame should arrive")
        .expect("stream should stay open")
        .unwrap();
    match received {
        Message::Binary(data) => assert_eq!(Vec::from(data), vec![0x01, 0xAB]),
        other => panic!("expected binary frame, got {other:?}"),
    }

    // Snapshot over the wire persists and acks
    ws1.send(Message::Binary(vec![0x02, 0x11, 0x22].into()))
        .await
        .unwrap();
    let ack = timeout(Duration::from_secs(2), ws1.next())
        .await
        .expect("ack should arrive")
        .expect("stream should stay open")
        .unwrap();
    match ack {
        Message::Binary(data) => assert_eq!(Vec::from(data), vec![0x22]),
        other => panic!("expected ack frame, got {other:?}"),
    }
    assert_eq!(store.load("doc-ws").await.unwrap(), Some(vec![0x11, 0x22]));
}

#[tokio::test]
async fn test_ws_rejects_missing_identity() {
    let (port, _store) = start_ws_server().await;

    let (mut ws, _) = tokio_tungstenite::connect_async(ws_request(port, "doc-ws", None))
        .await
        .unwrap();

    // The server closes the channel without admitting the client
    let outcome = timeout(Duration::from_secs(2), ws.next()).await.unwrap();
    match outcome {
        None | Some(Ok(Message::Close(_))) => {}
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ws_rejects_bad_doc_id() {
    let (port, _store) = start_ws_server().await;

    let long_id = "x".repeat(60);
    let result =
        tokio_tungstenite::connect_async(ws_request(port, &long_id, Some("alice"))).await;
    assert!(result.is_err(), "upgrade should be refused");
}
