//! Per-document broadcast hub.
//!
//! A room owns the local client set for one document and four duties:
//! fan out every inbound frame to the other local clients, publish it on
//! the bus for peer instances, apply inbound bus traffic with echo
//! suppression, and persist snapshot frames.
//!
//! ```text
//! client A ──┐                        ┌── client B (same instance)
//!            ├── Room (doc_id) ───────┤
//! bus in  ───┘        │               └── bus out (room:<docId>)
//!                     └── SnapshotStore
//! ```
//!
//! Each client's read loop runs inline in the task that joined it; the bus
//! subscription runs on its own task holding only a weak reference, so a
//! dropped room tears its subscription down with it.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rand::RngCore;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::bus::{Bus, SubscriptionHandle};
use crate::config::CollabConfig;
use crate::protocol::{room_channel, BusMessage, FrameKind, BUS_BROADCAST};
use crate::storage::SnapshotStore;
use crate::transport::{ChannelError, ClientChannel, FrameSink, FrameStream};

type OnEmpty = Arc<dyn Fn(String) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Generate a fresh connection tag: `bytes` random bytes, hex-encoded.
///
/// Tags only need to be distinct within one room on one instance for a
/// connection's lifetime; 8 random bytes clear that bar without any
/// coordination.
pub(crate) fn connection_tag(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    let mut tag = String::with_capacity(bytes * 2);
    for b in &buf {
        let _ = write!(tag, "{b:02x}");
    }
    tag
}

#[derive(Default)]
struct BusSubscriptionState {
    handle: Option<SubscriptionHandle>,
    task: Option<JoinHandle<()>>,
    /// Bumped on every cancel/respawn; a subscribe that completes for a
    /// superseded generation cancels itself instead of installing a stale
    /// handle.
    generation: u64,
}

/// The per-document broadcast hub.
pub struct Room {
    doc_id: String,
    config: CollabConfig,
    store: Arc<dyn SnapshotStore>,
    bus: Arc<dyn Bus>,
    /// Connection tag → write half. Guarded reader-preferring; fan-out
    /// holds the read side, membership changes the write side.
    clients: RwLock<HashMap<String, Arc<dyn FrameSink>>>,
    on_empty: Mutex<Option<OnEmpty>>,
    bus_sub: Mutex<BusSubscriptionState>,
}

impl Room {
    /// Create a room and open its bus subscription.
    pub fn new(
        doc_id: impl Into<String>,
        config: CollabConfig,
        store: Arc<dyn SnapshotStore>,
        bus: Arc<dyn Bus>,
    ) -> Arc<Self> {
        let room = Arc::new(Self {
            doc_id: doc_id.into(),
            config,
            store,
            bus,
            clients: RwLock::new(HashMap::new()),
            on_empty: Mutex::new(None),
            bus_sub: Mutex::new(BusSubscriptionState::default()),
        });
        room.ensure_bus_subscription();
        room
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Register a callback invoked (on a fresh task) each time the last
    /// client departs.
    pub fn set_on_empty(&self, callback: impl Fn(String) + Send + Sync + 'static) {
        *lock(&self.on_empty) = Some(Arc::new(callback));
    }

    /// Number of registered clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Register a client under a fresh connection tag and drive its read
    /// loop inline until the channel closes or errors.
    pub async fn add_client(self: Arc<Self>, channel: Box<dyn ClientChannel>) {
        let (mut stream, sink) = channel.split();
        let conn_id = connection_tag(self.config.connection_tag_bytes);
        {
            let mut clients = self.clients.write().await;
            // A drain that lost the removal race leaves the room live but
            // unsubscribed; re-admission restores the subscription.
            self.ensure_bus_subscription();
            clients.insert(conn_id.clone(), sink);
        }
        log::info!("Client {conn_id} joined room {}", self.doc_id);

        self.listen_to_client(&conn_id, stream.as_mut()).await;
        self.remove_client(&conn_id).await;
    }

    async fn listen_to_client(&self, conn_id: &str, stream: &mut dyn FrameStream) {
        loop {
            let frame = match stream.next_frame().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    log::error!("Read error in room {}: {e}", self.doc_id);
                    return;
                }
                None => return,
            };
            if frame.is_empty() {
                continue;
            }

            self.broadcast_local(&frame, Some(conn_id)).await;
            self.publish_to_bus(&frame, conn_id).await;

            if frame[0] == FrameKind::Snapshot as u8 {
                let payload = &frame[1..];
                match self.store.save(&self.doc_id, payload).await {
                    Ok(()) => {
                        self.send_to_client(conn_id, &FrameKind::SnapshotAckOk.frame())
                            .await;
                    }
                    Err(e) => {
                        log::error!(
                            "Failed to save snapshot for room {}: {e} ({} payload bytes)",
                            self.doc_id,
                            payload.len()
                        );
                        self.send_to_client(conn_id, &FrameKind::SnapshotAckFail.frame())
                            .await;
                    }
                }
            }
        }
    }

    /// Write `data` to every registered client except `exclude`.
    ///
    /// Writes run under the client-set read lock with the configured
    /// deadline; clients whose write fails or times out are removed after
    /// the lock is released.
    pub async fn broadcast_local(&self, data: &[u8], exclude: Option<&str>) {
        let mut failed = Vec::new();
        {
            let clients = self.clients.read().await;
            for (id, sink) in clients.iter() {
                if exclude == Some(id.as_str()) {
                    continue;
                }
                if let Err(e) = self.write_frame(sink, data).await {
                    log::debug!("Write to client {id} in room {} failed: {e}", self.doc_id);
                    failed.push(id.clone());
                }
            }
        }
        for id in failed {
            self.remove_client(&id).await;
        }
    }

    /// Ask every local client for a fresh snapshot.
    pub async fn request_snapshots(&self) {
        self.broadcast_local(&FrameKind::RequestSnapshot.frame(), None)
            .await;
    }

    async fn send_to_client(&self, conn_id: &str, data: &[u8]) {
        let sink = self.clients.read().await.get(conn_id).cloned();
        let Some(sink) = sink else { return };
        if let Err(e) = self.write_frame(&sink, data).await {
            log::debug!("Write to client {conn_id} in room {} failed: {e}", self.doc_id);
            self.remove_client(conn_id).await;
        }
    }

    async fn write_frame(&self, sink: &Arc<dyn FrameSink>, data: &[u8]) -> Result<(), ChannelError> {
        match timeout(self.config.client_write_deadline, sink.send_frame(data)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::WriteTimeout),
        }
    }

    async fn publish_to_bus(&self, data: &[u8], sender_id: &str) {
        let msg = BusMessage::broadcast(&self.doc_id, data.to_vec(), sender_id);
        let payload = match msg.encode() {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to encode bus message: {e}");
                return;
            }
        };
        if let Err(e) = self.bus.publish(&room_channel(&self.doc_id), &payload).await {
            log::error!("Failed to publish to bus: {e}");
        }
    }

    async fn handle_bus_message(&self, payload: &[u8]) {
        let msg = match BusMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                log::error!("Malformed bus message for room {}: {e}", self.doc_id);
                return;
            }
        };
        if msg.kind != BUS_BROADCAST {
            return;
        }
        // A sender tag registered here means this is the loop-back copy of
        // our own publish; local fan-out already delivered it.
        if self.is_local_sender(&msg.sender_id).await {
            return;
        }
        self.broadcast_local(&msg.data, Some(&msg.sender_id)).await;
    }

    async fn is_local_sender(&self, sender_id: &str) -> bool {
        self.clients.read().await.contains_key(sender_id)
    }

    /// Remove a client and close its channel. Removing an unknown tag is a
    /// no-op. When the last client departs the bus subscription is
    /// cancelled and the on-empty callback fires on a fresh task.
    pub async fn remove_client(&self, conn_id: &str) {
        let removed = {
            let mut clients = self.clients.write().await;
            let removed = clients.remove(conn_id);
            if removed.is_some() && clients.is_empty() {
                // Decided under the write lock so a concurrent re-join
                // cannot lose its subscription to this drain.
                self.cancel_bus_subscription();
            }
            removed.map(|sink| (sink, clients.is_empty()))
        };
        let Some((sink, now_empty)) = removed else {
            return;
        };
        sink.close().await;
        log::info!("Client {conn_id} left room {}", self.doc_id);

        if now_empty {
            let callback = lock(&self.on_empty).clone();
            if let Some(callback) = callback {
                let doc_id = self.doc_id.clone();
                tokio::spawn(async move {
                    callback(doc_id);
                });
            }
        }
    }

    /// Spawn the bus subscription task unless one is already running.
    fn ensure_bus_subscription(self: &Arc<Self>) {
        let mut state = lock(&self.bus_sub);
        if state.task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        state.handle = None;
        state.generation += 1;
        let generation = state.generation;

        let weak = Arc::downgrade(self);
        let bus = self.bus.clone();
        let doc_id = self.doc_id.clone();
        state.task = Some(tokio::spawn(async move {
            Self::run_bus_loop(weak, bus, doc_id, generation).await;
        }));
    }

    async fn run_bus_loop(weak: Weak<Room>, bus: Arc<dyn Bus>, doc_id: String, generation: u64) {
        let channel = room_channel(&doc_id);
        let mut sub = match bus.subscribe(&channel).await {
            Ok(sub) => sub,
            Err(e) => {
                log::error!("Bus subscribe failed for {channel}: {e}; continuing without cross-instance fan-out");
                return;
            }
        };
        match weak.upgrade() {
            Some(room) => {
                let mut state = lock(&room.bus_sub);
                if state.generation != generation {
                    // Cancelled while the subscribe was in flight
                    sub.handle().cancel();
                    return;
                }
                state.handle = Some(sub.handle());
            }
            None => {
                sub.handle().cancel();
                return;
            }
        }

        while let Some(payload) = sub.recv().await {
            let Some(room) = weak.upgrade() else { break };
            room.handle_bus_message(&payload).await;
        }
        log::debug!("Bus subscription for {channel} ended");
    }

    fn cancel_bus_subscription(&self) {
        let mut state = lock(&self.bus_sub);
        state.generation += 1;
        if let Some(handle) = state.handle.take() {
            handle.cancel();
        }
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        self.cancel_bus_subscription();
    }
}
