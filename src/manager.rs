//! Room directory and lifecycle policy.
//!
//! The manager is the only place rooms are created or deleted: clients are
//! admitted through `join` (create-on-first-join) and rooms leave through
//! `remove_room` (delete-when-empty, re-checked under the manager lock). A
//! background ticker solicits snapshots from every occupied room and sweeps
//! rooms that drained without being removed.
//!
//! Lock order is manager before room, always; the room's on-empty callback
//! re-enters the manager from a fresh task so neither side ever waits on
//! the other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::bus::Bus;
use crate::config::CollabConfig;
use crate::room::Room;
use crate::storage::SnapshotStore;
use crate::transport::ClientChannel;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Directory of live rooms for one server instance.
pub struct RoomManager {
    config: CollabConfig,
    store: Arc<dyn SnapshotStore>,
    bus: Arc<dyn Bus>,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

impl RoomManager {
    /// Create a manager and start its snapshot ticker.
    pub fn new(
        config: CollabConfig,
        store: Arc<dyn SnapshotStore>,
        bus: Arc<dyn Bus>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            store,
            bus,
            rooms: RwLock::new(HashMap::new()),
            tick_task: Mutex::new(None),
        });
        manager.spawn_snapshot_ticker();
        manager
    }

    /// Admit a connected channel into the room for `doc_id`, creating the
    /// room on first join. The channel is handed to the room on a spawned
    /// task; join itself returns promptly.
    pub async fn join(self: &Arc<Self>, doc_id: &str, channel: Box<dyn ClientChannel>) {
        let room = {
            let mut rooms = self.rooms.write().await;
            match rooms.get(doc_id) {
                Some(room) => room.clone(),
                None => {
                    let room = Room::new(
                        doc_id,
                        self.config.clone(),
                        self.store.clone(),
                        self.bus.clone(),
                    );
                    let weak = Arc::downgrade(self);
                    room.set_on_empty(move |doc_id| {
                        let Some(manager) = weak.upgrade() else { return };
                        tokio::spawn(async move {
                            manager.remove_room(&doc_id).await;
                        });
                    });
                    rooms.insert(doc_id.to_string(), room.clone());
                    log::info!("Created new room {doc_id}");
                    room
                }
            }
        };
        tokio::spawn(room.add_client(channel));
        log::info!("Client joining room {doc_id}");
    }

    /// Delete the room for `doc_id` iff it is still empty.
    ///
    /// Emptiness is re-verified under the manager lock: a join may have
    /// raced in between the room observing zero clients and this call.
    pub async fn remove_room(&self, doc_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            if room.client_count().await == 0 {
                rooms.remove(doc_id);
                log::info!("Removed empty room {doc_id}");
            }
        }
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Number of clients in the room for `doc_id`, if it exists.
    pub async fn client_count(&self, doc_id: &str) -> Option<usize> {
        let room = self.rooms.read().await.get(doc_id).cloned();
        match room {
            Some(room) => Some(room.client_count().await),
            None => None,
        }
    }

    fn spawn_snapshot_ticker(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.snapshot_request_interval;
        let grace = self.config.empty_room_grace;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                let rooms = manager.rooms.read().await;
                for (doc_id, room) in rooms.iter() {
                    if room.client_count().await > 0 {
                        log::debug!("Requesting snapshot from clients in {doc_id}");
                        room.request_snapshots().await;
                    } else {
                        // Drained room whose removal lost a race; sweep it
                        // after the grace period, re-checking emptiness.
                        let weak = weak.clone();
                        let doc_id = doc_id.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(grace).await;
                            if let Some(manager) = weak.upgrade() {
                                manager.remove_room(&doc_id).await;
                            }
                        });
                    }
                }
            }
        });
        *lock(&self.tick_task) = Some(task);
    }
}

impl Drop for RoomManager {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.tick_task).take() {
            task.abort();
        }
    }
}
