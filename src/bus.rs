//! Cross-instance pub/sub seam.
//!
//! Peer server instances form one logical broadcast domain by sharing a bus:
//! every frame a room fans out locally is also published on `room:<docId>`,
//! and every instance's room subscribes to the same channel. Delivery is
//! best-effort at-most-once with no cross-publisher ordering; the CRDT layer
//! above reconciles anything a dropped message misses.
//!
//! The core only depends on the [`Bus`] trait. [`ProcessBus`] links rooms
//! (or whole managers) inside one process and is what tests run against;
//! [`NullBus`] is single-instance mode. A broker-backed adapter implements
//! the same trait out of tree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Bus errors.
#[derive(Debug, Clone)]
pub enum BusError {
    /// Publish failed; the message is dropped
    Publish(String),
    /// Subscribe failed; the room runs in single-instance mode
    Subscribe(String),
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Publish(e) => write!(f, "Bus publish error: {e}"),
            Self::Subscribe(e) => write!(f, "Bus subscribe error: {e}"),
        }
    }
}

impl std::error::Error for BusError {}

/// Cross-instance publish/subscribe.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Deliver `payload` to every current subscriber of `channel` on any
    /// instance. Best-effort at-most-once; the bus may echo to the
    /// publisher's own subscription.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BusError>;

    /// Open a subscription to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError>;
}

/// A live subscription to a bus channel.
pub struct Subscription {
    rx: mpsc::Receiver<Vec<u8>>,
    handle: SubscriptionHandle,
}

impl Subscription {
    /// Assemble a subscription from a message stream and its canceller.
    /// Bus implementations call this; consumers only receive.
    pub fn new(rx: mpsc::Receiver<Vec<u8>>, canceller: Arc<dyn CancelSubscription>) -> Self {
        Self {
            rx,
            handle: SubscriptionHandle { inner: canceller },
        }
    }

    /// Next message on the channel; `None` once the subscription is
    /// cancelled (or the bus itself went away).
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// A handle that cancels this subscription from elsewhere.
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }
}

/// Cancels a subscription; detaches the subscriber and releases its slot.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<dyn CancelSubscription>,
}

impl SubscriptionHandle {
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

/// Implementation side of [`SubscriptionHandle`]. Must be idempotent.
pub trait CancelSubscription: Send + Sync {
    fn cancel(&self);
}

type Registry = Mutex<HashMap<String, HashMap<u64, mpsc::Sender<Vec<u8>>>>>;

fn lock_registry(registry: &Registry) -> MutexGuard<'_, HashMap<String, HashMap<u64, mpsc::Sender<Vec<u8>>>>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process bus: a registry of channel → subscriber queues.
///
/// Every subscriber gets an independent bounded queue of `capacity`
/// messages; a full queue drops the message for that subscriber only.
/// Closed subscribers are pruned on the next publish.
pub struct ProcessBus {
    registry: Arc<Registry>,
    next_id: AtomicU64,
    capacity: usize,
}

impl ProcessBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            capacity,
        }
    }

    /// Number of live subscribers on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        lock_registry(&self.registry)
            .get(channel)
            .map_or(0, |subs| subs.len())
    }
}

impl Default for ProcessBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Bus for ProcessBus {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BusError> {
        let subscribers: Vec<(u64, mpsc::Sender<Vec<u8>>)> = lock_registry(&self.registry)
            .get(channel)
            .map(|subs| subs.iter().map(|(id, tx)| (*id, tx.clone())).collect())
            .unwrap_or_default();

        let mut closed = Vec::new();
        for (id, tx) in subscribers {
            match tx.try_send(payload.to_vec()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::debug!("Bus subscriber lagging on {channel}, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }

        if !closed.is_empty() {
            let mut registry = lock_registry(&self.registry);
            if let Some(subs) = registry.get_mut(channel) {
                for id in closed {
                    subs.remove(&id);
                }
                if subs.is_empty() {
                    registry.remove(channel);
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock_registry(&self.registry)
            .entry(channel.to_string())
            .or_default()
            .insert(id, tx);

        let canceller = Arc::new(ProcessUnsubscriber {
            registry: Arc::downgrade(&self.registry),
            channel: channel.to_string(),
            id,
        });
        Ok(Subscription::new(rx, canceller))
    }
}

struct ProcessUnsubscriber {
    registry: Weak<Registry>,
    channel: String,
    id: u64,
}

impl CancelSubscription for ProcessUnsubscriber {
    fn cancel(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = lock_registry(&registry);
        if let Some(subs) = registry.get_mut(&self.channel) {
            subs.remove(&self.id);
            if subs.is_empty() {
                registry.remove(&self.channel);
            }
        }
    }
}

/// Bus for single-instance deployments: publishes vanish, subscriptions
/// stay silent until cancelled.
pub struct NullBus;

#[async_trait]
impl Bus for NullBus {
    async fn publish(&self, _channel: &str, _payload: &[u8]) -> Result<(), BusError> {
        Ok(())
    }

    async fn subscribe(&self, _channel: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(1);
        let canceller = Arc::new(NullUnsubscriber {
            keepalive: Mutex::new(Some(tx)),
        });
        Ok(Subscription::new(rx, canceller))
    }
}

struct NullUnsubscriber {
    // Holding the sender keeps recv() pending; cancel drops it.
    keepalive: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl CancelSubscription for NullUnsubscriber {
    fn cancel(&self) {
        self.keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
