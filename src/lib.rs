//! # scribble-collab — real-time collaboration core
//!
//! Multi-user document editing over a persistent binary channel: clients
//! join a named document room, exchange opaque CRDT frames, and the core
//! fans every frame out to all other participants (directly on this
//! instance, through a pub/sub bus to peer instances) while persisting
//! periodic snapshots.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐                                 ┌── Client C (peer instance)
//!            ├── Room (doc_id) ── Bus ── Room ─┤
//! Client B ──┘        │       room:<docId>     └── Client D
//!                     │
//!              SnapshotStore (RocksDB)
//!                     ▲
//!              RoomManager ── 30s ticker (snapshot solicitation,
//!                                         empty-room sweep)
//! ```
//!
//! The core never interprets payload bytes: frames are tagged by their
//! first byte and forwarded verbatim. Authoritative state lives in client
//! CRDT replicas and in the persisted snapshots.
//!
//! ## Modules
//!
//! - [`protocol`] — frame-kind tagging and the bus wire message
//! - [`transport`] — client channel abstraction (WebSocket, in-memory)
//! - [`bus`] — cross-instance pub/sub seam
//! - [`room`] — per-document broadcast hub
//! - [`manager`] — room directory and lifecycle policy
//! - [`server`] — accept loop and admission boundary
//! - [`storage`] — snapshot persistence

pub mod bus;
pub mod config;
pub mod manager;
pub mod protocol;
pub mod room;
pub mod server;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use bus::{Bus, BusError, NullBus, ProcessBus, Subscription, SubscriptionHandle};
pub use config::CollabConfig;
pub use manager::RoomManager;
pub use protocol::{room_channel, BusMessage, FrameKind, ProtocolError};
pub use room::Room;
pub use server::{AccessPolicy, AdmissionError, CollabServer, OpenAccess, ServerConfig, MAX_DOC_ID_LEN};
pub use storage::{
    MemorySnapshotStore, RocksSnapshotStore, SnapshotMetadata, SnapshotStore, StoreConfig,
    StoreError,
};
pub use transport::{memory_channel, ChannelError, ClientChannel, FrameSink, FrameStream, MemoryChannel, MemoryPeer, WsChannel};
