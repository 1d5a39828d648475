//! Snapshot persistence for collaborative documents.
//!
//! The core's contract is small: one record per document id, `save`
//! overwrites, failures are reported to the saving client and never kill the
//! room. [`RocksSnapshotStore`] is the durable implementation;
//! [`MemorySnapshotStore`] backs tests and single-node development.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;

pub use memory::MemorySnapshotStore;
pub use rocks::{RocksSnapshotStore, SnapshotMetadata, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend failure
    Database(String),
    /// Serialization failed
    Serialization(String),
    /// Deserialization failed
    Deserialization(String),
    /// I/O error
    Io(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {e}"),
            StoreError::Serialization(e) => write!(f, "Serialization error: {e}"),
            StoreError::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Durable snapshot storage, shared process-wide and safe for concurrent
/// use.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist the latest snapshot for `doc_id`, replacing any previous
    /// content. Idempotent at the persistence layer.
    async fn save(&self, doc_id: &str, payload: &[u8]) -> Result<(), StoreError>;

    /// Read back the stored snapshot, if any. The fan-out core never calls
    /// this; the document-fetch boundary does.
    async fn load(&self, doc_id: &str) -> Result<Option<Vec<u8>>, StoreError>;
}
