//! In-memory snapshot store for tests and single-node development.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{SnapshotStore, StoreError};

/// Snapshot store backed by a process-local map.
#[derive(Default)]
pub struct MemorySnapshotStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Whether a snapshot exists for `doc_id`.
    pub async fn contains(&self, doc_id: &str) -> bool {
        self.entries.read().await.contains_key(doc_id)
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, doc_id: &str, payload: &[u8]) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(doc_id.to_string(), payload.to_vec());
        Ok(())
    }

    async fn load(&self, doc_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().await.get(doc_id).cloned())
    }
}
