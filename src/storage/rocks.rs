//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots` — latest raw snapshot payload, keyed by document id
//! - `metadata`  — bincode [`SnapshotMetadata`] record per document
//!
//! Snapshots are opaque CRDT state; LZ4 block compression keeps them small
//! without the store knowing anything about their shape.

use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribble_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small cache, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Metadata stored alongside each snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Document id
    pub doc_id: String,
    /// Uncompressed payload size in bytes
    pub snapshot_size: u64,
    /// Number of times the snapshot has been replaced
    pub revision: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last replaced timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl SnapshotMetadata {
    fn new(doc_id: &str) -> Self {
        let now = epoch_secs();
        Self {
            doc_id: doc_id.to_string(),
            snapshot_size: 0,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The RocksDB snapshot store.
pub struct RocksSnapshotStore {
    db: DBWithThreadMode<SingleThreaded>,
    write_opts: WriteOptions,
}

impl RocksSnapshotStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_compression_type(DBCompressionType::Lz4);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, opts.clone()))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &opts,
            &config.path,
            cf_descriptors,
        )
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(config.sync_writes);

        Ok(Self { db, write_opts })
    }

    /// Metadata for a stored document, if any.
    pub fn metadata(&self, doc_id: &str) -> Result<Option<SnapshotMetadata>, StoreError> {
        let cf = self
            .db
            .cf_handle(CF_METADATA)
            .ok_or_else(|| StoreError::Database("missing metadata column family".to_string()))?;
        let bytes = self
            .db
            .get_cf(cf, doc_id.as_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))?;
        match bytes {
            Some(bytes) => Ok(Some(SnapshotMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SnapshotStore for RocksSnapshotStore {
    async fn save(&self, doc_id: &str, payload: &[u8]) -> Result<(), StoreError> {
        let snapshots = self
            .db
            .cf_handle(CF_SNAPSHOTS)
            .ok_or_else(|| StoreError::Database("missing snapshots column family".to_string()))?;
        let metadata_cf = self
            .db
            .cf_handle(CF_METADATA)
            .ok_or_else(|| StoreError::Database("missing metadata column family".to_string()))?;

        let mut meta = self
            .metadata(doc_id)?
            .unwrap_or_else(|| SnapshotMetadata::new(doc_id));
        meta.snapshot_size = payload.len() as u64;
        meta.revision += 1;
        meta.updated_at = epoch_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(snapshots, doc_id.as_bytes(), payload);
        batch.put_cf(metadata_cf, doc_id.as_bytes(), meta.encode()?);
        self.db
            .write_opt(batch, &self.write_opts)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn load(&self, doc_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self
            .db
            .cf_handle(CF_SNAPSHOTS)
            .ok_or_else(|| StoreError::Database("missing snapshots column family".to_string()))?;
        self.db
            .get_cf(cf, doc_id.as_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}
