//! Content-addressed block storage
//!
//! `BlockStore` is the immutable blob layer documents are written to. Blocks
//! are keyed by their canonical (v1) CID string, so v0 and v1 forms of the
//! same CID address the same block. Two backends: RocksDB for nodes, and an
//! in-memory map for tests and embedding.

use async_trait::async_trait;
use cid::{Cid, Version};
use rocksdb::{Options, DB};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::codec::DAG_PB;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rocksdb::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A block with its CID and data
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub cid: Cid,
    pub data: Vec<u8>,
}

impl Block {
    pub fn new(cid: Cid, data: Vec<u8>) -> Self {
        Self { cid, data }
    }

    /// Get the size of the block in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Convert a CID to its canonical v1 form
///
/// CIDv0 always implies dag-pb + sha2-256, so the conversion cannot fail.
pub fn canonical_cid(cid: &Cid) -> Cid {
    match cid.version() {
        Version::V0 => Cid::new_v1(DAG_PB, *cid.hash()),
        Version::V1 => *cid,
    }
}

/// Immutable block storage addressed by CID
///
/// Writes are idempotent: storing the same block twice is a no-op.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Store a block under its own CID
    async fn put(&self, block: Block) -> Result<(), StorageError>;

    /// Retrieve block data, failing with `BlockNotFound` if absent
    async fn get(&self, cid: &Cid) -> Result<Vec<u8>, StorageError>;

    /// Check if a block exists
    async fn has(&self, cid: &Cid) -> Result<bool, StorageError>;

    /// Number of stored blocks, for health and metrics reporting
    async fn block_count(&self) -> usize;
}

/// RocksDB-backed persistent block storage
pub struct RocksBlockStore {
    db: Arc<DB>,
}

impl RocksBlockStore {
    /// Open (or create) a block store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        // Point lookups only (CID -> block)
        opts.optimize_for_point_lookup(64);
        opts.increase_parallelism(num_cpus::get() as i32);

        // Documents are small; compression buys nothing
        opts.set_compression_type(rocksdb::DBCompressionType::None);

        let db = DB::open(&opts, path.as_ref())?;

        info!("Opened RocksDB block store at {:?}", path.as_ref());
        Ok(Self { db: Arc::new(db) })
    }
}

fn join_error(e: tokio::task::JoinError) -> StorageError {
    StorageError::IoError(std::io::Error::other(e.to_string()))
}

#[async_trait]
impl BlockStore for RocksBlockStore {
    async fn put(&self, block: Block) -> Result<(), StorageError> {
        let key = canonical_cid(&block.cid).to_string();
        let size = block.size();
        let db = Arc::clone(&self.db);
        let log_key = key.clone();

        let written = tokio::task::spawn_blocking(move || {
            if db.get(&key)?.is_some() {
                return Ok::<bool, StorageError>(false);
            }
            db.put(&key, &block.data)?;
            Ok(true)
        })
        .await
        .map_err(join_error)??;

        if written {
            info!("Stored block {}, size: {} bytes", log_key, size);
        } else {
            debug!("Block already exists: {}", log_key);
        }
        Ok(())
    }

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>, StorageError> {
        let key = canonical_cid(cid).to_string();
        let db = Arc::clone(&self.db);
        let lookup = key.clone();

        tokio::task::spawn_blocking(move || db.get(&lookup))
            .await
            .map_err(join_error)??
            .ok_or(StorageError::BlockNotFound(key))
    }

    async fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
        let key = canonical_cid(cid).to_string();
        let db = Arc::clone(&self.db);

        let found = tokio::task::spawn_blocking(move || db.get(&key))
            .await
            .map_err(join_error)??;
        Ok(found.is_some())
    }

    async fn block_count(&self) -> usize {
        let db = Arc::clone(&self.db);

        match tokio::task::spawn_blocking(move || {
            db.iterator(rocksdb::IteratorMode::Start).flatten().count()
        })
        .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!("Block count task failed: {}", e);
                0
            }
        }
    }
}

/// Pointer records this node has published, by overlay key
///
/// Only the latest record per key is kept. They are re-announced to the
/// overlay when the node starts.
pub struct RecordJournal {
    db: Arc<DB>,
}

impl RecordJournal {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, path.as_ref())?;

        info!("Opened record journal at {:?}", path.as_ref());
        Ok(Self { db: Arc::new(db) })
    }

    /// Remember `record` as the current one under `key`
    pub async fn put(&self, key: &str, record: Vec<u8>) -> Result<(), StorageError> {
        let db = Arc::clone(&self.db);
        let key = key.to_string();

        tokio::task::spawn_blocking(move || db.put(key.as_bytes(), &record))
            .await
            .map_err(join_error)??;
        Ok(())
    }

    /// Every journaled `(key, record)` pair
    pub fn load(&self) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        self.db
            .iterator(rocksdb::IteratorMode::Start)
            .map(|item| {
                let (key, value) = item?;
                let key = String::from_utf8_lossy(&key).into_owned();
                Ok::<_, StorageError>((key, value.into_vec()))
            })
            .collect()
    }
}

/// In-memory block storage
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Cid, Vec<u8>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop a block, simulating content that was never replicated locally
    pub fn remove(&self, cid: &Cid) -> bool {
        self.blocks
            .write()
            .expect("lock poisoned")
            .remove(&canonical_cid(cid))
            .is_some()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn put(&self, block: Block) -> Result<(), StorageError> {
        let cid = canonical_cid(&block.cid);
        let mut blocks = self.blocks.write().expect("lock poisoned");
        blocks.entry(cid).or_insert(block.data);
        Ok(())
    }

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>, StorageError> {
        let cid = canonical_cid(cid);
        self.blocks
            .read()
            .expect("lock poisoned")
            .get(&cid)
            .cloned()
            .ok_or_else(|| StorageError::BlockNotFound(cid.to_string()))
    }

    async fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
        Ok(self
            .blocks
            .read()
            .expect("lock poisoned")
            .contains_key(&canonical_cid(cid)))
    }

    async fn block_count(&self) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecRegistry, MultihashHasher, DAG_CBOR, SHA2_256};

    fn block(data: &[u8]) -> Block {
        let cid = CodecRegistry::new()
            .cid_for(data, DAG_CBOR, SHA2_256)
            .unwrap();
        Block::new(cid, data.to_vec())
    }

    #[test]
    fn test_canonical_cid_upgrades_v0() {
        let digest = crate::codec::Sha2_256Hasher.digest(b"legacy");
        let v0 = Cid::new_v0(multihash::Multihash::wrap(SHA2_256, &digest).unwrap()).unwrap();
        let v1 = canonical_cid(&v0);

        assert_eq!(v1.version(), Version::V1);
        assert_eq!(v1.codec(), DAG_PB);
        assert_eq!(v1.hash(), v0.hash());
        assert_eq!(canonical_cid(&v1), v1);
    }

    #[tokio::test]
    async fn test_memory_put_get() {
        let store = MemoryBlockStore::new();
        let block = block(b"hello world");

        store.put(block.clone()).await.unwrap();
        assert_eq!(store.get(&block.cid).await.unwrap(), block.data);
        assert!(store.has(&block.cid).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_missing_block() {
        let store = MemoryBlockStore::new();
        let block = block(b"never stored");

        match store.get(&block.cid).await {
            Err(StorageError::BlockNotFound(_)) => {}
            other => panic!("Expected BlockNotFound, got {:?}", other),
        }
        assert!(!store.has(&block.cid).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_idempotent_put() {
        let store = MemoryBlockStore::new();
        let block = block(b"hello world");

        store.put(block.clone()).await.unwrap();
        store.put(block).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_rocks_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksBlockStore::open(dir.path()).unwrap();
        let block = block(b"hello world");

        assert!(!store.has(&block.cid).await.unwrap());
        store.put(block.clone()).await.unwrap();

        assert!(store.has(&block.cid).await.unwrap());
        assert_eq!(store.get(&block.cid).await.unwrap(), block.data);
    }

    #[tokio::test]
    async fn test_rocks_idempotent_put() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksBlockStore::open(dir.path()).unwrap();
        let block = block(b"hello world");

        store.put(block.clone()).await.unwrap();
        store.put(block).await.unwrap();
        assert_eq!(store.block_count().await, 1);
    }

    #[tokio::test]
    async fn test_rocks_block_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksBlockStore::open(dir.path()).unwrap();
        assert_eq!(store.block_count().await, 0);

        for data in [&b"one"[..], b"two", b"three"] {
            store.put(block(data)).await.unwrap();
        }
        assert_eq!(store.block_count().await, 3);
    }

    #[tokio::test]
    async fn test_rocks_missing_block() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksBlockStore::open(dir.path()).unwrap();

        let result = store.get(&block(b"absent").cid).await;
        assert!(matches!(result, Err(StorageError::BlockNotFound(_))));
    }

    #[tokio::test]
    async fn test_journal_keeps_latest_per_key() {
        let dir = tempfile::tempdir().unwrap();

        {
            let journal = RecordJournal::open(dir.path()).unwrap();
            journal.put("/ipns/a", b"a0".to_vec()).await.unwrap();
            journal.put("/ipns/a", b"a1".to_vec()).await.unwrap();
            journal.put("/ipns/b", b"b0".to_vec()).await.unwrap();
        }

        let journal = RecordJournal::open(dir.path()).unwrap();
        let mut records = journal.load().unwrap();
        records.sort();
        assert_eq!(
            records,
            vec![
                ("/ipns/a".to_string(), b"a1".to_vec()),
                ("/ipns/b".to_string(), b"b0".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_rocks_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let block = block(b"durable");

        {
            let store = RocksBlockStore::open(dir.path()).unwrap();
            store.put(block.clone()).await.unwrap();
        }

        let store = RocksBlockStore::open(dir.path()).unwrap();
        assert_eq!(store.get(&block.cid).await.unwrap(), block.data);
    }
}
