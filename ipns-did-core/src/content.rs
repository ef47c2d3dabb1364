//! Content store adapter
//!
//! Glues the codec registry to a block store: values go in as encoded,
//! content-addressed blocks and come back out decoded with the codec their
//! CID names. The CID returned on write is the one computed while encoding,
//! never recomputed from what the store reports.

use cid::Cid;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::codec::{CodecError, CodecRegistry};
use crate::storage::{canonical_cid, Block, BlockStore, StorageError};

#[derive(Debug, Error)]
pub enum ContentError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Content not found: {0}")]
    NotFound(Cid),

    #[error("Block store write failed: {0}")]
    StoreWriteFailed(#[source] StorageError),

    #[error("Block store read failed: {0}")]
    StoreReadFailed(#[source] StorageError),
}

#[derive(Clone)]
pub struct ContentStore {
    registry: Arc<CodecRegistry>,
    blocks: Arc<dyn BlockStore>,
}

impl ContentStore {
    pub fn new(registry: Arc<CodecRegistry>, blocks: Arc<dyn BlockStore>) -> Self {
        Self { registry, blocks }
    }

    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }

    pub fn blocks(&self) -> &Arc<dyn BlockStore> {
        &self.blocks
    }

    /// Encode `value`, write it to the block store and return its CIDv1
    ///
    /// Store failures are returned as-is; nothing is retried here.
    pub async fn publish_value<T>(
        &self,
        value: &T,
        codec: u64,
        hasher: u64,
    ) -> Result<Cid, ContentError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let block = self.registry.encode(value, codec, hasher)?;
        let cid = canonical_cid(&block.cid);
        let size = block.bytes.len();

        self.blocks
            .put(Block::new(cid, block.bytes))
            .await
            .map_err(ContentError::StoreWriteFailed)?;

        info!("Published value {} ({} bytes)", cid, size);
        Ok(cid)
    }

    /// Fetch the block behind `cid`, check its hash and decode it
    pub async fn fetch_value<T: DeserializeOwned>(&self, cid: &Cid) -> Result<T, ContentError> {
        let bytes = self.blocks.get(cid).await.map_err(|e| match e {
            StorageError::BlockNotFound(_) => ContentError::NotFound(*cid),
            other => ContentError::StoreReadFailed(other),
        })?;
        debug!("Fetched block {} ({} bytes)", cid, bytes.len());

        self.registry.verify(&bytes, cid)?;
        Ok(self.registry.decode(&bytes, cid.codec())?)
    }
}
