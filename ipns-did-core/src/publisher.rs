//! Publishing DID documents
//!
//! document -> validated -> stored block -> next sequence for the signing
//! key -> signed record -> overlay. The steps run strictly in that order;
//! the record is never written before the content it names.
//!
//! Two publishers racing on one key can both write the same sequence. The
//! resolver's tie-break picks one of them deterministically; nothing here
//! prevents the race. `PublisherConfig::recheck_sequence` narrows the window
//! by looking again right before the write.

use cid::Cid;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::{CodecError, DAG_CBOR, SHA2_256};
use crate::content::{ContentError, ContentStore};
use crate::did::IpnsName;
use crate::document::{DidDocument, DocumentError};
use crate::identity::SigningIdentity;
use crate::metrics::Metrics;
use crate::overlay::{self, Overlay, OverlayError, DEFAULT_LOOKUP_TIMEOUT};
use crate::record::{build_record, parse_record, RecordError, TargetPath};

/// Validity of records published without an explicit one
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Unsupported codec: 0x{0:x}")]
    UnsupportedCodec(u64),

    #[error("Unsupported hasher: 0x{0:x}")]
    UnsupportedHasher(u64),

    #[error("Block store write failed: {0}")]
    StoreWriteFailed(String),

    #[error("Overlay unavailable: {0}")]
    OverlayUnavailable(String),

    #[error("Failed to build record: {0}")]
    InvalidRecord(String),
}

impl From<DocumentError> for PublishError {
    fn from(e: DocumentError) -> Self {
        PublishError::InvalidDocument(e.to_string())
    }
}

impl From<ContentError> for PublishError {
    fn from(e: ContentError) -> Self {
        match e {
            ContentError::Codec(CodecError::UnsupportedCodec(code)) => {
                PublishError::UnsupportedCodec(code)
            }
            ContentError::Codec(CodecError::UnsupportedHasher(code)) => {
                PublishError::UnsupportedHasher(code)
            }
            ContentError::Codec(other) => PublishError::InvalidDocument(other.to_string()),
            ContentError::StoreWriteFailed(e) | ContentError::StoreReadFailed(e) => {
                PublishError::StoreWriteFailed(e.to_string())
            }
            ContentError::NotFound(cid) => {
                PublishError::StoreWriteFailed(format!("{} vanished after write", cid))
            }
        }
    }
}

impl From<OverlayError> for PublishError {
    fn from(e: OverlayError) -> Self {
        match e {
            OverlayError::Unavailable(msg) => PublishError::OverlayUnavailable(msg),
        }
    }
}

impl From<RecordError> for PublishError {
    fn from(e: RecordError) -> Self {
        PublishError::InvalidRecord(e.to_string())
    }
}

/// How the document block is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub codec: u64,
    pub hasher: u64,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            codec: DAG_CBOR,
            hasher: SHA2_256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub lookup_timeout: Duration,
    /// Look up the key's records again just before writing, and move past
    /// any sequence that appeared in the meantime
    pub recheck_sequence: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            recheck_sequence: false,
        }
    }
}

/// A record written for a signing key
#[derive(Debug, Clone, PartialEq)]
pub struct PointerUpdate {
    /// CID of the signing key; the DID's method-specific id
    pub pointer_key_id: Cid,
    pub sequence: u64,
    /// Overlay key the record was written under
    pub key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishOutcome {
    /// CID of the stored document block
    pub content_id: Cid,
    /// CID of the signing key; the DID's method-specific id
    pub pointer_key_id: Cid,
    /// Sequence of the record written
    pub sequence: u64,
    /// Overlay key the record was written under
    pub key: String,
}

pub struct Publisher {
    content: ContentStore,
    overlay: Arc<dyn Overlay>,
    config: PublisherConfig,
    metrics: Metrics,
}

impl Publisher {
    pub fn new(content: ContentStore, overlay: Arc<dyn Overlay>, config: PublisherConfig) -> Self {
        Self {
            content,
            overlay,
            config,
            metrics: Metrics::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Store `document` and point the identity's name at it
    pub async fn publish(
        &self,
        document: &DidDocument,
        options: PublishOptions,
        identity: &dyn SigningIdentity,
        validity: Duration,
    ) -> Result<PublishOutcome, PublishError> {
        let result = self.publish_document(document, options, identity, validity).await;
        self.track(&result);
        result
    }

    /// Point the identity's name at an arbitrary target: an existing block
    /// or another IPNS name
    pub async fn publish_pointer(
        &self,
        target: &TargetPath,
        identity: &dyn SigningIdentity,
        validity: Duration,
    ) -> Result<PointerUpdate, PublishError> {
        let result = self.write_pointer(target, identity, validity).await;
        self.track(&result);
        result
    }

    async fn publish_document(
        &self,
        document: &DidDocument,
        options: PublishOptions,
        identity: &dyn SigningIdentity,
        validity: Duration,
    ) -> Result<PublishOutcome, PublishError> {
        document.validate()?;

        let cid = self
            .content
            .publish_value(document, options.codec, options.hasher)
            .await?;

        let update = self
            .write_pointer(&TargetPath::Content(cid), identity, validity)
            .await?;

        Ok(PublishOutcome {
            content_id: cid,
            pointer_key_id: update.pointer_key_id,
            sequence: update.sequence,
            key: update.key,
        })
    }

    async fn write_pointer(
        &self,
        target: &TargetPath,
        identity: &dyn SigningIdentity,
        validity: Duration,
    ) -> Result<PointerUpdate, PublishError> {
        let key_id = identity.key_cid();
        let name = IpnsName::Key(key_id);
        let key = name.record_key();

        let mut sequence = self.next_sequence(&name).await?;
        let mut bytes = build_record(target, sequence, validity, identity)?;

        if self.config.recheck_sequence {
            let latest = self.next_sequence(&name).await?;
            if latest > sequence {
                warn!(
                    "Sequence for {} moved to {} while publishing, re-signing",
                    key, latest
                );
                sequence = latest;
                bytes = build_record(target, sequence, validity, identity)?;
            }
        }

        overlay::store(self.overlay.as_ref(), &key, bytes).await?;

        info!("Published {} -> {} (sequence {})", key, target, sequence);
        Ok(PointerUpdate {
            pointer_key_id: key_id,
            sequence,
            key,
        })
    }

    /// 0 for a name with no verifiable record, otherwise the highest
    /// sequence seen plus one. Expired records still count.
    pub async fn next_sequence(&self, name: &IpnsName) -> Result<u64, PublishError> {
        let key = name.record_key();
        let candidates =
            overlay::lookup(self.overlay.as_ref(), &key, self.config.lookup_timeout).await?;

        let highest = candidates
            .iter()
            .filter_map(|bytes| match parse_record(bytes, name) {
                Ok(record) => Some(record.sequence),
                Err(e) => {
                    debug!("Ignoring invalid record under {}: {}", key, e);
                    None
                }
            })
            .max();

        match highest {
            None => Ok(0),
            Some(seq) => seq
                .checked_add(1)
                .ok_or_else(|| {
                    PublishError::InvalidRecord(format!("sequence of {} exhausted", key))
                }),
        }
    }

    fn track<T>(&self, result: &Result<T, PublishError>) {
        match result {
            Ok(_) => self.metrics.publish_succeeded(),
            Err(e) => {
                self.metrics.publish_failed();
                debug!("Publish failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecRegistry, DAG_JSON};
    use crate::did::identity_from_key;
    use crate::overlay::{CandidateStream, MemoryOverlay};
    use crate::storage::MemoryBlockStore;
    use async_trait::async_trait;
    use libp2p::identity::Keypair;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn publisher_with(
        overlay: Arc<dyn Overlay>,
        config: PublisherConfig,
    ) -> (Publisher, Arc<MemoryBlockStore>) {
        let blocks = Arc::new(MemoryBlockStore::new());
        let content = ContentStore::new(Arc::new(CodecRegistry::new()), blocks.clone());
        (Publisher::new(content, overlay, config), blocks)
    }

    fn document_for(keypair: &Keypair) -> DidDocument {
        DidDocument::new(identity_from_key(&keypair.public().to_peer_id()))
    }

    #[tokio::test]
    async fn test_fresh_publish_starts_at_zero() {
        let overlay = Arc::new(MemoryOverlay::new());
        let (publisher, blocks) = publisher_with(overlay.clone(), PublisherConfig::default());
        let keypair = Keypair::generate_ed25519();

        let outcome = publisher
            .publish(&document_for(&keypair), PublishOptions::default(), &keypair, DEFAULT_VALIDITY)
            .await
            .unwrap();

        assert_eq!(outcome.sequence, 0);
        assert_eq!(outcome.pointer_key_id, keypair.key_cid());
        assert_eq!(outcome.key, format!("/ipns/{}", keypair.key_cid()));
        assert_eq!(outcome.content_id.codec(), DAG_CBOR);
        assert_eq!(blocks.len(), 1);
        assert_eq!(overlay.replicas(&outcome.key).len(), 1);
    }

    #[tokio::test]
    async fn test_back_to_back_publishes_increment() {
        let overlay = Arc::new(MemoryOverlay::new());
        let (publisher, _) = publisher_with(overlay.clone(), PublisherConfig::default());
        let keypair = Keypair::generate_ed25519();
        let doc = document_for(&keypair);

        let first = publisher
            .publish(&doc, PublishOptions::default(), &keypair, DEFAULT_VALIDITY)
            .await
            .unwrap();
        let second = publisher
            .publish(&doc, PublishOptions::default(), &keypair, DEFAULT_VALIDITY)
            .await
            .unwrap();

        assert_eq!(second.sequence, first.sequence + 1);
        assert_eq!(first.content_id, second.content_id);
        assert_eq!(overlay.replicas(&first.key).len(), 2);
    }

    #[tokio::test]
    async fn test_codec_choice() {
        let (publisher, _) =
            publisher_with(Arc::new(MemoryOverlay::new()), PublisherConfig::default());
        let keypair = Keypair::generate_ed25519();
        let options = PublishOptions {
            codec: DAG_JSON,
            hasher: crate::codec::BLAKE3,
        };

        let outcome = publisher
            .publish(&document_for(&keypair), options, &keypair, DEFAULT_VALIDITY)
            .await
            .unwrap();
        assert_eq!(outcome.content_id.codec(), DAG_JSON);
        assert_eq!(outcome.content_id.hash().code(), crate::codec::BLAKE3);
    }

    #[tokio::test]
    async fn test_invalid_document_is_rejected_before_io() {
        let overlay = Arc::new(MemoryOverlay::new());
        let (publisher, blocks) = publisher_with(overlay.clone(), PublisherConfig::default());
        let keypair = Keypair::generate_ed25519();

        let result = publisher
            .publish(
                &DidDocument::new("not-a-did"),
                PublishOptions::default(),
                &keypair,
                DEFAULT_VALIDITY,
            )
            .await;

        assert!(matches!(result, Err(PublishError::InvalidDocument(_))));
        assert!(blocks.is_empty());
        assert!(overlay.replicas(&IpnsName::Key(keypair.key_cid()).record_key()).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_codec() {
        let (publisher, _) =
            publisher_with(Arc::new(MemoryOverlay::new()), PublisherConfig::default());
        let keypair = Keypair::generate_ed25519();
        let options = PublishOptions {
            codec: 0x9999,
            hasher: SHA2_256,
        };

        let result = publisher
            .publish(&document_for(&keypair), options, &keypair, DEFAULT_VALIDITY)
            .await;
        assert!(matches!(result, Err(PublishError::UnsupportedCodec(0x9999))));
    }

    #[tokio::test]
    async fn test_corrupt_existing_record_starts_fresh() {
        let overlay = Arc::new(MemoryOverlay::new());
        let (publisher, _) = publisher_with(overlay.clone(), PublisherConfig::default());
        let keypair = Keypair::generate_ed25519();
        let key = IpnsName::Key(keypair.key_cid()).record_key();
        overlay.insert_replica(&key, b"corrupt".to_vec());

        // A validly signed record from someone else does not count either
        let intruder = Keypair::generate_ed25519();
        let target = TargetPath::Content(keypair.key_cid());
        let forged = build_record(&target, 41, DEFAULT_VALIDITY, &intruder).unwrap();
        overlay.insert_replica(&key, forged);

        let outcome = publisher
            .publish(&document_for(&keypair), PublishOptions::default(), &keypair, DEFAULT_VALIDITY)
            .await
            .unwrap();
        assert_eq!(outcome.sequence, 0);
    }

    #[tokio::test]
    async fn test_offline_overlay_after_content_write() {
        let overlay = Arc::new(MemoryOverlay::new());
        overlay.set_offline(true);
        let (publisher, blocks) = publisher_with(overlay, PublisherConfig::default());
        let keypair = Keypair::generate_ed25519();

        let result = publisher
            .publish(&document_for(&keypair), PublishOptions::default(), &keypair, DEFAULT_VALIDITY)
            .await;

        assert!(matches!(result, Err(PublishError::OverlayUnavailable(_))));
        // Content writes are not rolled back
        assert_eq!(blocks.len(), 1);
    }

    #[tokio::test]
    async fn test_pointer_to_another_name() {
        let overlay = Arc::new(MemoryOverlay::new());
        let (publisher, _) = publisher_with(overlay.clone(), PublisherConfig::default());
        let keypair = Keypair::generate_ed25519();
        let target = TargetPath::Name(IpnsName::Domain("example.com".to_string()));

        let outcome = publisher
            .publish_pointer(&target, &keypair, DEFAULT_VALIDITY)
            .await
            .unwrap();

        let record = parse_record(
            &overlay.replicas(&outcome.key)[0],
            &IpnsName::Key(keypair.key_cid()),
        )
        .unwrap();
        assert_eq!(record.target, target);
    }

    /// Lets a competing publisher sneak in a record on the second lookup
    struct RacingOverlay {
        inner: MemoryOverlay,
        lookups: AtomicUsize,
        competitor: Vec<u8>,
    }

    #[async_trait]
    impl Overlay for RacingOverlay {
        fn get(&self, key: &str) -> CandidateStream {
            if self.lookups.fetch_add(1, Ordering::SeqCst) == 1 {
                self.inner.insert_replica(key, self.competitor.clone());
            }
            self.inner.get(key)
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), OverlayError> {
            self.inner.put(key, value).await
        }
    }

    #[tokio::test]
    async fn test_recheck_moves_past_racing_publisher() {
        let keypair = Keypair::generate_ed25519();
        let target = TargetPath::Content(keypair.key_cid());
        let competitor = build_record(&target, 5, DEFAULT_VALIDITY, &keypair).unwrap();

        let overlay = Arc::new(RacingOverlay {
            inner: MemoryOverlay::new(),
            lookups: AtomicUsize::new(0),
            competitor,
        });
        let config = PublisherConfig {
            recheck_sequence: true,
            ..PublisherConfig::default()
        };
        let (publisher, _) = publisher_with(overlay, config);

        let outcome = publisher
            .publish(&document_for(&keypair), PublishOptions::default(), &keypair, DEFAULT_VALIDITY)
            .await
            .unwrap();
        assert_eq!(outcome.sequence, 6);
    }

    #[tokio::test]
    async fn test_metrics_are_tracked() {
        let metrics = Metrics::new();
        let (publisher, _) =
            publisher_with(Arc::new(MemoryOverlay::new()), PublisherConfig::default());
        let publisher = publisher.with_metrics(metrics.clone());
        let keypair = Keypair::generate_ed25519();

        publisher
            .publish(&document_for(&keypair), PublishOptions::default(), &keypair, DEFAULT_VALIDITY)
            .await
            .unwrap();
        let _ = publisher
            .publish(
                &DidDocument::new("bad"),
                PublishOptions::default(),
                &keypair,
                DEFAULT_VALIDITY,
            )
            .await;

        assert_eq!(metrics.publishes(), 1);
        assert_eq!(metrics.publish_failures(), 1);
    }
}
