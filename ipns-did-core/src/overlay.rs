//! Key-value overlay for pointer records
//!
//! The overlay is where pointer records live: a distributed store that may
//! hand back several values for one key (replicas, stale copies, racing
//! writers). `lookup` drains every candidate before anyone picks one,
//! because stale replicas can arrive first.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// How long a lookup waits for the overlay to finish answering
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OverlayError {
    #[error("Overlay unavailable: {0}")]
    Unavailable(String),
}

/// Lazily produced record values for one key
pub type CandidateStream = BoxStream<'static, Result<Vec<u8>, OverlayError>>;

#[async_trait]
pub trait Overlay: Send + Sync {
    /// Every value the overlay can find for `key`; possibly none
    fn get(&self, key: &str) -> CandidateStream;

    /// Hand a value to the overlay. Success means it was accepted locally,
    /// not that it is visible anywhere else yet.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), OverlayError>;
}

/// Drain all candidates for `key`
///
/// An empty result means "no record", not failure. If the overlay is still
/// answering when `timeout` runs out, whatever arrived so far is returned.
pub async fn lookup(
    overlay: &dyn Overlay,
    key: &str,
    timeout: Duration,
) -> Result<Vec<Vec<u8>>, OverlayError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut stream = overlay.get(key);
    let mut candidates = Vec::new();

    loop {
        match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(Some(Ok(value))) => candidates.push(value),
            Ok(Some(Err(e))) => return Err(e),
            Ok(None) => break,
            Err(_) => {
                warn!(
                    "Lookup of {} timed out after {:?} with {} candidates",
                    key,
                    timeout,
                    candidates.len()
                );
                break;
            }
        }
    }

    debug!("Lookup of {} found {} candidates", key, candidates.len());
    Ok(candidates)
}

/// Write a record value under `key`
pub async fn store(overlay: &dyn Overlay, key: &str, value: Vec<u8>) -> Result<(), OverlayError> {
    let size = value.len();
    overlay.put(key, value).await?;
    info!("Stored record under {} ({} bytes)", key, size);
    Ok(())
}

/// In-process overlay
///
/// Every `put` adds a replica instead of replacing the previous value, so
/// stale and racing records coexist the way they do in a real DHT.
#[derive(Default)]
pub struct MemoryOverlay {
    replicas: RwLock<HashMap<String, Vec<Vec<u8>>>>,
    offline: AtomicBool,
}

impl MemoryOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// All values currently held for `key`, oldest first
    pub fn replicas(&self, key: &str) -> Vec<Vec<u8>> {
        self.replicas
            .read()
            .expect("lock poisoned")
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Add a value without going through `put`
    pub fn insert_replica(&self, key: &str, value: Vec<u8>) {
        self.replicas
            .write()
            .expect("lock poisoned")
            .entry(key.to_string())
            .or_default()
            .push(value);
    }

    /// Make every call fail with `Unavailable`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), OverlayError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(OverlayError::Unavailable("overlay is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Overlay for MemoryOverlay {
    fn get(&self, key: &str) -> CandidateStream {
        if let Err(e) = self.check_online() {
            return stream::once(async move { Err(e) }).boxed();
        }

        stream::iter(self.replicas(key).into_iter().map(Ok)).boxed()
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), OverlayError> {
        self.check_online()?;
        self.insert_replica(key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Answers with one value and then never finishes
    struct SlowOverlay;

    #[async_trait]
    impl Overlay for SlowOverlay {
        fn get(&self, _key: &str) -> CandidateStream {
            stream::once(async { Ok(b"early".to_vec()) })
                .chain(stream::pending())
                .boxed()
        }

        async fn put(&self, _key: &str, _value: Vec<u8>) -> Result<(), OverlayError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lookup_drains_all_replicas() {
        let overlay = MemoryOverlay::new();
        store(&overlay, "/ipns/a", b"one".to_vec()).await.unwrap();
        store(&overlay, "/ipns/a", b"two".to_vec()).await.unwrap();
        store(&overlay, "/ipns/b", b"other".to_vec()).await.unwrap();

        let candidates = lookup(&overlay, "/ipns/a", DEFAULT_LOOKUP_TIMEOUT).await.unwrap();
        assert_eq!(candidates, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn test_lookup_of_unknown_key_is_empty() {
        let overlay = MemoryOverlay::new();
        let candidates = lookup(&overlay, "/ipns/none", DEFAULT_LOOKUP_TIMEOUT).await.unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_offline_overlay() {
        let overlay = MemoryOverlay::new();
        overlay.set_offline(true);

        assert!(matches!(
            lookup(&overlay, "/ipns/a", DEFAULT_LOOKUP_TIMEOUT).await,
            Err(OverlayError::Unavailable(_))
        ));
        assert!(matches!(
            store(&overlay, "/ipns/a", b"x".to_vec()).await,
            Err(OverlayError::Unavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_timeout_keeps_early_candidates() {
        let candidates = lookup(&SlowOverlay, "/ipns/a", Duration::from_secs(5)).await.unwrap();
        assert_eq!(candidates, vec![b"early".to_vec()]);
    }
}
