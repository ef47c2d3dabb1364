//! Prometheus metrics
//!
//! Thread-safe metrics collection using atomic types

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Metrics collector shared by the resolver, publisher and node
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Resolution
    resolutions: AtomicU64,
    resolution_failures: AtomicU64,
    redirects_followed: AtomicU64,
    skipped_candidates: AtomicU64,

    // Publishing
    publishes: AtomicU64,
    publish_failures: AtomicU64,

    // Overlay node
    peer_connections: AtomicUsize,
    total_peers_seen: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                resolutions: AtomicU64::new(0),
                resolution_failures: AtomicU64::new(0),
                redirects_followed: AtomicU64::new(0),
                skipped_candidates: AtomicU64::new(0),
                publishes: AtomicU64::new(0),
                publish_failures: AtomicU64::new(0),
                peer_connections: AtomicUsize::new(0),
                total_peers_seen: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    // Resolution

    pub fn resolution_succeeded(&self, redirects: usize) {
        self.inner.resolutions.fetch_add(1, Ordering::Relaxed);
        self.inner
            .redirects_followed
            .fetch_add(redirects as u64, Ordering::Relaxed);
    }

    pub fn resolution_failed(&self) {
        self.inner.resolution_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn candidates_skipped(&self, count: usize) {
        self.inner
            .skipped_candidates
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn resolutions(&self) -> u64 {
        self.inner.resolutions.load(Ordering::Relaxed)
    }

    pub fn resolution_failures(&self) -> u64 {
        self.inner.resolution_failures.load(Ordering::Relaxed)
    }

    pub fn redirects_followed(&self) -> u64 {
        self.inner.redirects_followed.load(Ordering::Relaxed)
    }

    pub fn skipped_candidates(&self) -> u64 {
        self.inner.skipped_candidates.load(Ordering::Relaxed)
    }

    // Publishing

    pub fn publish_succeeded(&self) {
        self.inner.publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.inner.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publishes(&self) -> u64 {
        self.inner.publishes.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.inner.publish_failures.load(Ordering::Relaxed)
    }

    // Peer connections

    pub fn peer_connected(&self) {
        self.inner.peer_connections.fetch_add(1, Ordering::Relaxed);
        self.inner.total_peers_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_disconnected(&self) {
        let _ = self.inner.peer_connections.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |n| Some(n.saturating_sub(1)),
        );
    }

    pub fn peer_connections(&self) -> usize {
        self.inner.peer_connections.load(Ordering::Relaxed)
    }

    pub fn total_peers_seen(&self) -> u64 {
        self.inner.total_peers_seen.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-formatted metrics text
    pub fn to_prometheus(&self, block_count: usize) -> String {
        format!(
            "# HELP ipns_did_block_count Total number of blocks stored\n\
             # TYPE ipns_did_block_count gauge\n\
             ipns_did_block_count {}\n\
             \n\
             # HELP ipns_did_uptime_seconds Time since node started in seconds\n\
             # TYPE ipns_did_uptime_seconds counter\n\
             ipns_did_uptime_seconds {}\n\
             \n\
             # HELP ipns_did_resolutions_total Successful DID resolutions\n\
             # TYPE ipns_did_resolutions_total counter\n\
             ipns_did_resolutions_total {}\n\
             \n\
             # HELP ipns_did_resolution_failures_total Failed DID resolutions\n\
             # TYPE ipns_did_resolution_failures_total counter\n\
             ipns_did_resolution_failures_total {}\n\
             \n\
             # HELP ipns_did_redirects_followed_total IPNS indirections followed while resolving\n\
             # TYPE ipns_did_redirects_followed_total counter\n\
             ipns_did_redirects_followed_total {}\n\
             \n\
             # HELP ipns_did_skipped_candidates_total Pointer records skipped as invalid \
             or expired\n\
             # TYPE ipns_did_skipped_candidates_total counter\n\
             ipns_did_skipped_candidates_total {}\n\
             \n\
             # HELP ipns_did_publishes_total Successful document publishes\n\
             # TYPE ipns_did_publishes_total counter\n\
             ipns_did_publishes_total {}\n\
             \n\
             # HELP ipns_did_publish_failures_total Failed document publishes\n\
             # TYPE ipns_did_publish_failures_total counter\n\
             ipns_did_publish_failures_total {}\n\
             \n\
             # HELP ipns_did_peer_connections Current number of active peer connections\n\
             # TYPE ipns_did_peer_connections gauge\n\
             ipns_did_peer_connections {}\n\
             \n\
             # HELP ipns_did_total_peers_seen Total number of peers seen since start\n\
             # TYPE ipns_did_total_peers_seen counter\n\
             ipns_did_total_peers_seen {}\n",
            block_count,
            self.uptime_seconds(),
            self.resolutions(),
            self.resolution_failures(),
            self.redirects_followed(),
            self.skipped_candidates(),
            self.publishes(),
            self.publish_failures(),
            self.peer_connections(),
            self.total_peers_seen(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
