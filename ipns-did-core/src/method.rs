//! The `did:ipns` method
//!
//! One handle over a shared codec registry, block store and overlay that
//! resolves and publishes DID documents.

use cid::Cid;
use libp2p::PeerId;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::CodecRegistry;
use crate::content::{ContentError, ContentStore};
use crate::did::{identity_from_domain, identity_from_key};
use crate::document::DidDocument;
use crate::identity::SigningIdentity;
use crate::metrics::Metrics;
use crate::overlay::Overlay;
use crate::publisher::{
    PointerUpdate, PublishError, PublishOptions, PublishOutcome, Publisher, PublisherConfig,
};
use crate::dnslink::TxtResolver;
use crate::record::TargetPath;
use crate::resolver::{ResolutionResult, ResolveError, Resolver, ResolverConfig};
use crate::storage::BlockStore;

pub struct IpnsDid {
    content: ContentStore,
    resolver: Resolver,
    publisher: Publisher,
    metrics: Metrics,
}

impl IpnsDid {
    pub fn new(
        registry: Arc<CodecRegistry>,
        blocks: Arc<dyn BlockStore>,
        overlay: Arc<dyn Overlay>,
        resolver_config: ResolverConfig,
        publisher_config: PublisherConfig,
    ) -> Self {
        let metrics = Metrics::new();
        let content = ContentStore::new(registry, blocks);
        let resolver = Resolver::new(content.clone(), overlay.clone(), resolver_config)
            .with_metrics(metrics.clone());
        let publisher = Publisher::new(content.clone(), overlay, publisher_config)
            .with_metrics(metrics.clone());

        Self {
            content,
            resolver,
            publisher,
            metrics,
        }
    }

    /// Default codecs and configuration
    pub fn with_defaults(blocks: Arc<dyn BlockStore>, overlay: Arc<dyn Overlay>) -> Self {
        Self::new(
            Arc::new(CodecRegistry::new()),
            blocks,
            overlay,
            ResolverConfig::default(),
            PublisherConfig::default(),
        )
    }

    /// Resolve domain names through DNSLink lookups on `dns`
    pub fn with_dns(self, dns: Arc<dyn TxtResolver>) -> Self {
        Self {
            resolver: self.resolver.with_dns(dns),
            ..self
        }
    }

    /// Report into an existing metrics collector
    pub fn with_metrics(self, metrics: Metrics) -> Self {
        Self {
            content: self.content,
            resolver: self.resolver.with_metrics(metrics.clone()),
            publisher: self.publisher.with_metrics(metrics.clone()),
            metrics,
        }
    }

    pub async fn resolve(&self, did: &str) -> Result<ResolutionResult, ResolveError> {
        self.resolver.resolve(did).await
    }

    pub async fn publish(
        &self,
        document: &DidDocument,
        options: PublishOptions,
        identity: &dyn SigningIdentity,
        validity: Duration,
    ) -> Result<PublishOutcome, PublishError> {
        self.publisher
            .publish(document, options, identity, validity)
            .await
    }

    /// Point the identity's DID at another IPNS name or an existing block
    pub async fn publish_pointer(
        &self,
        target: &TargetPath,
        identity: &dyn SigningIdentity,
        validity: Duration,
    ) -> Result<PointerUpdate, PublishError> {
        self.publisher
            .publish_pointer(target, identity, validity)
            .await
    }

    /// Store any serializable value as a block, without touching the overlay
    pub async fn publish_value<T>(
        &self,
        value: &T,
        codec: u64,
        hasher: u64,
    ) -> Result<Cid, ContentError>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.content.publish_value(value, codec, hasher).await
    }

    pub fn peer_id_to_did(&self, peer_id: &PeerId) -> String {
        identity_from_key(peer_id)
    }

    pub fn domain_to_did(&self, domain: &str) -> String {
        identity_from_domain(domain)
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}
