//! `did:ipns` resolution
//!
//! identifier -> overlay lookup -> freshest valid record -> content fetch ->
//! decoded DID document. Key names resolve through signed overlay records,
//! domain names through DNSLink. Targets that are another IPNS name are
//! followed, up to `max_redirects` hops.

use chrono::{DateTime, Utc};
use cid::Cid;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::codec::CodecError;
use crate::content::{ContentError, ContentStore};
use crate::did::{Did, DidError, IpnsName, METHOD};
use crate::dnslink::{resolve_dnslink, DnsLinkError, MemoryTxtResolver, TxtResolver};
use crate::document::DidDocument;
use crate::metrics::Metrics;
use crate::overlay::{self, Overlay, OverlayError, DEFAULT_LOOKUP_TIMEOUT};
use crate::record::{parse_record, select_freshest, PointerRecord, TargetPath};

pub const DEFAULT_MAX_REDIRECTS: usize = 8;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Unsupported DID method: {0}")]
    UnsupportedMethod(String),

    #[error("Malformed identifier: {0}")]
    MalformedIdentifier(String),

    #[error("No pointer record found under {0}")]
    RecordNotFound(String),

    #[error("No usable pointer record: {0}")]
    InvalidRecord(String),

    #[error("Content not found: {0}")]
    ContentNotFound(Cid),

    #[error("Unsupported codec: 0x{0:x}")]
    UnsupportedCodec(u64),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("More than {0} redirects")]
    TooManyRedirects(usize),

    #[error("Overlay unavailable: {0}")]
    OverlayUnavailable(String),

    #[error("DNS unavailable: {0}")]
    DnsUnavailable(String),

    #[error("Block store read failed: {0}")]
    StoreReadFailed(String),
}

impl ResolveError {
    /// DID resolution error code for resolution metadata
    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::UnsupportedMethod(_) => "methodNotSupported",
            ResolveError::MalformedIdentifier(_) => "invalidDid",
            ResolveError::RecordNotFound(_) | ResolveError::ContentNotFound(_) => "notFound",
            ResolveError::InvalidRecord(_) => "invalidRecord",
            ResolveError::UnsupportedCodec(_) => "representationNotSupported",
            ResolveError::MalformedPayload(_) => "invalidDidDocument",
            ResolveError::TooManyRedirects(_) => "tooManyRedirects",
            ResolveError::OverlayUnavailable(_)
            | ResolveError::DnsUnavailable(_)
            | ResolveError::StoreReadFailed(_) => "internalError",
        }
    }
}

impl From<DidError> for ResolveError {
    fn from(e: DidError) -> Self {
        match e {
            DidError::UnsupportedMethod(method) => ResolveError::UnsupportedMethod(method),
            DidError::MalformedIdentifier(msg) => ResolveError::MalformedIdentifier(msg),
        }
    }
}

impl From<OverlayError> for ResolveError {
    fn from(e: OverlayError) -> Self {
        match e {
            OverlayError::Unavailable(msg) => ResolveError::OverlayUnavailable(msg),
        }
    }
}

impl From<DnsLinkError> for ResolveError {
    fn from(e: DnsLinkError) -> Self {
        match e {
            DnsLinkError::Lookup(..) => ResolveError::DnsUnavailable(e.to_string()),
            DnsLinkError::InvalidEntry(..) => ResolveError::InvalidRecord(e.to_string()),
        }
    }
}

impl From<ContentError> for ResolveError {
    fn from(e: ContentError) -> Self {
        match e {
            ContentError::NotFound(cid) => ResolveError::ContentNotFound(cid),
            ContentError::Codec(CodecError::UnsupportedCodec(code)) => {
                ResolveError::UnsupportedCodec(code)
            }
            ContentError::Codec(other) => ResolveError::MalformedPayload(other.to_string()),
            ContentError::StoreReadFailed(e) | ContentError::StoreWriteFailed(e) => {
                ResolveError::StoreReadFailed(e.to_string())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Longest chain of `/ipns/` indirections followed
    pub max_redirects: usize,
    pub lookup_timeout: Duration,
    /// Resolve to records past their end of life instead of skipping them
    pub accept_expired: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_redirects: DEFAULT_MAX_REDIRECTS,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            accept_expired: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResult {
    pub did_document: DidDocument,
    pub did_document_metadata: DocumentMetadata,
    pub did_resolution_metadata: ResolutionMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    /// CID of the document block
    pub cid: String,
    /// Sequence of the record that pointed at it; absent when a DNSLink
    /// entry did
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// End of life of that record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionMetadata {
    pub method: String,
    pub content_type: String,
    pub redirects: usize,
    pub did_url: String,
}

pub struct Resolver {
    content: ContentStore,
    overlay: Arc<dyn Overlay>,
    dns: Arc<dyn TxtResolver>,
    config: ResolverConfig,
    metrics: Metrics,
}

impl Resolver {
    pub fn new(content: ContentStore, overlay: Arc<dyn Overlay>, config: ResolverConfig) -> Self {
        Self {
            content,
            overlay,
            // No TXT records until a real resolver is attached
            dns: Arc::new(MemoryTxtResolver::new()),
            config,
            metrics: Metrics::new(),
        }
    }

    /// Resolve domain names through `dns`
    pub fn with_dns(mut self, dns: Arc<dyn TxtResolver>) -> Self {
        self.dns = dns;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve a `did:ipns` DID (or DID URL) to its current document
    pub async fn resolve(&self, identifier: &str) -> Result<ResolutionResult, ResolveError> {
        let result = self.resolve_did(identifier).await;

        match &result {
            Ok(resolved) => {
                self.metrics
                    .resolution_succeeded(resolved.did_resolution_metadata.redirects);
                info!(
                    "Resolved {} to {} ({} redirects)",
                    identifier,
                    resolved.did_document_metadata.cid,
                    resolved.did_resolution_metadata.redirects
                );
            }
            Err(e) => {
                self.metrics.resolution_failed();
                debug!("Failed to resolve {}: {}", identifier, e);
            }
        }

        result
    }

    async fn resolve_did(&self, identifier: &str) -> Result<ResolutionResult, ResolveError> {
        let did = Did::parse(identifier)?;

        let mut name = did.name.clone();
        let mut redirects = 0;
        let mut record = None;
        let cid = loop {
            let target = match &name {
                IpnsName::Domain(domain) => {
                    record = None;
                    self.dnslink_target(domain).await?
                }
                IpnsName::Key(_) => {
                    let current = self.current_record(&name).await?;
                    let target = current.target.clone();
                    record = Some(current);
                    target
                }
            };
            match target {
                TargetPath::Content(cid) => break cid,
                TargetPath::Name(next) => {
                    redirects += 1;
                    if redirects > self.config.max_redirects {
                        return Err(ResolveError::TooManyRedirects(self.config.max_redirects));
                    }
                    debug!("{} redirects to {}", name, next);
                    name = next;
                }
            }
        };

        let document: DidDocument = self.content.fetch_value(&cid).await?;
        let content_type = self
            .content
            .registry()
            .codec(cid.codec())
            .map(|codec| codec.content_type().to_string())
            .map_err(|_| ResolveError::UnsupportedCodec(cid.codec()))?;

        Ok(ResolutionResult {
            did_document: document,
            did_document_metadata: DocumentMetadata {
                cid: cid.to_string(),
                sequence: record.as_ref().map(|r| r.sequence),
                validity: record.as_ref().map(|r| r.validity),
            },
            did_resolution_metadata: ResolutionMetadata {
                method: METHOD.to_string(),
                content_type,
                redirects,
                did_url: did.url,
            },
        })
    }

    async fn dnslink_target(&self, domain: &str) -> Result<TargetPath, ResolveError> {
        resolve_dnslink(self.dns.as_ref(), domain)
            .await?
            .ok_or_else(|| ResolveError::RecordNotFound(format!("_dnslink.{}", domain)))
    }

    /// Freshest usable record for `name`
    ///
    /// Candidates that fail to parse or verify, and expired ones unless
    /// `accept_expired` is set, are skipped. Fails only if nothing is left.
    pub async fn current_record(&self, name: &IpnsName) -> Result<PointerRecord, ResolveError> {
        let key = name.record_key();
        let candidates =
            overlay::lookup(self.overlay.as_ref(), &key, self.config.lookup_timeout).await?;
        if candidates.is_empty() {
            return Err(ResolveError::RecordNotFound(key));
        }

        let now = Utc::now();
        let total = candidates.len();
        let mut records = Vec::with_capacity(total);
        let mut last_problem = String::new();

        for bytes in &candidates {
            match parse_record(bytes, name) {
                Ok(record) if !self.config.accept_expired && record.is_expired(now) => {
                    debug!(
                        "Skipping expired record for {} (sequence {}, expired {})",
                        key, record.sequence, record.validity
                    );
                    last_problem = format!("record expired at {}", record.validity);
                }
                Ok(record) => records.push(record),
                Err(e) => {
                    debug!("Skipping invalid record for {}: {}", key, e);
                    last_problem = e.to_string();
                }
            }
        }

        let skipped = total - records.len();
        if skipped > 0 {
            self.metrics.candidates_skipped(skipped);
        }

        select_freshest(records).ok_or_else(|| {
            ResolveError::InvalidRecord(format!(
                "all {} candidates under {} were skipped, last: {}",
                total, key, last_problem
            ))
        })
    }
}
