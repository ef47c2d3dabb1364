//! DNSLink binding of domain names
//!
//! A domain is bound to an IPNS name or a CID by whoever controls its DNS
//! zone: a TXT record `dnslink=/ipns/<key>` (or `/ipfs/<cid>`) at
//! `_dnslink.<domain>`, falling back to the domain itself. Pointer records
//! in the overlay are never trusted for domains.

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::record::TargetPath;

const DNSLINK_PREFIX: &str = "dnslink=";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DnsLinkError {
    #[error("DNS lookup for {0} failed: {1}")]
    Lookup(String, String),

    #[error("No valid dnslink entry for {0}: {1}")]
    InvalidEntry(String, String),
}

/// TXT record lookups
#[async_trait]
pub trait TxtResolver: Send + Sync {
    /// TXT strings published at `name`; empty if there are none
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsLinkError>;
}

/// Path `domain` is linked to, or `None` if it has no dnslink entry
///
/// Several entries are tolerated; the lowest valid one in byte order wins.
pub async fn resolve_dnslink(
    resolver: &dyn TxtResolver,
    domain: &str,
) -> Result<Option<TargetPath>, DnsLinkError> {
    for name in [format!("_dnslink.{}", domain), domain.to_string()] {
        let mut entries: Vec<String> = resolver
            .txt(&name)
            .await?
            .into_iter()
            .filter_map(|txt| txt.strip_prefix(DNSLINK_PREFIX).map(str::to_string))
            .collect();
        if entries.is_empty() {
            continue;
        }
        entries.sort();

        let mut last_problem = String::new();
        for entry in &entries {
            match TargetPath::parse(entry) {
                Ok(target) => {
                    debug!("{} is linked to {}", domain, target);
                    return Ok(Some(target));
                }
                Err(e) => last_problem = e.to_string(),
            }
        }
        return Err(DnsLinkError::InvalidEntry(name, last_problem));
    }

    Ok(None)
}

/// System DNS via hickory
pub struct HickoryTxtResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryTxtResolver {
    /// Use the host's resolver configuration, or public defaults if it
    /// cannot be read
    pub fn from_system_conf() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            warn!("Cannot read system DNS configuration ({}), using defaults", e);
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { resolver }
    }
}

#[async_trait]
impl TxtResolver for HickoryTxtResolver {
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsLinkError> {
        // Fully qualified, so search domains are not appended
        match self.resolver.txt_lookup(format!("{}.", name)).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|chunk| String::from_utf8_lossy(chunk))
                        .collect::<String>()
                })
                .collect()),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                _ => Err(DnsLinkError::Lookup(name.to_string(), e.to_string())),
            },
        }
    }
}

/// In-process TXT records
#[derive(Default)]
pub struct MemoryTxtResolver {
    records: RwLock<HashMap<String, Vec<String>>>,
    offline: AtomicBool,
}

impl MemoryTxtResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a TXT string at `name`
    pub fn insert(&self, name: &str, txt: &str) {
        self.records
            .write()
            .expect("lock poisoned")
            .entry(name.to_string())
            .or_default()
            .push(txt.to_string());
    }

    /// Publish `dnslink=<path>` for `domain`
    pub fn link(&self, domain: &str, target: &TargetPath) {
        self.insert(
            &format!("_dnslink.{}", domain),
            &format!("{}{}", DNSLINK_PREFIX, target),
        );
    }

    /// Make every lookup fail
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl TxtResolver for MemoryTxtResolver {
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsLinkError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DnsLinkError::Lookup(name.to_string(), "resolver offline".to_string()));
        }

        Ok(self
            .records
            .read()
            .expect("lock poisoned")
            .get(name)
            .cloned()
            .unwrap_or_default())
    }
}
