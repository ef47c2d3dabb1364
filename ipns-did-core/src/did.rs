//! `did:ipns` identifiers
//!
//! A `did:ipns` DID names either a public key (as a CID or legacy base58
//! peer ID) or a DNS domain. Key names are normalised to a CIDv1 tagged
//! `libp2p-key`, so every spelling of the same key maps to one overlay key.

use cid::Cid;
use libp2p::PeerId;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// DID method handled here
pub const METHOD: &str = "ipns";

/// Multicodec tag for libp2p public keys
pub const LIBP2P_KEY: u64 = 0x72;

/// Prefix of overlay keys for pointer records
pub const IPNS_PREFIX: &str = "/ipns/";

#[derive(Debug, Error, PartialEq)]
pub enum DidError {
    #[error("Unsupported DID method: {0}")]
    UnsupportedMethod(String),

    #[error("Malformed identifier: {0}")]
    MalformedIdentifier(String),
}

/// The thing an IPNS name points at the overlay with
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IpnsName {
    /// A public key, as a CIDv1 with the `libp2p-key` codec
    Key(Cid),
    /// A DNS domain name, lowercased
    Domain(String),
}

impl IpnsName {
    /// Name derived from a libp2p peer ID
    pub fn from_peer_id(peer_id: &PeerId) -> Self {
        IpnsName::Key(peer_id_to_cid(peer_id))
    }

    /// Overlay key under which this name's pointer records live
    pub fn record_key(&self) -> String {
        format!("{}{}", IPNS_PREFIX, self)
    }

    /// Peer ID for key names, `None` for domains
    pub fn peer_id(&self) -> Option<PeerId> {
        match self {
            IpnsName::Key(cid) => PeerId::from_multihash(*cid.hash()).ok(),
            IpnsName::Domain(_) => None,
        }
    }
}

impl fmt::Display for IpnsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpnsName::Key(cid) => write!(f, "{}", cid),
            IpnsName::Domain(domain) => write!(f, "{}", domain),
        }
    }
}

impl FromStr for IpnsName {
    type Err = DidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(DidError::MalformedIdentifier("empty name".to_string()));
        }

        if let Ok(cid) = Cid::try_from(s) {
            return key_from_cid(&cid)
                .ok_or_else(|| DidError::MalformedIdentifier(format!("{} is not a key CID", s)));
        }

        if let Ok(peer_id) = PeerId::from_str(s) {
            return Ok(IpnsName::from_peer_id(&peer_id));
        }

        if is_domain(s) {
            return Ok(IpnsName::Domain(s.to_ascii_lowercase()));
        }

        Err(DidError::MalformedIdentifier(format!(
            "{} is neither a key nor a domain",
            s
        )))
    }
}

/// CIDv1 (`libp2p-key`) for a peer ID
pub fn peer_id_to_cid(peer_id: &PeerId) -> Cid {
    Cid::new_v1(LIBP2P_KEY, (*peer_id).into())
}

/// Re-tag a CID as a key CID, if its multihash is a valid peer ID
fn key_from_cid(cid: &Cid) -> Option<IpnsName> {
    let peer_id = PeerId::from_multihash(*cid.hash()).ok()?;
    Some(IpnsName::from_peer_id(&peer_id))
}

fn is_domain(s: &str) -> bool {
    s.len() <= 253
        && s.contains('.')
        && s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// A parsed `did:ipns` DID URL
///
/// Only `name` drives resolution; path, query and fragment are carried so
/// callers can dereference into the resolved document.
#[derive(Debug, Clone, PartialEq)]
pub struct Did {
    pub name: IpnsName,
    pub path: Option<String>,
    pub query: Option<String>,
    pub fragment: Option<String>,
    /// The DID URL as given
    pub url: String,
}

impl Did {
    /// Parse `did:<method>:<name>[/path][?query][#fragment]`
    pub fn parse(input: &str) -> Result<Self, DidError> {
        let rest = input
            .strip_prefix("did:")
            .ok_or_else(|| DidError::MalformedIdentifier(format!("{} is not a DID", input)))?;

        let (method, rest) = rest
            .split_once(':')
            .ok_or_else(|| DidError::MalformedIdentifier(format!("{} has no method", input)))?;
        if method.is_empty() {
            return Err(DidError::MalformedIdentifier(format!("{} has no method", input)));
        }
        if method != METHOD {
            return Err(DidError::UnsupportedMethod(method.to_string()));
        }

        let (rest, fragment) = match rest.split_once('#') {
            Some((head, fragment)) => (head, Some(fragment.to_string())),
            None => (rest, None),
        };
        let (rest, query) = match rest.split_once('?') {
            Some((head, query)) => (head, Some(query.to_string())),
            None => (rest, None),
        };
        let (id, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], Some(rest[idx..].to_string())),
            None => (rest, None),
        };

        Ok(Self {
            name: id.parse()?,
            path,
            query,
            fragment,
            url: input.to_string(),
        })
    }

    /// The bare DID, without path, query or fragment
    pub fn did(&self) -> String {
        format!("did:{}:{}", METHOD, self.name)
    }
}

impl FromStr for Did {
    type Err = DidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Did::parse(s)
    }
}

/// DID for a signing key
pub fn identity_from_key(peer_id: &PeerId) -> String {
    format!("did:{}:{}", METHOD, peer_id_to_cid(peer_id))
}

/// DID for a DNS domain
pub fn identity_from_domain(domain: &str) -> String {
    format!("did:{}:{}", METHOD, domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    #[test]
    fn test_parse_domain_did() {
        let did = Did::parse("did:ipns:Example.com").unwrap();
        assert_eq!(did.name, IpnsName::Domain("example.com".to_string()));
        assert_eq!(did.name.record_key(), "/ipns/example.com");
        assert_eq!(did.did(), "did:ipns:example.com");
    }

    #[test]
    fn test_parse_key_did_roundtrip() {
        let peer_id = PeerId::from(Keypair::generate_ed25519().public());
        let did_str = identity_from_key(&peer_id);
        assert!(did_str.starts_with("did:ipns:bafz"));

        let did = Did::parse(&did_str).unwrap();
        assert_eq!(did.name.peer_id(), Some(peer_id));
        assert_eq!(did.did(), did_str);
    }

    #[test]
    fn test_legacy_peer_id_normalises_to_cid() {
        let peer_id = PeerId::from(Keypair::generate_ed25519().public());

        let legacy = Did::parse(&format!("did:ipns:{}", peer_id.to_base58())).unwrap();
        let modern = Did::parse(&identity_from_key(&peer_id)).unwrap();
        assert_eq!(legacy.name, modern.name);
    }

    #[test]
    fn test_unsupported_method() {
        assert_eq!(
            Did::parse("did:web:example.com"),
            Err(DidError::UnsupportedMethod("web".to_string()))
        );
    }

    #[test]
    fn test_malformed_identifiers() {
        for input in [
            "ipns:example.com",
            "did:",
            "did::example.com",
            "did:ipns:",
            "did:ipns:not_a_name",
            "did:ipns:-bad-.com",
        ] {
            assert!(
                matches!(Did::parse(input), Err(DidError::MalformedIdentifier(_))),
                "{} should be malformed",
                input
            );
        }
    }

    #[test]
    fn test_did_url_components() {
        let did = Did::parse("did:ipns:example.com/keys/1?versionId=2#key-1").unwrap();
        assert_eq!(did.name, IpnsName::Domain("example.com".to_string()));
        assert_eq!(did.path.as_deref(), Some("/keys/1"));
        assert_eq!(did.query.as_deref(), Some("versionId=2"));
        assert_eq!(did.fragment.as_deref(), Some("key-1"));
        assert_eq!(did.url, "did:ipns:example.com/keys/1?versionId=2#key-1");
    }

    #[test]
    fn test_non_key_cid_is_rejected() {
        // Peer IDs are sha2-256 or identity multihashes; blake3 is neither
        let mh = multihash::Multihash::<64>::wrap(0x1e, &[7u8; 32]).unwrap();
        let cid = Cid::new_v1(0x71, mh);
        let result = Did::parse(&format!("did:ipns:{}", cid));
        assert!(matches!(result, Err(DidError::MalformedIdentifier(_))));
    }

    #[test]
    fn test_identity_from_domain() {
        assert_eq!(identity_from_domain("example.com"), "did:ipns:example.com");
    }
}
