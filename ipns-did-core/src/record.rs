//! IPNS pointer records
//!
//! A pointer record binds an IPNS name to a target path (`/ipfs/<cid>` or a
//! further `/ipns/<name>`), stamped with a sequence number and an end of
//! life. Records are protobuf `IpnsEntry` messages carrying a signed
//! DAG-CBOR `data` block (signature v2) and, for older readers, a v1
//! signature over the raw fields.
//!
//! This module never picks sequence numbers; callers hand in the next one.

use chrono::{DateTime, SecondsFormat, Utc};
use cid::Cid;
use libp2p::identity::PublicKey;
use prost::Message as ProstMessage;
use serde_cbor::Value as CborValue;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::did::IpnsName;
use crate::identity::{IdentityError, SigningIdentity};
use crate::storage::canonical_cid;

/// Cache hint handed to resolvers with every record
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Only validity type in use: an RFC 3339 end-of-life timestamp
pub const VALIDITY_EOL: i32 = 0;

const SIGNATURE_V2_PREFIX: &[u8] = b"ipns-signature:";

/// Multihash code of an inlined ("identity") public key
const IDENTITY_MULTIHASH: u64 = 0x00;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Malformed record: {0}")]
    Malformed(String),

    #[error("Record signature does not verify")]
    InvalidSignature,

    #[error("Record carries no public key and none can be derived from the name")]
    MissingPublicKey,

    #[error("Record public key does not match {0}")]
    KeyMismatch(String),

    #[error("Domain {0} has no owning key; records under it are not accepted")]
    DomainName(String),

    #[error("Unsupported validity type: {0}")]
    UnsupportedValidityType(i32),

    #[error("Invalid validity: {0}")]
    InvalidValidity(String),

    #[error("Invalid target path: {0}")]
    InvalidTarget(String),

    #[error("Failed to sign record: {0}")]
    Signing(#[from] IdentityError),
}

/// Protobuf IPNS record
#[derive(Clone, PartialEq, prost::Message)]
pub struct IpnsEntry {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub value: Option<Vec<u8>>,

    #[prost(bytes = "vec", optional, tag = "2")]
    pub signature_v1: Option<Vec<u8>>,

    #[prost(int32, optional, tag = "3")]
    pub validity_type: Option<i32>,

    #[prost(bytes = "vec", optional, tag = "4")]
    pub validity: Option<Vec<u8>>,

    #[prost(uint64, optional, tag = "5")]
    pub sequence: Option<u64>,

    /// Nanoseconds
    #[prost(uint64, optional, tag = "6")]
    pub ttl: Option<u64>,

    #[prost(bytes = "vec", optional, tag = "7")]
    pub pub_key: Option<Vec<u8>>,

    #[prost(bytes = "vec", optional, tag = "8")]
    pub signature_v2: Option<Vec<u8>>,

    /// DAG-CBOR map of Value, Validity, ValidityType, Sequence, TTL
    #[prost(bytes = "vec", optional, tag = "9")]
    pub data: Option<Vec<u8>>,
}

/// Where a record points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPath {
    /// An immutable block, `/ipfs/<cid>`
    Content(Cid),
    /// Another IPNS name, `/ipns/<name>`
    Name(IpnsName),
}

impl TargetPath {
    /// Parse `/ipfs/<cid>`, `/ipns/<name>` or a bare CID
    pub fn parse(path: &str) -> Result<Self, RecordError> {
        let trimmed = path.trim_end_matches('/');

        if let Some(rest) = trimmed.strip_prefix("/ipfs/") {
            let cid = single_segment(rest, path)?
                .parse::<Cid>()
                .map_err(|e| RecordError::InvalidTarget(format!("{}: {}", path, e)))?;
            return Ok(TargetPath::Content(canonical_cid(&cid)));
        }

        if let Some(rest) = trimmed.strip_prefix("/ipns/") {
            let name = single_segment(rest, path)?
                .parse::<IpnsName>()
                .map_err(|e| RecordError::InvalidTarget(format!("{}: {}", path, e)))?;
            return Ok(TargetPath::Name(name));
        }

        trimmed
            .parse::<Cid>()
            .map(|cid| TargetPath::Content(canonical_cid(&cid)))
            .map_err(|_| RecordError::InvalidTarget(path.to_string()))
    }
}

fn single_segment<'a>(rest: &'a str, path: &str) -> Result<&'a str, RecordError> {
    if rest.is_empty() || rest.contains('/') {
        return Err(RecordError::InvalidTarget(format!(
            "{} does not name exactly one object",
            path
        )));
    }
    Ok(rest)
}

impl fmt::Display for TargetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetPath::Content(cid) => write!(f, "/ipfs/{}", cid),
            TargetPath::Name(name) => write!(f, "/ipns/{}", name),
        }
    }
}

/// The fields of a verified record this crate cares about
#[derive(Debug, Clone, PartialEq)]
pub struct PointerRecord {
    pub target: TargetPath,
    pub sequence: u64,
    /// End of life
    pub validity: DateTime<Utc>,
    pub ttl: Duration,
}

impl PointerRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.validity <= now
    }

    /// Higher sequence wins; on a tie, the later end of life wins
    pub fn is_fresher_than(&self, other: &PointerRecord) -> bool {
        (self.sequence, self.validity) > (other.sequence, other.validity)
    }
}

/// Pick the freshest record
pub fn select_freshest<I>(records: I) -> Option<PointerRecord>
where
    I: IntoIterator<Item = PointerRecord>,
{
    records.into_iter().fold(None, |best, record| match best {
        Some(current) if !record.is_fresher_than(&current) => Some(current),
        _ => Some(record),
    })
}

/// Build and sign a record pointing at `target`, valid for `validity` from now
pub fn build_record(
    target: &TargetPath,
    sequence: u64,
    validity: Duration,
    identity: &dyn SigningIdentity,
) -> Result<Vec<u8>, RecordError> {
    let validity = chrono::Duration::from_std(validity)
        .map_err(|e| RecordError::InvalidValidity(e.to_string()))?;
    let eol = Utc::now()
        .checked_add_signed(validity)
        .ok_or_else(|| RecordError::InvalidValidity("end of life overflows".to_string()))?;

    build_record_with_eol(target, sequence, eol, DEFAULT_TTL, identity)
}

/// Build and sign a record with an explicit end of life
pub fn build_record_with_eol(
    target: &TargetPath,
    sequence: u64,
    eol: DateTime<Utc>,
    ttl: Duration,
    identity: &dyn SigningIdentity,
) -> Result<Vec<u8>, RecordError> {
    let value = target.to_string().into_bytes();
    let validity = eol
        .to_rfc3339_opts(SecondsFormat::Nanos, true)
        .into_bytes();
    let ttl = u64::try_from(ttl.as_nanos())
        .map_err(|_| RecordError::InvalidValidity("ttl overflows".to_string()))?;

    let data = encode_signed_data(&value, &validity, sequence, ttl)?;
    let signature_v2 = identity.sign(&[SIGNATURE_V2_PREFIX, data.as_slice()].concat())?;
    let signature_v1 =
        identity.sign(&[value.as_slice(), validity.as_slice(), b"EOL".as_slice()].concat())?;

    let entry = IpnsEntry {
        value: Some(value),
        signature_v1: Some(signature_v1),
        validity_type: Some(VALIDITY_EOL),
        validity: Some(validity),
        sequence: Some(sequence),
        ttl: Some(ttl),
        pub_key: Some(identity.public_key().encode_protobuf()),
        signature_v2: Some(signature_v2),
        data: Some(data),
    };

    Ok(entry.encode_to_vec())
}

/// Decode and verify a record found under `name`
///
/// Only key names own records: the signature must verify against the key
/// the name encodes. Domain names are refused outright.
pub fn parse_record(bytes: &[u8], name: &IpnsName) -> Result<PointerRecord, RecordError> {
    let entry = IpnsEntry::decode(bytes).map_err(|e| RecordError::Malformed(e.to_string()))?;
    let public_key = record_public_key(&entry, name)?;

    let fields = match &entry.data {
        Some(data) => {
            let signature = entry
                .signature_v2
                .as_deref()
                .ok_or_else(|| RecordError::Malformed("data without signatureV2".to_string()))?;
            if !public_key.verify(&[SIGNATURE_V2_PREFIX, data.as_slice()].concat(), signature) {
                return Err(RecordError::InvalidSignature);
            }

            let fields = decode_signed_data(data)?;
            check_matches_data(&entry, &fields)?;
            fields
        }
        None => {
            let signature = entry
                .signature_v1
                .as_deref()
                .ok_or_else(|| RecordError::Malformed("record is unsigned".to_string()))?;
            let fields = SignedFields {
                value: required(&entry.value, "value")?,
                validity: required(&entry.validity, "validity")?,
                validity_type: entry.validity_type.unwrap_or(VALIDITY_EOL),
                sequence: entry.sequence.unwrap_or(0),
                ttl: entry.ttl.unwrap_or(0),
            };
            let signed = [
                fields.value.as_slice(),
                fields.validity.as_slice(),
                b"EOL".as_slice(),
            ]
            .concat();
            if !public_key.verify(&signed, signature) {
                return Err(RecordError::InvalidSignature);
            }
            fields
        }
    };

    if fields.validity_type != VALIDITY_EOL {
        return Err(RecordError::UnsupportedValidityType(fields.validity_type));
    }

    let validity = std::str::from_utf8(&fields.validity)
        .map_err(|e| RecordError::InvalidValidity(e.to_string()))
        .and_then(|s| {
            DateTime::parse_from_rfc3339(s)
                .map_err(|e| RecordError::InvalidValidity(format!("{}: {}", s, e)))
        })?
        .with_timezone(&Utc);

    let target = std::str::from_utf8(&fields.value)
        .map_err(|e| RecordError::InvalidTarget(e.to_string()))
        .and_then(TargetPath::parse)?;

    Ok(PointerRecord {
        target,
        sequence: fields.sequence,
        validity,
        ttl: Duration::from_nanos(fields.ttl),
    })
}

fn required(field: &Option<Vec<u8>>, name: &str) -> Result<Vec<u8>, RecordError> {
    field
        .clone()
        .ok_or_else(|| RecordError::Malformed(format!("missing {}", name)))
}

fn record_public_key(entry: &IpnsEntry, name: &IpnsName) -> Result<PublicKey, RecordError> {
    let embedded = entry
        .pub_key
        .as_deref()
        .map(|bytes| {
            PublicKey::try_decode_protobuf(bytes).map_err(|e| RecordError::Malformed(e.to_string()))
        })
        .transpose()?;

    // Domains are bound through DNSLink; any key could sign a record for them
    let Some(peer_id) = name.peer_id() else {
        return Err(RecordError::DomainName(name.to_string()));
    };

    match embedded {
        Some(key) if key.to_peer_id() == peer_id => Ok(key),
        Some(_) => Err(RecordError::KeyMismatch(name.to_string())),
        None => {
            let mh: multihash::Multihash<64> = peer_id.into();
            if mh.code() != IDENTITY_MULTIHASH {
                return Err(RecordError::MissingPublicKey);
            }
            PublicKey::try_decode_protobuf(mh.digest())
                .map_err(|e| RecordError::Malformed(e.to_string()))
        }
    }
}

struct SignedFields {
    value: Vec<u8>,
    validity: Vec<u8>,
    validity_type: i32,
    sequence: u64,
    ttl: u64,
}

fn encode_signed_data(
    value: &[u8],
    validity: &[u8],
    sequence: u64,
    ttl: u64,
) -> Result<Vec<u8>, RecordError> {
    let mut map = BTreeMap::new();
    map.insert(text("Value"), CborValue::Bytes(value.to_vec()));
    map.insert(text("Validity"), CborValue::Bytes(validity.to_vec()));
    map.insert(text("ValidityType"), CborValue::Integer(VALIDITY_EOL.into()));
    map.insert(text("Sequence"), CborValue::Integer(sequence.into()));
    map.insert(text("TTL"), CborValue::Integer(ttl.into()));

    serde_cbor::to_vec(&CborValue::Map(map)).map_err(|e| RecordError::Malformed(e.to_string()))
}

fn decode_signed_data(data: &[u8]) -> Result<SignedFields, RecordError> {
    let CborValue::Map(map) = serde_cbor::from_slice::<CborValue>(data)
        .map_err(|e| RecordError::Malformed(e.to_string()))?
    else {
        return Err(RecordError::Malformed("signed data is not a map".to_string()));
    };

    let bytes = |key: &str| match map.get(&text(key)) {
        Some(CborValue::Bytes(b)) => Ok(b.clone()),
        _ => Err(RecordError::Malformed(format!("signed data lacks {}", key))),
    };
    let integer = |key: &str| match map.get(&text(key)) {
        Some(CborValue::Integer(i)) => Ok(*i),
        _ => Err(RecordError::Malformed(format!("signed data lacks {}", key))),
    };
    let out_of_range = |key: &str| RecordError::Malformed(format!("{} out of range", key));

    Ok(SignedFields {
        value: bytes("Value")?,
        validity: bytes("Validity")?,
        validity_type: i32::try_from(integer("ValidityType")?)
            .map_err(|_| out_of_range("ValidityType"))?,
        sequence: u64::try_from(integer("Sequence")?).map_err(|_| out_of_range("Sequence"))?,
        ttl: u64::try_from(integer("TTL")?).map_err(|_| out_of_range("TTL"))?,
    })
}

/// Unsigned protobuf copies of the fields must agree with the signed data
fn check_matches_data(entry: &IpnsEntry, fields: &SignedFields) -> Result<(), RecordError> {
    let agrees = entry.value.as_ref().map_or(true, |v| *v == fields.value)
        && entry.validity.as_ref().map_or(true, |v| *v == fields.validity)
        && entry.sequence.map_or(true, |s| s == fields.sequence)
        && entry.ttl.map_or(true, |t| t == fields.ttl)
        && entry
            .validity_type
            .map_or(true, |t| t == fields.validity_type);

    if agrees {
        Ok(())
    } else {
        Err(RecordError::Malformed(
            "protobuf fields disagree with signed data".to_string(),
        ))
    }
}

fn text(s: &str) -> CborValue {
    CborValue::Text(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecRegistry, DAG_CBOR, SHA2_256};
    use libp2p::identity::Keypair;

    fn content_target() -> TargetPath {
        let cid = CodecRegistry::new()
            .cid_for(b"doc", DAG_CBOR, SHA2_256)
            .unwrap();
        TargetPath::Content(cid)
    }

    fn name_of(keypair: &Keypair) -> IpnsName {
        IpnsName::from_peer_id(&keypair.public().to_peer_id())
    }

    #[test]
    fn test_build_then_parse() {
        let keypair = Keypair::generate_ed25519();
        let bytes = build_record(&content_target(), 7, Duration::from_secs(60), &keypair).unwrap();

        let record = parse_record(&bytes, &name_of(&keypair)).unwrap();
        assert_eq!(record.target, content_target());
        assert_eq!(record.sequence, 7);
        assert_eq!(record.ttl, DEFAULT_TTL);
        assert!(!record.is_expired(Utc::now()));
        assert!(record.is_expired(Utc::now() + chrono::Duration::seconds(120)));
    }

    #[test]
    fn test_secp256k1_keys_work() {
        let keypair = Keypair::generate_secp256k1();
        let bytes = build_record(&content_target(), 0, Duration::from_secs(60), &keypair).unwrap();
        assert!(parse_record(&bytes, &name_of(&keypair)).is_ok());
    }

    #[test]
    fn test_record_from_other_key_is_rejected() {
        let owner = Keypair::generate_ed25519();
        let intruder = Keypair::generate_ed25519();
        let bytes = build_record(&content_target(), 1, Duration::from_secs(60), &intruder).unwrap();

        match parse_record(&bytes, &name_of(&owner)) {
            Err(RecordError::KeyMismatch(_)) => {}
            other => panic!("Expected KeyMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_tampered_signature_is_rejected() {
        let keypair = Keypair::generate_ed25519();
        let bytes = build_record(&content_target(), 1, Duration::from_secs(60), &keypair).unwrap();

        let mut entry = IpnsEntry::decode(bytes.as_slice()).unwrap();
        if let Some(sig) = entry.signature_v2.as_mut() {
            sig[0] ^= 0xff;
        }

        let result = parse_record(&entry.encode_to_vec(), &name_of(&keypair));
        assert!(matches!(result, Err(RecordError::InvalidSignature)));
    }

    #[test]
    fn test_unsigned_field_drift_is_rejected() {
        let keypair = Keypair::generate_ed25519();
        let bytes = build_record(&content_target(), 1, Duration::from_secs(60), &keypair).unwrap();

        let mut entry = IpnsEntry::decode(bytes.as_slice()).unwrap();
        entry.sequence = Some(99);

        let result = parse_record(&entry.encode_to_vec(), &name_of(&keypair));
        assert!(matches!(result, Err(RecordError::Malformed(_))));
    }

    #[test]
    fn test_v1_only_record_parses() {
        let keypair = Keypair::generate_ed25519();
        let bytes = build_record(&content_target(), 4, Duration::from_secs(60), &keypair).unwrap();

        let mut entry = IpnsEntry::decode(bytes.as_slice()).unwrap();
        entry.data = None;
        entry.signature_v2 = None;
        entry.pub_key = None;

        // ed25519 keys are inlined in the peer ID, so no embedded key is needed
        let record = parse_record(&entry.encode_to_vec(), &name_of(&keypair)).unwrap();
        assert_eq!(record.sequence, 4);
    }

    #[test]
    fn test_garbage_is_malformed() {
        let keypair = Keypair::generate_ed25519();
        let result = parse_record(b"\xff\xff\xff", &name_of(&keypair));
        assert!(matches!(result, Err(RecordError::Malformed(_))));
    }

    #[test]
    fn test_domain_records_are_rejected() {
        let keypair = Keypair::generate_ed25519();
        let domain = IpnsName::Domain("example.com".to_string());
        let bytes = build_record(&content_target(), 2, Duration::from_secs(60), &keypair).unwrap();

        // Validly signed, with the signer's key embedded, and still refused
        assert!(matches!(
            parse_record(&bytes, &domain),
            Err(RecordError::DomainName(_))
        ));
    }

    #[test]
    fn test_name_target_roundtrip() {
        let keypair = Keypair::generate_ed25519();
        let target = TargetPath::Name(IpnsName::Domain("next.example.com".to_string()));
        let bytes = build_record(&target, 0, Duration::from_secs(60), &keypair).unwrap();

        let record = parse_record(&bytes, &name_of(&keypair)).unwrap();
        assert_eq!(record.target, target);
    }

    #[test]
    fn test_target_path_forms() {
        let TargetPath::Content(cid) = content_target() else {
            unreachable!()
        };

        assert_eq!(
            TargetPath::parse(&format!("/ipfs/{}", cid)).unwrap(),
            TargetPath::Content(cid)
        );
        assert_eq!(
            TargetPath::parse(&format!("/ipfs/{}/", cid)).unwrap(),
            TargetPath::Content(cid)
        );
        assert_eq!(TargetPath::parse(&cid.to_string()).unwrap(), TargetPath::Content(cid));
        assert_eq!(
            TargetPath::parse("/ipns/example.com").unwrap(),
            TargetPath::Name(IpnsName::Domain("example.com".to_string()))
        );

        let nested = format!("/ipfs/{}/child", cid);
        for bad in ["/ipfs/", "/ipfs/not-a-cid", nested.as_str(), "/tmp/x", ""] {
            assert!(
                matches!(TargetPath::parse(bad), Err(RecordError::InvalidTarget(_))),
                "{:?} accepted",
                bad
            );
        }
    }

    #[test]
    fn test_select_freshest() {
        let now = Utc::now();
        let record = |sequence, secs| PointerRecord {
            target: content_target(),
            sequence,
            validity: now + chrono::Duration::seconds(secs),
            ttl: DEFAULT_TTL,
        };

        let best = select_freshest(vec![record(3, 10), record(7, 10), record(5, 10)]).unwrap();
        assert_eq!(best.sequence, 7);

        // Equal sequence: later end of life wins, regardless of order
        let best = select_freshest(vec![record(7, 50), record(7, 90), record(7, 10)]).unwrap();
        assert_eq!(best.validity, now + chrono::Duration::seconds(90));

        assert!(select_freshest(Vec::new()).is_none());
    }
}
