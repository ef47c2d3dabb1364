//! Multicodec registry for document payloads
//!
//! Maps multicodec tags to block codecs and multihash tags to hash functions,
//! so a value is encoded into bytes and a CIDv1 in a single step and decoded
//! again with whatever codec its CID names.
//!
//! Values travel through codecs in the JSON data model (`serde_json::Value`);
//! the typed `encode`/`decode` helpers sit on top of that.

use cid::Cid;
use multihash::Multihash;
use prost::Message as ProstMessage;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sha3::Sha3_256;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// MerkleDAG protobuf codec
pub const DAG_PB: u64 = 0x70;

/// MerkleDAG CBOR codec
pub const DAG_CBOR: u64 = 0x71;

/// MerkleDAG JSON codec
pub const DAG_JSON: u64 = 0x0129;

/// sha2-256 multihash code
pub const SHA2_256: u64 = 0x12;

/// sha3-256 multihash code
pub const SHA3_256: u64 = 0x16;

/// BLAKE3 multihash code
pub const BLAKE3: u64 = 0x1e;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unsupported codec: 0x{0:x}")]
    UnsupportedCodec(u64),

    #[error("Unsupported hasher: 0x{0:x}")]
    UnsupportedHasher(u64),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Failed to encode value: {0}")]
    Encode(String),

    #[error("Codec 0x{0:x} is already registered")]
    DuplicateCodec(u64),

    #[error("Hasher 0x{0:x} is already registered")]
    DuplicateHasher(u64),

    #[error("Multihash error: {0}")]
    Multihash(String),
}

/// Encoder/decoder for one multicodec
pub trait BlockCodec: Send + Sync {
    /// Multicodec tag
    fn code(&self) -> u64;

    /// Human readable codec name
    fn name(&self) -> &str;

    /// Media type reported in resolution metadata
    fn content_type(&self) -> &str {
        "application/octet-stream"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// Hash function for one multihash code
pub trait MultihashHasher: Send + Sync {
    /// Multihash code
    fn code(&self) -> u64;

    fn name(&self) -> &str;

    fn digest(&self, data: &[u8]) -> Vec<u8>;
}

/// DAG-JSON: compact JSON with bytewise-sorted map keys
pub struct DagJsonCodec;

impl BlockCodec for DagJsonCodec {
    fn code(&self) -> u64 {
        DAG_JSON
    }

    fn name(&self) -> &str {
        "dag-json"
    }

    fn content_type(&self) -> &str {
        "application/vnd.ipld.dag-json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        // serde_json maps are BTreeMaps, so keys come out bytewise sorted
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::MalformedPayload(e.to_string()))
    }
}

/// DAG-CBOR: CBOR with canonical (length-first) map key ordering
pub struct DagCborCodec;

impl BlockCodec for DagCborCodec {
    fn code(&self) -> u64 {
        DAG_CBOR
    }

    fn name(&self) -> &str {
        "dag-cbor"
    }

    fn content_type(&self) -> &str {
        "application/vnd.ipld.dag-cbor"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        // serde_cbor::Value orders its maps canonically
        let canonical = serde_cbor::value::to_value(value)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        serde_cbor::to_vec(&canonical).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_cbor::from_slice(bytes).map_err(|e| CodecError::MalformedPayload(e.to_string()))
    }
}

/// A dag-pb link. Document nodes never carry links, but decoding has to
/// accept them.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PbLink {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub hash: Option<Vec<u8>>,

    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,

    #[prost(uint64, optional, tag = "3")]
    pub tsize: Option<u64>,
}

/// A dag-pb node
#[derive(Clone, PartialEq, prost::Message)]
pub struct PbNode {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub data: Option<Vec<u8>>,

    #[prost(message, repeated, tag = "2")]
    pub links: Vec<PbLink>,
}

/// DAG-PB: the value is stored as DAG-JSON bytes in the node's `Data` field
pub struct DagPbCodec;

impl BlockCodec for DagPbCodec {
    fn code(&self) -> u64 {
        DAG_PB
    }

    fn name(&self) -> &str {
        "dag-pb"
    }

    fn content_type(&self) -> &str {
        "application/vnd.ipld.dag-pb"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let node = PbNode {
            data: Some(DagJsonCodec.encode(value)?),
            links: Vec::new(),
        };
        Ok(node.encode_to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        let node =
            PbNode::decode(bytes).map_err(|e| CodecError::MalformedPayload(e.to_string()))?;
        let data = node
            .data
            .ok_or_else(|| CodecError::MalformedPayload("dag-pb node has no data".to_string()))?;
        DagJsonCodec.decode(&data)
    }
}

pub struct Sha2_256Hasher;

impl MultihashHasher for Sha2_256Hasher {
    fn code(&self) -> u64 {
        SHA2_256
    }

    fn name(&self) -> &str {
        "sha2-256"
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }
}

pub struct Sha3_256Hasher;

impl MultihashHasher for Sha3_256Hasher {
    fn code(&self) -> u64 {
        SHA3_256
    }

    fn name(&self) -> &str {
        "sha3-256"
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        Sha3_256::digest(data).to_vec()
    }
}

pub struct Blake3Hasher;

impl MultihashHasher for Blake3Hasher {
    fn code(&self) -> u64 {
        BLAKE3
    }

    fn name(&self) -> &str {
        "blake3"
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        blake3::hash(data).as_bytes().to_vec()
    }
}

/// Bytes of an encoded value together with their CID
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBlock {
    pub cid: Cid,
    pub bytes: Vec<u8>,
}

/// Immutable set of codecs and hashers, shared read-only after construction
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<u64, Arc<dyn BlockCodec>>,
    hashers: HashMap<u64, Arc<dyn MultihashHasher>>,
}

impl CodecRegistry {
    /// Registry holding the baseline codecs (dag-pb, dag-cbor, dag-json)
    /// and hashers (sha2-256, sha3-256, blake3)
    pub fn new() -> Self {
        CodecRegistryBuilder::with_defaults().build()
    }

    /// Builder pre-populated with the baseline codecs and hashers
    pub fn builder() -> CodecRegistryBuilder {
        CodecRegistryBuilder::with_defaults()
    }

    pub fn codec(&self, code: u64) -> Result<&Arc<dyn BlockCodec>, CodecError> {
        self.codecs
            .get(&code)
            .ok_or(CodecError::UnsupportedCodec(code))
    }

    pub fn hasher(&self, code: u64) -> Result<&Arc<dyn MultihashHasher>, CodecError> {
        self.hashers
            .get(&code)
            .ok_or(CodecError::UnsupportedHasher(code))
    }

    pub fn supports_codec(&self, code: u64) -> bool {
        self.codecs.contains_key(&code)
    }

    pub fn supports_hasher(&self, code: u64) -> bool {
        self.hashers.contains_key(&code)
    }

    /// Encode a data-model value and derive its CIDv1
    pub fn encode_value(
        &self,
        value: &Value,
        codec: u64,
        hasher: u64,
    ) -> Result<EncodedBlock, CodecError> {
        let block_codec = self.codec(codec)?;
        // Fail on an unknown hasher before doing any encoding work
        self.hasher(hasher)?;

        let bytes = block_codec.encode(value)?;
        let cid = self.cid_for(&bytes, codec, hasher)?;
        Ok(EncodedBlock { cid, bytes })
    }

    /// Serialize `value` and encode it with the given codec and hasher
    pub fn encode<T: Serialize + ?Sized>(
        &self,
        value: &T,
        codec: u64,
        hasher: u64,
    ) -> Result<EncodedBlock, CodecError> {
        let value = serde_json::to_value(value).map_err(|e| CodecError::Encode(e.to_string()))?;
        self.encode_value(&value, codec, hasher)
    }

    pub fn decode_value(&self, bytes: &[u8], codec: u64) -> Result<Value, CodecError> {
        self.codec(codec)?.decode(bytes)
    }

    /// Decode bytes and deserialize them into `T`. A payload that decodes but
    /// does not fit `T` is reported as malformed.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8], codec: u64) -> Result<T, CodecError> {
        let value = self.decode_value(bytes, codec)?;
        serde_json::from_value(value).map_err(|e| CodecError::MalformedPayload(e.to_string()))
    }

    /// Compute the CIDv1 for already-encoded bytes
    pub fn cid_for(&self, bytes: &[u8], codec: u64, hasher: u64) -> Result<Cid, CodecError> {
        let digest = self.hasher(hasher)?.digest(bytes);
        let mh = Multihash::<64>::wrap(hasher, &digest)
            .map_err(|e| CodecError::Multihash(format!("Failed to create multihash: {}", e)))?;
        Ok(Cid::new_v1(codec, mh))
    }

    /// Check that `bytes` hash to the digest carried by `cid`
    pub fn verify(&self, bytes: &[u8], cid: &Cid) -> Result<(), CodecError> {
        let expected = cid.hash();
        let digest = self.hasher(expected.code())?.digest(bytes);

        if digest.as_slice() != expected.digest() {
            let actual = self.cid_for(bytes, cid.codec(), expected.code())?;
            return Err(CodecError::HashMismatch {
                expected: cid.to_string(),
                actual: actual.to_string(),
            });
        }

        Ok(())
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codecs: Vec<_> = self.codecs.values().map(|c| c.name().to_string()).collect();
        let mut hashers: Vec<_> = self.hashers.values().map(|h| h.name().to_string()).collect();
        codecs.sort();
        hashers.sort();

        f.debug_struct("CodecRegistry")
            .field("codecs", &codecs)
            .field("hashers", &hashers)
            .finish()
    }
}

/// Collects codecs and hashers, rejecting duplicate tags
pub struct CodecRegistryBuilder {
    codecs: HashMap<u64, Arc<dyn BlockCodec>>,
    hashers: HashMap<u64, Arc<dyn MultihashHasher>>,
}

impl CodecRegistryBuilder {
    /// Builder with nothing registered
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
            hashers: HashMap::new(),
        }
    }

    fn with_defaults() -> Self {
        let mut builder = Self::empty();
        let codecs: [Arc<dyn BlockCodec>; 3] =
            [Arc::new(DagJsonCodec), Arc::new(DagPbCodec), Arc::new(DagCborCodec)];
        let hashers: [Arc<dyn MultihashHasher>; 3] = [
            Arc::new(Sha2_256Hasher),
            Arc::new(Sha3_256Hasher),
            Arc::new(Blake3Hasher),
        ];

        for codec in codecs {
            builder.codecs.insert(codec.code(), codec);
        }
        for hasher in hashers {
            builder.hashers.insert(hasher.code(), hasher);
        }
        builder
    }

    pub fn codec(mut self, codec: Arc<dyn BlockCodec>) -> Result<Self, CodecError> {
        let code = codec.code();
        if self.codecs.contains_key(&code) {
            return Err(CodecError::DuplicateCodec(code));
        }
        self.codecs.insert(code, codec);
        Ok(self)
    }

    pub fn hasher(mut self, hasher: Arc<dyn MultihashHasher>) -> Result<Self, CodecError> {
        let code = hasher.code();
        if self.hashers.contains_key(&code) {
            return Err(CodecError::DuplicateHasher(code));
        }
        self.hashers.insert(code, hasher);
        Ok(self)
    }

    /// Register a codec and a hasher together
    pub fn register(
        self,
        codec: Arc<dyn BlockCodec>,
        hasher: Arc<dyn MultihashHasher>,
    ) -> Result<Self, CodecError> {
        self.codec(codec)?.hasher(hasher)
    }

    pub fn build(self) -> CodecRegistry {
        CodecRegistry {
            codecs: self.codecs,
            hashers: self.hashers,
        }
    }
}
