//! ipns-did core
//!
//! Resolution and publishing of `did:ipns` identifiers: DID documents are
//! stored as content-addressed blocks and named by signed IPNS pointer
//! records kept in a Kademlia overlay.

pub mod api;
pub mod codec;
pub mod config;
pub mod content;
pub mod did;
pub mod dnslink;
pub mod document;
pub mod identity;
pub mod method;
pub mod metrics;
pub mod overlay;
pub mod p2p;
pub mod publisher;
pub mod record;
pub mod resolver;
pub mod runtime;
pub mod storage;

pub use codec::{CodecError, CodecRegistry, DAG_CBOR, DAG_JSON, DAG_PB, BLAKE3, SHA2_256, SHA3_256};
pub use config::{Cli, Commands, Config, ConfigError};
pub use content::{ContentError, ContentStore};
pub use did::{identity_from_domain, identity_from_key, Did, DidError, IpnsName};
pub use dnslink::{DnsLinkError, HickoryTxtResolver, MemoryTxtResolver, TxtResolver};
pub use document::{DidDocument, DocumentError};
pub use identity::{generate_keypair, load_keypair, save_keypair, IdentityError, SigningIdentity};
pub use method::IpnsDid;
pub use metrics::Metrics;
pub use overlay::{MemoryOverlay, Overlay, OverlayError};
pub use p2p::{create_swarm, Behaviour, P2PError};
pub use publisher::{PublishError, PublishOptions, PublishOutcome, PublisherConfig};
pub use record::{PointerRecord, RecordError, TargetPath};
pub use resolver::{ResolutionResult, ResolveError, ResolverConfig};
pub use runtime::{open_node, run_node, KadOverlay, Node, NodeError};
pub use storage::{Block, BlockStore, MemoryBlockStore, RocksBlockStore, StorageError};

// Re-export for external use
pub use cid::Cid;
pub use libp2p::identity::Keypair;
