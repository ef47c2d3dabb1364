//! Signing identities
//!
//! Pointer records are signed by the key that owns the IPNS name. The core
//! only needs three things from a key: its public half, a way to sign bytes,
//! and the stable CID it is published under. libp2p keypairs provide all of
//! them; node keys are persisted as protobuf-encoded keypairs.

use cid::Cid;
use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::did::{identity_from_key, peer_id_to_cid};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Invalid key file: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A key able to sign pointer records
pub trait SigningIdentity: Send + Sync {
    fn public_key(&self) -> PublicKey;

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, IdentityError>;

    fn peer_id(&self) -> PeerId {
        self.public_key().to_peer_id()
    }

    /// CID identifying this key in the overlay
    fn key_cid(&self) -> Cid {
        peer_id_to_cid(&self.peer_id())
    }

    /// `did:ipns` DID controlled by this key
    fn did(&self) -> String {
        identity_from_key(&self.peer_id())
    }
}

impl SigningIdentity for Keypair {
    fn public_key(&self) -> PublicKey {
        self.public()
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, IdentityError> {
        Keypair::sign(self, msg).map_err(|e| IdentityError::Signing(e.to_string()))
    }
}

/// Fresh keypair of the named type (`ed25519` or `secp256k1`)
pub fn generate_keypair(key_type: &str) -> Result<Keypair, IdentityError> {
    match key_type {
        "ed25519" => Ok(Keypair::generate_ed25519()),
        "secp256k1" => Ok(Keypair::generate_secp256k1()),
        other => Err(IdentityError::InvalidKey(format!("unsupported key type {}", other))),
    }
}

pub fn load_keypair(path: &Path) -> Result<Keypair, IdentityError> {
    let bytes = std::fs::read(path)?;
    Keypair::from_protobuf_encoding(&bytes).map_err(|e| IdentityError::InvalidKey(e.to_string()))
}

/// Load a keypair from `path`, generating and saving an ed25519 key if the
/// file does not exist yet
pub fn load_or_generate_keypair(path: &Path) -> Result<Keypair, IdentityError> {
    if path.exists() {
        let keypair = load_keypair(path)?;
        info!("Loaded identity {} from {:?}", keypair.public().to_peer_id(), path);
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    save_keypair(&keypair, path)?;
    info!("Generated identity {} at {:?}", keypair.public().to_peer_id(), path);
    Ok(keypair)
}

pub fn save_keypair(keypair: &Keypair, path: &Path) -> Result<(), IdentityError> {
    let bytes = keypair
        .to_protobuf_encoding()
        .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    Ok(())
}
