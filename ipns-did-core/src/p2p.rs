//! P2P networking layer using rust-libp2p
//!
//! TCP transport, Noise encryption and Mplex multiplexing, with Ping,
//! Identify and a Kademlia DHT that stores pointer records.

use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::{identify, kad, noise, ping, tcp, Multiaddr, PeerId, Swarm, SwarmBuilder};
use libp2p_mplex as mplex;
use std::time::Duration;
use thiserror::Error;

/// Identify protocol version announced to peers
pub const PROTOCOL_VERSION: &str = "/ipns-did/1.0.0";

#[derive(Error, Debug)]
pub enum P2PError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Swarm error: {0}")]
    Swarm(String),

    #[error("Invalid bootstrap address {0}: {1}")]
    InvalidBootstrap(String, String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network behaviour: keep-alive, peer info exchange and the record DHT
#[derive(libp2p::swarm::NetworkBehaviour)]
#[behaviour(to_swarm = "BehaviourEvent")]
pub struct Behaviour {
    pub ping: ping::Behaviour,
    pub identify: identify::Behaviour,
    pub kad: kad::Behaviour<kad::store::MemoryStore>,
}

#[derive(Debug)]
pub enum BehaviourEvent {
    Ping(ping::Event),
    Identify(Box<identify::Event>),
    Kad(kad::Event),
}

impl From<ping::Event> for BehaviourEvent {
    fn from(event: ping::Event) -> Self {
        BehaviourEvent::Ping(event)
    }
}

impl From<identify::Event> for BehaviourEvent {
    fn from(event: identify::Event) -> Self {
        BehaviourEvent::Identify(Box::new(event))
    }
}

impl From<kad::Event> for BehaviourEvent {
    fn from(event: kad::Event) -> Self {
        BehaviourEvent::Kad(event)
    }
}

/// Create a swarm for `keypair` with the DHT in server mode
pub fn create_swarm(
    keypair: Keypair,
    query_timeout: Duration,
) -> Result<Swarm<Behaviour>, P2PError> {
    let peer_id = PeerId::from(keypair.public());
    tracing::info!("Local peer ID: {}", peer_id);

    // Build swarm with TCP transport, Noise security, and Mplex multiplexing
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            mplex::MplexConfig::default,
        )
        .map_err(|e| P2PError::Transport(e.to_string()))?
        .with_behaviour(|key| {
            let mut kad_config = kad::Config::new(kad::PROTOCOL_NAME);
            kad_config.set_query_timeout(query_timeout);

            let mut kad = kad::Behaviour::with_config(
                peer_id,
                kad::store::MemoryStore::new(peer_id),
                kad_config,
            );
            kad.set_mode(Some(kad::Mode::Server));

            Behaviour {
                ping: ping::Behaviour::new(ping::Config::new()),
                identify: identify::Behaviour::new(identify::Config::new(
                    PROTOCOL_VERSION.to_string(),
                    key.public(),
                )),
                kad,
            }
        })
        .map_err(|e| P2PError::Swarm(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    Ok(swarm)
}

/// Split `/ip4/.../tcp/.../p2p/<peer>` into the peer and its address
pub fn parse_bootstrap_addr(addr: &str) -> Result<(PeerId, Multiaddr), P2PError> {
    let invalid = |reason: &str| P2PError::InvalidBootstrap(addr.to_string(), reason.to_string());

    let multiaddr: Multiaddr = addr
        .parse()
        .map_err(|e: libp2p::multiaddr::Error| invalid(&e.to_string()))?;
    match multiaddr.iter().last() {
        Some(Protocol::P2p(peer_id)) => Ok((peer_id, multiaddr)),
        _ => Err(invalid("missing /p2p/<peer id> suffix")),
    }
}
