//! Async runtime and event loop for the node
//!
//! The swarm runs in its own task. The rest of the crate reaches its DHT
//! through `KadOverlay`, a cloneable handle that sends commands over a
//! channel; lookups stream records back as the query progresses. Records
//! the node publishes are journaled so a restarted node announces them again.

use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::stream::{self, StreamExt};
use libp2p::identity::Keypair;
use libp2p::{identify, kad, swarm::SwarmEvent, Multiaddr, PeerId, Swarm};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{create_router, ApiState};
use crate::codec::CodecRegistry;
use crate::config::{Config, ConfigError};
use crate::dnslink::HickoryTxtResolver;
use crate::identity::{load_or_generate_keypair, IdentityError, SigningIdentity};
use crate::method::IpnsDid;
use crate::metrics::Metrics;
use crate::overlay::{CandidateStream, Overlay, OverlayError};
use crate::p2p::{create_swarm, parse_bootstrap_addr, Behaviour, BehaviourEvent, P2PError};
use crate::storage::{RecordJournal, RocksBlockStore, StorageError};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    P2P(#[from] P2PError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

type Candidates = mpsc::UnboundedSender<Result<Vec<u8>, OverlayError>>;

enum Command {
    Get {
        key: String,
        results: Candidates,
    },
    Put {
        key: String,
        value: Vec<u8>,
        reply: oneshot::Sender<Result<(), OverlayError>>,
    },
    /// Reply once no replication query is outstanding
    Flush {
        reply: oneshot::Sender<()>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
}

fn stopped() -> OverlayError {
    OverlayError::Unavailable("overlay node is not running".to_string())
}

/// Handle to a running node's Kademlia DHT
#[derive(Clone)]
pub struct KadOverlay {
    commands: mpsc::UnboundedSender<Command>,
    journal: Option<Arc<RecordJournal>>,
}

impl KadOverlay {
    /// Addresses the node is currently listening on
    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>, OverlayError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .unbounded_send(Command::ListenAddrs { reply })
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Wait until every record put so far has finished replicating
    ///
    /// Replication may still have reached fewer peers than hoped; this only
    /// guarantees the queries are over.
    pub async fn flush(&self) -> Result<(), OverlayError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .unbounded_send(Command::Flush { reply })
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }
}

#[async_trait]
impl Overlay for KadOverlay {
    fn get(&self, key: &str) -> CandidateStream {
        let (results, rx) = mpsc::unbounded();
        let command = Command::Get {
            key: key.to_string(),
            results,
        };

        if self.commands.unbounded_send(command).is_err() {
            return stream::once(async { Err(stopped()) }).boxed();
        }
        rx.boxed()
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), OverlayError> {
        if let Some(journal) = &self.journal {
            journal.put(key, value.clone()).await.map_err(|e| {
                OverlayError::Unavailable(format!("failed to journal record {}: {}", key, e))
            })?;
        }

        let (reply, rx) = oneshot::channel();
        self.commands
            .unbounded_send(Command::Put {
                key: key.to_string(),
                value,
                reply,
            })
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }
}

struct EventLoop {
    swarm: Swarm<Behaviour>,
    commands: mpsc::UnboundedReceiver<Command>,
    pending_gets: HashMap<kad::QueryId, Candidates>,
    pending_puts: HashMap<kad::QueryId, String>,
    flush_waiters: Vec<oneshot::Sender<()>>,
    metrics: Metrics,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.commands.next() => match command {
                    Some(command) => self.handle_command(command),
                    // Every handle is gone
                    None => break,
                },
            }
        }

        for (_, results) in self.pending_gets.drain() {
            let _ = results.unbounded_send(Err(stopped()));
        }
        info!("Overlay node stopped");
    }

    fn put_record(&mut self, key: String, value: Vec<u8>) -> Result<(), OverlayError> {
        let record = kad::Record::new(kad::RecordKey::new(&key), value);
        let id = self
            .swarm
            .behaviour_mut()
            .kad
            .put_record(record, kad::Quorum::One)
            .map_err(|e| {
                OverlayError::Unavailable(format!("local record store rejected {}: {}", key, e))
            })?;

        debug!("Replicating {} (query {:?})", key, id);
        self.pending_puts.insert(id, key);
        Ok(())
    }

    fn finish_put(&mut self, id: &kad::QueryId) {
        if self.pending_puts.remove(id).is_some() && self.pending_puts.is_empty() {
            for waiter in self.flush_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Get { key, results } => {
                let id = self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .get_record(kad::RecordKey::new(&key));
                debug!("Looking up {} (query {:?})", key, id);
                self.pending_gets.insert(id, results);
            }
            Command::Put { key, value, reply } => {
                let _ = reply.send(self.put_record(key, value));
            }
            Command::Flush { reply } => {
                if self.pending_puts.is_empty() {
                    let _ = reply.send(());
                } else {
                    self.flush_waiters.push(reply);
                }
            }
            Command::ListenAddrs { reply } => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                info!(
                    "Connected to peer: {} at {}",
                    peer_id,
                    endpoint.get_remote_address()
                );
                self.metrics.peer_connected();
            }
            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                debug!("Connection closed with {}: {:?}", peer_id, cause);
                self.metrics.peer_disconnected();
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                warn!("Outgoing connection error to {:?}: {}", peer_id, error);
            }
            SwarmEvent::IncomingConnectionError {
                send_back_addr,
                error,
                ..
            } => {
                warn!(
                    "Incoming connection error from {}: {}",
                    send_back_addr, error
                );
            }
            SwarmEvent::Behaviour(BehaviourEvent::Identify(event)) => {
                if let identify::Event::Received { peer_id, info, .. } = *event {
                    // Identified peers become routable for DHT queries
                    for addr in info.listen_addrs {
                        self.swarm.behaviour_mut().kad.add_address(&peer_id, addr);
                    }
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Kad(event)) => self.handle_kad_event(event),
            SwarmEvent::Behaviour(BehaviourEvent::Ping(_)) => {}
            _ => {}
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        let kad::Event::OutboundQueryProgressed {
            id, result, step, ..
        } = event
        else {
            return;
        };

        match result {
            kad::QueryResult::GetRecord(Ok(kad::GetRecordOk::FoundRecord(found))) => {
                debug!("Record found (peer {:?}, query {:?})", found.peer, id);
                if let Some(results) = self.pending_gets.get(&id) {
                    let _ = results.unbounded_send(Ok(found.record.value));
                }
                if step.last {
                    self.pending_gets.remove(&id);
                }
            }
            kad::QueryResult::GetRecord(Ok(kad::GetRecordOk::FinishedWithNoAdditionalRecord {
                ..
            })) => {
                self.pending_gets.remove(&id);
            }
            kad::QueryResult::GetRecord(Err(e)) => {
                // Not found and timeouts end the candidate stream; neither is a failure
                debug!("Lookup {:?} ended: {:?}", id, e);
                self.pending_gets.remove(&id);
            }
            kad::QueryResult::PutRecord(result) => {
                match result {
                    Ok(ok) => debug!("Record {:?} replicated", ok.key),
                    Err(e) => warn!("Record replication incomplete: {:?}", e),
                }
                if step.last {
                    self.finish_put(&id);
                }
            }
            kad::QueryResult::Bootstrap(Ok(ok)) => {
                debug!("Bootstrap step, {} buckets remaining", ok.num_remaining);
            }
            kad::QueryResult::Bootstrap(Err(e)) => {
                warn!("Bootstrap failed: {:?}", e);
            }
            _ => {}
        }
    }
}

/// A swarm task plus the handle that talks to it
pub struct OverlayNode {
    pub peer_id: PeerId,
    overlay: KadOverlay,
    task: JoinHandle<()>,
}

impl OverlayNode {
    pub fn overlay(&self) -> KadOverlay {
        self.overlay.clone()
    }

    /// Stop the swarm; outstanding and later calls on its handles fail
    /// with `Unavailable`
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }

    /// Let pending record replication finish, then stop
    pub async fn shutdown(self) {
        if let Err(e) = self.overlay.flush().await {
            warn!("Stopping before replication finished: {}", e);
        }
        self.stop().await;
    }
}

/// Start a DHT node listening on `config.listen_port` and dialing the
/// configured bootstrap peers
///
/// Records in `journal` are announced again right away, and every later
/// `put` is journaled before it reaches the DHT.
pub async fn start_overlay_node(
    keypair: Keypair,
    config: &Config,
    metrics: Metrics,
    journal: Option<Arc<RecordJournal>>,
) -> Result<OverlayNode, NodeError> {
    let peer_id = keypair.public().to_peer_id();
    let mut swarm = create_swarm(keypair, config.lookup_timeout())?;

    let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.listen_port)
        .parse()
        .map_err(|e| P2PError::Transport(format!("Invalid listen address: {}", e)))?;
    swarm
        .listen_on(listen_addr)
        .map_err(|e| P2PError::Transport(format!("Failed to listen: {}", e)))?;

    for addr in &config.bootstrap_nodes {
        let (peer, multiaddr) = parse_bootstrap_addr(addr)?;
        swarm.behaviour_mut().kad.add_address(&peer, multiaddr.clone());
        if let Err(e) = swarm.dial(multiaddr) {
            warn!("Failed to dial bootstrap node {}: {}", addr, e);
        }
    }
    if !config.bootstrap_nodes.is_empty() {
        if let Err(e) = swarm.behaviour_mut().kad.bootstrap() {
            warn!("DHT bootstrap not started: {:?}", e);
        }
    }

    let (commands, rx) = mpsc::unbounded();
    let mut event_loop = EventLoop {
        swarm,
        commands: rx,
        pending_gets: HashMap::new(),
        pending_puts: HashMap::new(),
        flush_waiters: Vec::new(),
        metrics,
    };

    if let Some(journal) = &journal {
        let records = journal.load()?;
        if !records.is_empty() {
            info!("Re-announcing {} published records", records.len());
        }
        for (key, value) in records {
            if let Err(e) = event_loop.put_record(key, value) {
                warn!("Failed to re-announce record: {}", e);
            }
        }
    }

    let task = tokio::spawn(event_loop.run());

    info!("Node started with peer ID: {}", peer_id);
    info!("Listening on TCP port {}", config.listen_port);

    Ok(OverlayNode {
        peer_id,
        overlay: KadOverlay { commands, journal },
        task,
    })
}

/// Everything a command needs: node key, DID method over RocksDB and the DHT
pub struct Node {
    pub identity: Arc<Keypair>,
    pub method: Arc<IpnsDid>,
    pub metrics: Metrics,
    pub overlay_node: OverlayNode,
}

pub async fn open_node(config: &Config) -> Result<Node, NodeError> {
    let identity = load_or_generate_keypair(&config.key_path())?;
    let blocks = Arc::new(RocksBlockStore::open(config.blocks_dir())?);
    let journal = Arc::new(RecordJournal::open(config.records_dir())?);
    let metrics = Metrics::new();

    let overlay_node =
        start_overlay_node(identity.clone(), config, metrics.clone(), Some(journal)).await?;
    let method = IpnsDid::new(
        Arc::new(CodecRegistry::new()),
        blocks,
        Arc::new(overlay_node.overlay()),
        config.resolver_config(),
        config.publisher_config(),
    )
    .with_dns(Arc::new(HickoryTxtResolver::from_system_conf()))
    .with_metrics(metrics.clone());

    Ok(Node {
        identity: Arc::new(identity),
        method: Arc::new(method),
        metrics,
        overlay_node,
    })
}

/// Run the node and its HTTP API until Ctrl+C
pub async fn run_node(config: Config) -> Result<(), NodeError> {
    let node = open_node(&config).await?;
    info!("Node DID: {}", node.identity.did());

    let state = ApiState {
        method: node.method.clone(),
        identity: node.identity.clone(),
        options: config.publish_options()?,
        validity: config.validity(),
    };
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API listening on {}", addr);

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Received Ctrl+C, shutting down...");
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    node.overlay_node.shutdown().await;
    info!("Node stopped");
    Ok(())
}
