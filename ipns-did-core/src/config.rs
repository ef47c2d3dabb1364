//! Configuration management
//!
//! Handles CLI argument parsing, config file loading, and defaults.
//! Precedence: CLI flags, then the `--config` TOML file, then defaults.

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::codec::{BLAKE3, DAG_CBOR, DAG_JSON, DAG_PB, SHA2_256, SHA3_256};
use crate::publisher::{PublishOptions, PublisherConfig};
use crate::resolver::ResolverConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug)]
#[command(name = "ipns-did")]
#[command(about = "Resolve and publish did:ipns identity documents", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a DHT node with the HTTP resolver/publisher API
    Serve(NodeArgs),

    /// Resolve a did:ipns DID and print the resolution result as JSON
    Resolve(ResolveCommand),

    /// Publish a DID document (or a redirect) signed with the node key
    Publish(PublishCommand),

    /// Print the DID controlled by a key file
    DidFromKey(DidFromKeyCommand),

    /// Print the DID for a DNS domain
    DidFromDomain(DidFromDomainCommand),

    /// Generate a key file and print its DID
    Keygen(KeygenCommand),
}

/// Options shared by every command that runs a node
#[derive(Args, Debug, Clone, Default)]
pub struct NodeArgs {
    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Data directory for the block store and node key
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// TCP port for P2P transport
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// HTTP port for REST API
    #[arg(long)]
    pub api_port: Option<u16>,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Bootstrap node multiaddr (can be specified multiple times)
    #[arg(long = "bootstrap-node")]
    pub bootstrap_nodes: Vec<String>,

    /// Seconds to wait for the overlay to answer a lookup
    #[arg(long)]
    pub lookup_timeout_secs: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct ResolveCommand {
    /// DID or DID URL to resolve
    pub did: String,

    #[command(flatten)]
    pub node: NodeArgs,

    /// Longest chain of IPNS redirects to follow
    #[arg(long)]
    pub max_redirects: Option<usize>,

    /// Resolve to expired records instead of skipping them
    #[arg(long)]
    pub accept_expired: bool,
}

#[derive(Args, Debug, Clone)]
pub struct PublishCommand {
    /// JSON file holding the DID document
    #[arg(required_unless_present = "target")]
    pub document: Option<PathBuf>,

    /// Point the DID at an existing path (`/ipfs/<cid>` or `/ipns/<name>`)
    /// instead of publishing a document
    #[arg(long, conflicts_with = "document")]
    pub target: Option<String>,

    #[command(flatten)]
    pub node: NodeArgs,

    /// Document codec: dag-cbor, dag-json, dag-pb or a hex multicodec
    #[arg(long)]
    pub codec: Option<String>,

    /// Hash function: sha2-256, sha3-256, blake3 or a hex multihash code
    #[arg(long)]
    pub hasher: Option<String>,

    /// Seconds the record stays valid
    #[arg(long)]
    pub validity_secs: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct DidFromKeyCommand {
    /// Key file; defaults to the node key in the data directory
    #[arg(long)]
    pub key: Option<PathBuf>,

    #[command(flatten)]
    pub node: NodeArgs,
}

#[derive(Args, Debug, Clone)]
pub struct DidFromDomainCommand {
    pub domain: String,
}

#[derive(Args, Debug, Clone)]
pub struct KeygenCommand {
    /// Where to write the key
    #[arg(long)]
    pub out: PathBuf,

    /// Key type: ed25519 or secp256k1
    #[arg(long, default_value = "ed25519")]
    pub key_type: String,

    /// Overwrite an existing key file
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub listen_port: u16,
    pub api_port: u16,
    pub log_level: String,
    pub bootstrap_nodes: Vec<String>,
    pub lookup_timeout_secs: u64,
    pub max_redirects: usize,
    pub accept_expired: bool,
    pub recheck_sequence: bool,
    /// Validity of published records, in seconds
    pub validity_secs: u64,
    pub codec: String,
    pub hasher: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            listen_port: 4001,
            api_port: 8080,
            log_level: "info".to_string(),
            bootstrap_nodes: Vec::new(),
            lookup_timeout_secs: 30,
            max_redirects: 8,
            accept_expired: false,
            recheck_sequence: false,
            validity_secs: 24 * 60 * 60,
            codec: "dag-cbor".to_string(),
            hasher: "sha2-256".to_string(),
        }
    }
}

impl Config {
    /// Load config from TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Build the effective config for a command: file (or defaults) with
    /// CLI flags on top
    pub fn from_args(args: &NodeArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };

        if let Some(data_dir) = &args.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(port) = args.listen_port {
            config.listen_port = port;
        }
        if let Some(port) = args.api_port {
            config.api_port = port;
        }
        if let Some(level) = &args.log_level {
            config.log_level = level.clone();
        }
        if !args.bootstrap_nodes.is_empty() {
            config.bootstrap_nodes = args.bootstrap_nodes.clone();
        }
        if let Some(secs) = args.lookup_timeout_secs {
            config.lookup_timeout_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lookup_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "lookup_timeout_secs must be positive".to_string(),
            ));
        }
        if self.validity_secs == 0 {
            return Err(ConfigError::Invalid("validity_secs must be positive".to_string()));
        }
        self.publish_options()?;
        Ok(())
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    /// Journal of pointer records this node published
    pub fn records_dir(&self) -> PathBuf {
        self.data_dir.join("records")
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join("identity.key")
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }

    pub fn validity(&self) -> Duration {
        Duration::from_secs(self.validity_secs)
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            max_redirects: self.max_redirects,
            lookup_timeout: self.lookup_timeout(),
            accept_expired: self.accept_expired,
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            lookup_timeout: self.lookup_timeout(),
            recheck_sequence: self.recheck_sequence,
        }
    }

    pub fn publish_options(&self) -> Result<PublishOptions, ConfigError> {
        Ok(PublishOptions {
            codec: parse_codec(&self.codec)?,
            hasher: parse_hasher(&self.hasher)?,
        })
    }
}

/// Codec by name, or by multicodec tag written as hex (`0x71`)
pub fn parse_codec(name: &str) -> Result<u64, ConfigError> {
    match name {
        "dag-cbor" => Ok(DAG_CBOR),
        "dag-json" => Ok(DAG_JSON),
        "dag-pb" => Ok(DAG_PB),
        other => parse_hex(other)
            .ok_or_else(|| ConfigError::Invalid(format!("Unknown codec: {}", other))),
    }
}

/// Hash function by name, or by multihash code written as hex (`0x12`)
pub fn parse_hasher(name: &str) -> Result<u64, ConfigError> {
    match name {
        "sha2-256" => Ok(SHA2_256),
        "sha3-256" => Ok(SHA3_256),
        "blake3" => Ok(BLAKE3),
        other => parse_hex(other)
            .ok_or_else(|| ConfigError::Invalid(format!("Unknown hasher: {}", other))),
    }
}

fn parse_hex(s: &str) -> Option<u64> {
    s.strip_prefix("0x")
        .and_then(|hex| u64::from_str_radix(hex, 16).ok())
}
