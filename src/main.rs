//! ipns-did - resolve and publish did:ipns identity documents
//!
//! Runs a libp2p DHT node with an HTTP resolver API, or performs a single
//! resolve/publish against the network from the command line.

use clap::Parser;
use ipns_did_core::config::{
    parse_codec, parse_hasher, DidFromKeyCommand, KeygenCommand, NodeArgs, PublishCommand,
    ResolveCommand,
};
use ipns_did_core::identity::SigningIdentity;
use ipns_did_core::{
    generate_keypair, identity_from_domain, load_keypair, open_node, run_node, save_keypair, Cli,
    Commands, Config, DidDocument, TargetPath,
};
use std::error::Error;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let config = Config::from_args(&args)?;
            init_logging(&config.log_level);
            tracing::info!("Starting ipns-did node...");
            run_node(config).await?;
        }
        Commands::Resolve(cmd) => resolve(cmd).await?,
        Commands::Publish(cmd) => publish(cmd).await?,
        Commands::DidFromKey(cmd) => did_from_key(cmd)?,
        Commands::DidFromDomain(cmd) => println!("{}", identity_from_domain(&cmd.domain)),
        Commands::Keygen(cmd) => keygen(cmd)?,
    }

    Ok(())
}

/// Config for a one-shot command: an ephemeral P2P port unless one is given
fn command_config(args: &NodeArgs) -> Result<Config, Box<dyn Error>> {
    let mut config = Config::from_args(args)?;
    if args.listen_port.is_none() {
        config.listen_port = 0;
    }
    init_logging(args.log_level.as_deref().unwrap_or("warn"));
    Ok(config)
}

async fn resolve(cmd: ResolveCommand) -> Result<(), Box<dyn Error>> {
    let mut config = command_config(&cmd.node)?;
    if let Some(max) = cmd.max_redirects {
        config.max_redirects = max;
    }
    config.accept_expired |= cmd.accept_expired;

    let node = open_node(&config).await?;
    let result = node.method.resolve(&cmd.did).await;
    node.overlay_node.stop().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn publish(cmd: PublishCommand) -> Result<(), Box<dyn Error>> {
    let mut config = command_config(&cmd.node)?;
    if let Some(secs) = cmd.validity_secs {
        config.validity_secs = secs;
    }
    let mut options = config.publish_options()?;
    if let Some(codec) = &cmd.codec {
        options.codec = parse_codec(codec)?;
    }
    if let Some(hasher) = &cmd.hasher {
        options.hasher = parse_hasher(hasher)?;
    }
    let validity = Duration::from_secs(config.validity_secs);

    let node = open_node(&config).await?;
    let did = node.identity.did();

    let output = match (&cmd.target, &cmd.document) {
        (Some(target), _) => {
            let target = TargetPath::parse(target)?;
            node.method
                .publish_pointer(&target, node.identity.as_ref(), validity)
                .await
                .map(|update| {
                    serde_json::json!({
                        "did": did,
                        "target": target.to_string(),
                        "pointerKeyId": update.pointer_key_id.to_string(),
                        "sequence": update.sequence,
                    })
                })
        }
        (None, Some(path)) => {
            let document: DidDocument = serde_json::from_slice(&std::fs::read(path)?)?;
            node.method
                .publish(&document, options, node.identity.as_ref(), validity)
                .await
                .map(|outcome| {
                    serde_json::json!({
                        "did": did,
                        "contentId": outcome.content_id.to_string(),
                        "pointerKeyId": outcome.pointer_key_id.to_string(),
                        "sequence": outcome.sequence,
                    })
                })
        }
        (None, None) => unreachable!("clap requires a document or --target"),
    };
    // Give the record a chance to reach peers before the process exits
    node.overlay_node.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&output?)?);
    Ok(())
}

fn did_from_key(cmd: DidFromKeyCommand) -> Result<(), Box<dyn Error>> {
    let path = match cmd.key {
        Some(path) => path,
        None => Config::from_args(&cmd.node)?.key_path(),
    };
    let keypair = load_keypair(&path)?;
    println!("{}", keypair.did());
    Ok(())
}

fn keygen(cmd: KeygenCommand) -> Result<(), Box<dyn Error>> {
    if cmd.out.exists() && !cmd.force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            cmd.out.display()
        )
        .into());
    }
    let keypair = generate_keypair(&cmd.key_type)?;
    save_keypair(&keypair, &cmd.out)?;
    println!("{}", keypair.did());
    Ok(())
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
