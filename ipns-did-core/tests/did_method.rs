//! End-to-end publishing and resolution over in-process stores

use chrono::{Duration as ChronoDuration, Utc};
use ipns_did_core::codec::{DAG_JSON, SHA3_256};
use ipns_did_core::identity::SigningIdentity;
use ipns_did_core::record::{build_record, build_record_with_eol, DEFAULT_TTL};
use ipns_did_core::{
    identity_from_domain, DidDocument, IpnsDid, IpnsName, Keypair, MemoryBlockStore,
    MemoryOverlay, MemoryTxtResolver, PublishOptions, ResolveError, RocksBlockStore, TargetPath,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

const VALIDITY: Duration = Duration::from_secs(3600);

/// Initialize tracing for tests
fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

fn memory_method(overlay: Arc<MemoryOverlay>) -> IpnsDid {
    IpnsDid::with_defaults(Arc::new(MemoryBlockStore::new()), overlay)
}

#[tokio::test]
async fn test_publish_update_resolve() {
    init_tracing();

    let overlay = Arc::new(MemoryOverlay::new());
    let method = memory_method(overlay.clone());
    let keypair = Keypair::generate_ed25519();
    let did = keypair.did();

    let first = method
        .publish(&DidDocument::new(did.clone()), PublishOptions::default(), &keypair, VALIDITY)
        .await
        .unwrap();
    assert_eq!(first.sequence, 0);

    let mut updated = DidDocument::new(did.clone());
    updated.also_known_as.push("https://example.com/alice".to_string());
    let second = method
        .publish(&updated, PublishOptions::default(), &keypair, VALIDITY)
        .await
        .unwrap();
    assert_eq!(second.sequence, 1);
    assert_ne!(first.content_id, second.content_id);
    let key = IpnsName::from_peer_id(&keypair.peer_id()).record_key();
    assert_eq!(overlay.replicas(&key).len(), 2);

    let resolved = method.resolve(&did).await.unwrap();
    assert_eq!(resolved.did_document, updated);
    assert_eq!(resolved.did_document_metadata.sequence, Some(1));
    assert_eq!(resolved.did_document_metadata.cid, second.content_id.to_string());
}

#[tokio::test]
async fn test_co_equal_sequences_prefer_later_validity() {
    let overlay = Arc::new(MemoryOverlay::new());
    let method = memory_method(overlay.clone());
    let keypair = Keypair::generate_ed25519();
    let did = keypair.did();
    let key = IpnsName::from_peer_id(&keypair.peer_id()).record_key();

    let short_lived = method
        .publish_value(&DidDocument::new(format!("{}#short", did)), DAG_JSON, SHA3_256)
        .await
        .unwrap();
    let long_lived = method
        .publish_value(&DidDocument::new(format!("{}#long", did)), DAG_JSON, SHA3_256)
        .await
        .unwrap();

    let now = Utc::now();
    let long = build_record_with_eol(
        &TargetPath::Content(long_lived),
        4,
        now + ChronoDuration::hours(2),
        DEFAULT_TTL,
        &keypair,
    )
    .unwrap();
    let short = build_record_with_eol(
        &TargetPath::Content(short_lived),
        4,
        now + ChronoDuration::hours(1),
        DEFAULT_TTL,
        &keypair,
    )
    .unwrap();
    overlay.insert_replica(&key, long);
    overlay.insert_replica(&key, short);

    let resolved = method.resolve(&did).await.unwrap();
    assert_eq!(resolved.did_document.id, format!("{}#long", did));
    assert_eq!(
        resolved.did_resolution_metadata.content_type,
        "application/vnd.ipld.dag-json"
    );
}

#[tokio::test]
async fn test_domain_follows_dnslink_not_overlay_records() {
    let overlay = Arc::new(MemoryOverlay::new());
    let dns = Arc::new(MemoryTxtResolver::new());
    let method = memory_method(overlay.clone()).with_dns(dns.clone());
    let owner = Keypair::generate_ed25519();
    let intruder = Keypair::generate_ed25519();

    method
        .publish(&DidDocument::new(owner.did()), PublishOptions::default(), &owner, VALIDITY)
        .await
        .unwrap();
    method
        .publish(
            &DidDocument::new(intruder.did()),
            PublishOptions::default(),
            &intruder,
            VALIDITY,
        )
        .await
        .unwrap();

    // Anyone can sign a record under the domain's overlay key
    let domain: IpnsName = "example.com".parse().unwrap();
    let hijack = build_record(
        &TargetPath::Name(IpnsName::from_peer_id(&intruder.peer_id())),
        99,
        VALIDITY,
        &intruder,
    )
    .unwrap();
    overlay.insert_replica(&domain.record_key(), hijack);

    let did = identity_from_domain("example.com");
    assert!(matches!(
        method.resolve(&did).await,
        Err(ResolveError::RecordNotFound(_))
    ));

    dns.link(
        "example.com",
        &TargetPath::Name(IpnsName::from_peer_id(&owner.peer_id())),
    );
    let resolved = method.resolve(&did).await.unwrap();
    assert_eq!(resolved.did_document.id, owner.did());
    assert_eq!(resolved.did_resolution_metadata.redirects, 1);
}

#[tokio::test]
async fn test_pointer_chain_between_keys() {
    let overlay = Arc::new(MemoryOverlay::new());
    let method = memory_method(overlay);
    let alias = Keypair::generate_ed25519();
    let owner = Keypair::generate_ed25519();

    method
        .publish(&DidDocument::new(owner.did()), PublishOptions::default(), &owner, VALIDITY)
        .await
        .unwrap();
    let update = method
        .publish_pointer(
            &TargetPath::Name(IpnsName::from_peer_id(&owner.peer_id())),
            &alias,
            VALIDITY,
        )
        .await
        .unwrap();
    assert_eq!(update.sequence, 0);

    let resolved = method.resolve(&alias.did()).await.unwrap();
    assert_eq!(resolved.did_document.id, owner.did());
    assert_eq!(resolved.did_resolution_metadata.redirects, 1);
}

#[tokio::test]
async fn test_rocksdb_blocks_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let overlay = Arc::new(MemoryOverlay::new());
    let keypair = Keypair::generate_ed25519();

    {
        let blocks = Arc::new(RocksBlockStore::open(dir.path()).unwrap());
        let method = IpnsDid::with_defaults(blocks, overlay.clone());
        method
            .publish(
                &DidDocument::new(keypair.did()),
                PublishOptions::default(),
                &keypair,
                VALIDITY,
            )
            .await
            .unwrap();
    }

    let blocks = Arc::new(RocksBlockStore::open(dir.path()).unwrap());
    let method = IpnsDid::with_defaults(blocks, overlay);
    let resolved = method.resolve(&keypair.did()).await.unwrap();
    assert_eq!(resolved.did_document.id, keypair.did());
}

#[tokio::test]
async fn test_record_without_content_is_not_found() {
    let overlay = Arc::new(MemoryOverlay::new());
    let keypair = Keypair::generate_ed25519();

    let publisher = memory_method(overlay.clone());
    publisher
        .publish(&DidDocument::new(keypair.did()), PublishOptions::default(), &keypair, VALIDITY)
        .await
        .unwrap();

    // Same overlay, empty block store
    let resolver = memory_method(overlay);
    assert!(matches!(
        resolver.resolve(&keypair.did()).await,
        Err(ResolveError::ContentNotFound(_))
    ));
}
