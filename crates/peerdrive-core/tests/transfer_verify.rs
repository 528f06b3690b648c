//! Download verification: the byte-count and content-hash checks must
//! reject transfers whose payload does not match what the peer's index
//! advertises, not just pass correct data through.
//!
//! The harness runs the index manager against a real blob provider
//! endpoint, with the peer's "index" forged locally so the advertised
//! record can disagree with the served bytes.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use peerdrive_core::config::{IndexOptions, NodeConfig};
use peerdrive_core::events::EVENT_CHANNEL_CAPACITY;
use peerdrive_core::hashing;
use peerdrive_core::index::{IndexManager, LinkFuture, TransferLinks};
use peerdrive_core::journal::{derive_signing_key, Journal, LOCAL_INDEX_LOG};
use peerdrive_core::net::Swarm;
use peerdrive_core::types::{BlobId, FileRecord, TransferRef};
use peerdrive_core::{BlobStore, LocalIndex, NodeError, NodeEvent, TransferTable};
use tokio::sync::broadcast;

/// A peer that only serves blobs.
struct Provider {
    endpoint: iroh::Endpoint,
    _router: iroh::protocol::Router,
    store: BlobStore,
}

async fn spawn_provider() -> Result<Provider> {
    let store = BlobStore::new_memory();
    let endpoint = iroh::Endpoint::builder()
        .alpns(vec![iroh_blobs::ALPN.to_vec()])
        .bind()
        .await?;
    let router = iroh::protocol::Router::builder(endpoint.clone())
        .accept(iroh_blobs::ALPN, store.protocol())
        .spawn();
    Ok(Provider {
        endpoint,
        _router: router,
        store,
    })
}

struct Harness {
    manager: IndexManager,
    events: broadcast::Receiver<NodeEvent>,
    watch: tempfile::TempDir,
    _store: tempfile::TempDir,
    _swarm: Swarm,
}

async fn spawn_manager(provider_addr: iroh::EndpointAddr) -> Result<Harness> {
    let watch = tempfile::tempdir()?;
    let store_dir = tempfile::tempdir()?;

    let swarm = Swarm::bind(iroh::SecretKey::generate(&mut rand::rng())).await?;
    swarm.add_peer_addr(provider_addr);

    let journal = Journal::open(store_dir.path())?;
    let log = journal.open_log(LOCAL_INDEX_LOG, derive_signing_key(&[21u8; 32]))?;
    let (events_tx, events_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let transfers = TransferTable::new();
    let local = LocalIndex::open(
        watch.path().to_path_buf(),
        log,
        transfers.clone(),
        events_tx.clone(),
        IndexOptions::default(),
    )?;
    let config = Arc::new(parking_lot::Mutex::new(NodeConfig::new(
        watch.path(),
        store_dir.path(),
    )));

    // The request/release collaborators are never exercised here; downloads
    // are driven directly through handle_download.
    let links = TransferLinks {
        request: Arc::new(|peer: String, _path: String| -> LinkFuture<TransferRef> {
            Box::pin(async move { Err(NodeError::NoPeer(peer)) })
        }),
        release: Arc::new(|_peer: String, _path: String| -> LinkFuture<()> {
            Box::pin(async { Ok(()) })
        }),
    };

    let manager = IndexManager::new(
        local,
        BlobStore::new_memory(),
        swarm.endpoint().clone(),
        transfers,
        events_tx,
        config,
        links,
        Vec::new(),
    );

    Ok(Harness {
        manager,
        events: events_rx,
        watch,
        _store: store_dir,
        _swarm: swarm,
    })
}

/// Register a peer index advertising `record`, signed by a forged writer so
/// the advertised hash can disagree with the bytes the provider serves.
fn advertise(manager: &IndexManager, peer: &str, dir: &Path, record: FileRecord) -> Result<()> {
    let writer_journal = Journal::open(dir.join("writer"))?;
    let writer = writer_journal.open_log(LOCAL_INDEX_LOG, derive_signing_key(&[22u8; 32]))?;
    writer.put(record)?;

    let mirror_journal = Journal::open(dir.join("mirror"))?;
    let mirror = mirror_journal.open_remote(writer.key())?;
    mirror.apply_entries(&writer.entries_since(0))?;

    manager.add_peer(peer, mirror);
    Ok(())
}

fn drain(rx: &mut broadcast::Receiver<NodeEvent>) -> Vec<NodeEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn mismatched_content_hash_is_terminal() -> Result<()> {
    let provider = spawn_provider().await?;
    let data = b"the bytes actually served".to_vec();
    let blob_hash = provider.store.import_bytes(data.clone()).await?;

    let mut harness = spawn_manager(provider.endpoint.addr()).await?;
    let peer = hex::encode(provider.endpoint.id().as_bytes());

    // The peer's index claims a different content hash for this path
    let forged_dir = tempfile::tempdir()?;
    advertise(
        &harness.manager,
        &peer,
        forged_dir.path(),
        FileRecord {
            path: "x.txt".to_string(),
            size: data.len() as u64,
            modified: 1.0,
            hash: "ee".repeat(32),
        },
    )?;

    let transfer_ref = TransferRef::new(
        peer.clone(),
        BlobId {
            hash: BlobStore::hash_to_hex(&blob_hash),
            size: data.len() as u64,
        },
    );

    let err = harness
        .manager
        .handle_download(&peer, "x.txt", &transfer_ref)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "hash_mismatch");

    // The rejected file must not survive in the watch directory
    assert!(!harness.watch.path().join("x.txt").exists());

    let events = drain(&mut harness.events);
    assert!(events.iter().any(|e| matches!(
        e,
        NodeEvent::DownloadFailed { path, error, .. } if path == "x.txt" && error == "hash_mismatch"
    )));
    Ok(())
}

#[tokio::test]
async fn short_blob_is_incomplete() -> Result<()> {
    let provider = spawn_provider().await?;
    let data = b"only this much".to_vec();
    let blob_hash = provider.store.import_bytes(data.clone()).await?;

    let mut harness = spawn_manager(provider.endpoint.addr()).await?;
    let peer = hex::encode(provider.endpoint.id().as_bytes());

    // Declared size exceeds what the blob actually holds
    let transfer_ref = TransferRef::new(
        peer.clone(),
        BlobId {
            hash: BlobStore::hash_to_hex(&blob_hash),
            size: data.len() as u64 + 1,
        },
    );

    let err = harness
        .manager
        .handle_download(&peer, "x.txt", &transfer_ref)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "incomplete");
    assert!(!harness.watch.path().join("x.txt").exists());

    let events = drain(&mut harness.events);
    assert!(events.iter().any(|e| matches!(
        e,
        NodeEvent::DownloadFailed { path, error, .. } if path == "x.txt" && error == "incomplete"
    )));
    Ok(())
}

#[tokio::test]
async fn matching_hash_passes_verification() -> Result<()> {
    let provider = spawn_provider().await?;
    let data = b"verified end to end".to_vec();
    let blob_hash = provider.store.import_bytes(data.clone()).await?;

    let harness = spawn_manager(provider.endpoint.addr()).await?;
    let peer = hex::encode(provider.endpoint.id().as_bytes());

    let forged_dir = tempfile::tempdir()?;
    advertise(
        &harness.manager,
        &peer,
        forged_dir.path(),
        FileRecord {
            path: "x.txt".to_string(),
            size: data.len() as u64,
            modified: 1.0,
            hash: hashing::hash_bytes(&data),
        },
    )?;

    let transfer_ref = TransferRef::new(
        peer.clone(),
        BlobId {
            hash: BlobStore::hash_to_hex(&blob_hash),
            size: data.len() as u64,
        },
    );

    harness
        .manager
        .handle_download(&peer, "x.txt", &transfer_ref)
        .await?;

    let written = harness.watch.path().join("x.txt");
    assert_eq!(std::fs::read(&written)?, data);
    Ok(())
}
