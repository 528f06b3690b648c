//! Index Manager: aggregates every peer's log into a coherent network view
//! and drives all file transfers.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  IndexManager                                                  │
//! │  ├── peers: peer hex -> { log mirror, baseline, walker task }  │
//! │  │   └── per-peer diff walks, serialized on the baseline lock  │
//! │  ├── transfers: TransferTable (the busy-file gate)             │
//! │  ├── queued: paths to fetch when first advertised              │
//! │  └── archive loop: pulls every remote-only file                │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The manager never talks to the wire itself: the node injects a pair of
//! function-typed collaborators ([`TransferLinks`]) that issue FILE_REQUEST
//! and FILE_RELEASE over the right peer channel.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use iroh::Endpoint;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::blobs::BlobStore;
use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::events::{emit, NodeEvent};
use crate::hashing::{self, HASH_CHUNK_SIZE};
use crate::index::LocalIndex;
use crate::journal::Log;
use crate::paths;
use crate::transfer::TransferTable;
use crate::types::{BlobId, FileRecord, TransferDirection, TransferRef};

/// Downloads abort when no bytes are observed for this long.
pub const DOWNLOAD_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Boxed future returned by the injected collaborators.
pub type LinkFuture<T> = Pin<Box<dyn Future<Output = NodeResult<T>> + Send>>;

/// Function-typed collaborators for talking to a peer: `(peer hex, path)`.
#[derive(Clone)]
pub struct TransferLinks {
    pub request: Arc<dyn Fn(String, String) -> LinkFuture<TransferRef> + Send + Sync>,
    pub release: Arc<dyn Fn(String, String) -> LinkFuture<()> + Send + Sync>,
}

struct PeerIndex {
    log: Log,
    /// Last fully processed version; the lock serializes diff walks.
    baseline: Arc<tokio::sync::Mutex<u64>>,
    walker: JoinHandle<()>,
}

struct ImInner {
    local: LocalIndex,
    blobs: BlobStore,
    endpoint: Endpoint,
    transfers: TransferTable,
    events: broadcast::Sender<NodeEvent>,
    config: Arc<Mutex<NodeConfig>>,
    links: TransferLinks,
    peers: parking_lot::RwLock<HashMap<String, PeerIndex>>,
    queued: Mutex<BTreeSet<String>>,
    archive: AtomicBool,
    archive_running: Arc<AtomicBool>,
    archive_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Aggregated view of every peer's index plus transfer orchestration.
#[derive(Clone)]
pub struct IndexManager {
    inner: Arc<ImInner>,
}

impl IndexManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: LocalIndex,
        blobs: BlobStore,
        endpoint: Endpoint,
        transfers: TransferTable,
        events: broadcast::Sender<NodeEvent>,
        config: Arc<Mutex<NodeConfig>>,
        links: TransferLinks,
        queued: Vec<String>,
    ) -> Self {
        Self {
            inner: Arc::new(ImInner {
                local,
                blobs,
                endpoint,
                transfers,
                events,
                config,
                links,
                peers: parking_lot::RwLock::new(HashMap::new()),
                queued: Mutex::new(queued.into_iter().map(|p| paths::normalize(&p)).collect()),
                archive: AtomicBool::new(false),
                archive_running: Arc::new(AtomicBool::new(false)),
                archive_task: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Peer registration and the diff engine
    // ═══════════════════════════════════════════════════════════════════

    /// Register a peer's log mirror. The current version becomes the
    /// baseline; everything already replicated before this session's first
    /// connect surfaces as ADDED through the walker.
    pub fn add_peer(&self, peer: &str, log: Log) {
        let baseline = Arc::new(tokio::sync::Mutex::new(log.version()));
        let walker = self.spawn_walker(peer.to_string(), log.clone(), baseline.clone());
        let previous = self.inner.peers.write().insert(
            peer.to_string(),
            PeerIndex {
                log,
                baseline,
                walker,
            },
        );
        if let Some(previous) = previous {
            previous.walker.abort();
        }
        info!(peer, "peer index registered");
    }

    /// Drop a peer's handle and baseline. Its mirror stays on disk but is no
    /// longer tracked.
    pub fn remove_peer(&self, peer: &str) {
        if let Some(state) = self.inner.peers.write().remove(peer) {
            state.walker.abort();
            info!(peer, "peer index dropped");
        }
    }

    /// The registered log mirror for a peer, if any.
    pub fn peer_log(&self, peer: &str) -> Option<Log> {
        self.inner.peers.read().get(peer).map(|p| p.log.clone())
    }

    /// Hex ids of every registered peer.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.inner.peers.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    fn spawn_walker(
        &self,
        peer: String,
        log: Log,
        baseline: Arc<tokio::sync::Mutex<u64>>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut rx = log.subscribe();
            loop {
                manager.walk_peer(&peer, &log, &baseline).await;
                match rx.recv().await {
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// One serialized diff walk: compare the snapshot at the baseline with
    /// the current head and emit per-file events. The baseline only advances
    /// after the walk completes. A head below the baseline means the peer's
    /// log was replaced; the walk restarts from zero so every present entry
    /// surfaces as ADDED.
    async fn walk_peer(&self, peer: &str, log: &Log, baseline: &tokio::sync::Mutex<u64>) {
        let mut guard = baseline.lock().await;
        let to = log.version();
        let mut from = *guard;
        if to == from {
            return;
        }
        if to < from {
            debug!(peer, from, to, "peer log replaced, walking from zero");
            from = 0;
        }

        for row in log.diff(from, to) {
            match (row.left, row.right) {
                (Some(new), None) => {
                    emit(
                        &self.inner.events,
                        NodeEvent::PeerFileAdded {
                            peer: peer.to_string(),
                            path: row.path.clone(),
                            hash: new.hash,
                        },
                    );
                    self.on_peer_file_added(peer, &row.path);
                }
                (None, Some(_)) => {
                    emit(
                        &self.inner.events,
                        NodeEvent::PeerFileRemoved {
                            peer: peer.to_string(),
                            path: row.path,
                        },
                    );
                }
                (Some(new), Some(old)) => {
                    if new.hash != old.hash {
                        emit(
                            &self.inner.events,
                            NodeEvent::PeerFileChanged {
                                peer: peer.to_string(),
                                path: row.path,
                                hash: new.hash,
                                prev_hash: old.hash,
                            },
                        );
                    }
                }
                (None, None) => {}
            }
        }
        *guard = to;
    }

    /// Queued-download hook: the first advertisement of a queued path
    /// triggers a fetch, and the path leaves the queue regardless of how the
    /// fetch goes.
    fn on_peer_file_added(&self, peer: &str, path: &str) {
        let was_queued = self.inner.queued.lock().remove(path);
        if !was_queued {
            return;
        }
        self.emit_save_data();

        let manager = self.clone();
        let peer = peer.to_string();
        let path = path.to_string();
        tokio::spawn(async move {
            info!(peer = %peer, path = %path, "fetching queued download");
            if let Err(e) = manager.download_from_peer(&peer, &path).await {
                warn!(peer = %peer, path = %path, error = %e, "queued download failed");
            }
        });
    }

    // ═══════════════════════════════════════════════════════════════════
    // Query helpers
    // ═══════════════════════════════════════════════════════════════════

    /// Snapshot of the local index.
    pub fn list_local(&self) -> Vec<FileRecord> {
        self.inner.local.list()
    }

    /// Snapshot of one peer's index.
    pub fn list_peer(&self, peer: &str) -> Option<Vec<FileRecord>> {
        self.inner
            .peers
            .read()
            .get(peer)
            .map(|p| p.log.snapshot().into_values().collect())
    }

    /// Every index on the network, keyed by peer hex, with the local one
    /// under `"local"`.
    pub fn list_network(&self) -> HashMap<String, Vec<FileRecord>> {
        let mut out = HashMap::new();
        out.insert("local".to_string(), self.list_local());
        for (peer, state) in self.inner.peers.read().iter() {
            out.insert(peer.clone(), state.log.snapshot().into_values().collect());
        }
        out
    }

    /// Files advertised by peers but absent locally, path-sorted, one entry
    /// per path (first advertising peer wins).
    pub fn list_nonlocal(&self) -> Vec<(String, FileRecord)> {
        let local: BTreeSet<String> = self
            .inner
            .local
            .list()
            .into_iter()
            .map(|r| r.path)
            .collect();

        let mut out: std::collections::BTreeMap<String, (String, FileRecord)> = Default::default();
        for (peer, state) in self.inner.peers.read().iter() {
            for record in state.log.snapshot().into_values() {
                if !local.contains(&record.path) && !out.contains_key(&record.path) {
                    out.insert(record.path.clone(), (peer.clone(), record));
                }
            }
        }
        out.into_values().collect()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Transfers
    // ═══════════════════════════════════════════════════════════════════

    /// Server side of a transfer: publish the file's bytes as a one-shot
    /// blob and hand back its reference. The path is busy from here until
    /// the requester sends FILE_RELEASE.
    pub async fn create_upload(&self, path: &str, peer: &str) -> NodeResult<TransferRef> {
        let rel = paths::normalize(path);
        if self.inner.local.get(&rel).is_none() {
            return Err(NodeError::FileNotFound(rel));
        }

        let drive = paths::drive_path(&rel);
        self.inner
            .transfers
            .begin(&drive, peer, TransferDirection::Upload);

        let result: NodeResult<TransferRef> = async {
            let abs = paths::to_abs(self.inner.local.watch_path(), &rel);
            let data = tokio::fs::read(&abs).await?;
            let size = data.len() as u64;
            let hash = self.inner.blobs.import_bytes(data).await?;
            Ok(TransferRef::new(
                hex::encode(self.inner.endpoint.id().as_bytes()),
                BlobId {
                    hash: BlobStore::hash_to_hex(&hash),
                    size,
                },
            ))
        }
        .await;

        match &result {
            Ok(tref) => {
                info!(path = %rel, peer, size = tref.id.size, "upload prepared");
            }
            Err(e) => {
                warn!(path = %rel, peer, error = %e, "upload preparation failed");
                self.inner.transfers.end(&drive, peer);
            }
        }
        result
    }

    /// Tear down upload state for a path. Without `force` this refuses while
    /// transfers are still active.
    pub fn close_upload(&self, path: &str, peer: Option<&str>, force: bool) -> NodeResult<()> {
        let drive = paths::drive_path(path);
        if !force && self.inner.transfers.active(&drive) > 0 {
            return Err(NodeError::TransferActive(paths::normalize(path)));
        }
        match peer {
            Some(peer) => {
                self.inner.transfers.end(&drive, peer);
            }
            None => {
                self.inner.transfers.end_all(&drive);
            }
        }
        Ok(())
    }

    /// Tear down download state for a path.
    pub fn close_download(&self, path: &str, peer: Option<&str>, force: bool) -> NodeResult<()> {
        self.close_upload(path, peer, force)
    }

    /// Client side of a transfer: stream the referenced blob into the watch
    /// directory. The path is busy for the whole duration so the local index
    /// cannot race the partially written file.
    pub async fn handle_download(
        &self,
        peer: &str,
        path: &str,
        transfer_ref: &TransferRef,
    ) -> NodeResult<()> {
        let rel = paths::normalize(path);
        let drive = paths::drive_path(&rel);

        self.inner
            .transfers
            .begin(&drive, peer, TransferDirection::Download);
        emit(
            &self.inner.events,
            NodeEvent::DownloadStarted {
                peer: peer.to_string(),
                path: rel.clone(),
            },
        );
        self.emit_save_data();

        let result = self.run_download(peer, &rel, transfer_ref).await;

        self.inner.transfers.end(&drive, peer);
        if let Ok(hash) = BlobStore::parse_hash(&transfer_ref.id.hash) {
            self.inner.blobs.discard(&hash);
        }

        match &result {
            Ok(()) => {
                info!(peer, path = %rel, "download completed");
                emit(
                    &self.inner.events,
                    NodeEvent::DownloadCompleted {
                        peer: peer.to_string(),
                        path: rel.clone(),
                    },
                );
            }
            Err(e) => {
                warn!(peer, path = %rel, error = %e, "download failed");
                emit(
                    &self.inner.events,
                    NodeEvent::DownloadFailed {
                        peer: peer.to_string(),
                        path: rel.clone(),
                        error: e.kind().to_string(),
                    },
                );
                emit(
                    &self.inner.events,
                    NodeEvent::Error {
                        message: format!("download of {} from {} failed: {}", rel, peer, e),
                    },
                );
            }
        }
        self.emit_save_data();
        result
    }

    async fn run_download(
        &self,
        peer: &str,
        rel: &str,
        transfer_ref: &TransferRef,
    ) -> NodeResult<()> {
        if !transfer_ref.is_valid() {
            return Err(NodeError::InvalidReference(format!(
                "unexpected transfer payload for {}",
                rel
            )));
        }
        let provider_bytes: [u8; 32] = hex::decode(&transfer_ref.key)
            .map_err(|e| NodeError::InvalidReference(format!("bad provider key: {}", e)))?
            .try_into()
            .map_err(|_| NodeError::InvalidReference("provider key must be 32 bytes".into()))?;
        let provider = iroh::PublicKey::from_bytes(&provider_bytes)
            .map_err(|e| NodeError::InvalidReference(format!("bad provider key: {}", e)))?;
        let hash = BlobStore::parse_hash(&transfer_ref.id.hash)?;
        let total = transfer_ref.id.size;

        // Progress milestones track the streamed transfer itself
        let events = self.inner.events.clone();
        let progress_peer = peer.to_string();
        let progress_path = rel.to_string();
        let mut last_percent: u8 = 0;
        let on_progress = move |bytes: u64| {
            let percent = if total == 0 {
                100
            } else {
                ((bytes.min(total) * 100) / total) as u8
            };
            if percent > last_percent {
                last_percent = percent;
                emit(
                    &events,
                    NodeEvent::DownloadProgress {
                        peer: progress_peer.clone(),
                        path: progress_path.clone(),
                        bytes,
                        total,
                        percent,
                    },
                );
            }
        };
        self.inner
            .blobs
            .download(
                hash,
                provider,
                &self.inner.endpoint,
                DOWNLOAD_INACTIVITY_TIMEOUT,
                on_progress,
            )
            .await?;

        let bytes = self
            .inner
            .blobs
            .get_bytes(&hash)
            .await?
            .ok_or_else(|| NodeError::Blob(format!("blob missing after download: {}", rel)))?;
        if bytes.len() as u64 != total {
            return Err(NodeError::Incomplete {
                path: rel.to_string(),
                expected: total,
                actual: bytes.len() as u64,
            });
        }

        let abs = paths::to_abs(self.inner.local.watch_path(), rel);
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&abs).await?;
        for chunk in bytes.chunks(HASH_CHUNK_SIZE) {
            file.write_all(chunk).await?;
        }
        file.flush().await?;
        drop(file);

        // Completion check: the written file must hash to the value the
        // peer's index advertises for this path. A mismatch is terminal and
        // must not leave the bad file in the watch directory.
        let advertised = self
            .peer_log(peer)
            .and_then(|log| log.get(rel))
            .map(|record| record.hash);
        match advertised {
            Some(expected) => {
                let actual = hashing::hash_file_async(abs.clone()).await?;
                if actual != expected {
                    let _ = tokio::fs::remove_file(&abs).await;
                    return Err(NodeError::HashMismatch {
                        path: rel.to_string(),
                        expected,
                        actual,
                    });
                }
            }
            None => {
                debug!(peer, path = %rel, "no advertised hash to verify against");
            }
        }
        Ok(())
    }

    /// The full request → download → release cycle against one peer.
    pub async fn download_from_peer(&self, peer: &str, path: &str) -> NodeResult<()> {
        let rel = paths::normalize(path);
        let transfer_ref = match (self.inner.links.request)(peer.to_string(), rel.clone()).await {
            Ok(transfer_ref) => transfer_ref,
            Err(e) => {
                emit(
                    &self.inner.events,
                    NodeEvent::Error {
                        message: format!("file request for {} to {} failed: {}", rel, peer, e),
                    },
                );
                return Err(e);
            }
        };
        let result = self.handle_download(peer, &rel, &transfer_ref).await;
        if let Err(e) = (self.inner.links.release)(peer.to_string(), rel.clone()).await {
            warn!(peer, path = %rel, error = %e, "file release failed");
        }
        result
    }

    // ═══════════════════════════════════════════════════════════════════
    // Queued downloads
    // ═══════════════════════════════════════════════════════════════════

    /// Queue a path to download as soon as any peer advertises it.
    pub fn queue_download(&self, path: &str) {
        let rel = paths::normalize(path);
        if self.inner.queued.lock().insert(rel) {
            self.emit_save_data();
        }
    }

    pub fn queued_downloads(&self) -> Vec<String> {
        self.inner.queued.lock().iter().cloned().collect()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Archive mode
    // ═══════════════════════════════════════════════════════════════════

    pub fn archive_active(&self) -> bool {
        self.inner.archive.load(Ordering::SeqCst)
    }

    /// Turn the archive loop on and emit the save-data change.
    pub fn activate_archive(&self) {
        if self.start_archive() {
            self.emit_save_data();
        }
    }

    /// Turn the archive loop off and emit the save-data change.
    pub fn deactivate_archive(&self) {
        if self.stop_archive() {
            self.emit_save_data();
        }
    }

    /// Start the loop without emitting (used at open() when the boot
    /// configuration already says archive is on). Returns whether the flag
    /// flipped.
    pub(crate) fn start_archive(&self) -> bool {
        if self.inner.archive.swap(true, Ordering::SeqCst) {
            return false;
        }
        let manager = self.clone();
        let interval = self.inner.config.lock().index.archive_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the immediate first tick; the loop is periodic, not eager
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !manager.inner.archive.load(Ordering::SeqCst) {
                    break;
                }
                if manager.inner.archive_running.swap(true, Ordering::SeqCst) {
                    continue;
                }
                let pass = manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = pass.archive_pass().await {
                        warn!(error = %e, "archive pass failed");
                    }
                    pass.inner.archive_running.store(false, Ordering::SeqCst);
                });
            }
        });
        if let Some(previous) = self.inner.archive_task.lock().replace(task) {
            previous.abort();
        }
        true
    }

    pub(crate) fn stop_archive(&self) -> bool {
        if !self.inner.archive.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(task) = self.inner.archive_task.lock().take() {
            task.abort();
        }
        true
    }

    /// One archive wake: pick the first remote-only path and pull it.
    async fn archive_pass(&self) -> NodeResult<()> {
        let candidate = self
            .list_nonlocal()
            .into_iter()
            .find(|(_, record)| !self.inner.transfers.is_busy(&paths::drive_path(&record.path)));
        let Some((peer, record)) = candidate else {
            return Ok(());
        };
        info!(peer = %peer, path = %record.path, "archive fetching");
        self.download_from_peer(&peer, &record.path).await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Save-data
    // ═══════════════════════════════════════════════════════════════════

    /// The current save-data view: boot configuration plus the union of the
    /// queued set and in-progress downloads.
    pub fn save_data_view(&self) -> crate::config::SaveData {
        let config = self.inner.config.lock().clone();
        let mut queued: BTreeSet<String> = self.inner.queued.lock().clone();
        for path in self.inner.transfers.downloads() {
            queued.insert(path);
        }
        let mut save = config.save_data(queued.into_iter().collect());
        save.index.archive = self.archive_active();
        save
    }

    fn emit_save_data(&self) {
        emit(
            &self.inner.events,
            NodeEvent::SaveDataUpdate {
                save_data: self.save_data_view(),
            },
        );
    }

    // ═══════════════════════════════════════════════════════════════════
    // Shutdown
    // ═══════════════════════════════════════════════════════════════════

    /// Cancel in-flight transfers, stop the archive loop, and drop every
    /// peer handle. Remote containers are released best-effort.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_archive();

        for (_, state) in self.inner.peers.write().drain() {
            state.walker.abort();
        }

        let drained = self.inner.transfers.drain();
        let had_transfers = !drained.is_empty();
        for (drive, peer, entry) in drained {
            let rel = paths::from_drive_path(&drive).to_string();
            if entry.direction == TransferDirection::Download {
                emit(
                    &self.inner.events,
                    NodeEvent::DownloadFailed {
                        peer: peer.clone(),
                        path: rel.clone(),
                        error: "cancelled".to_string(),
                    },
                );
                let release = self.inner.links.release.clone();
                tokio::spawn(async move {
                    let _ = (release)(peer, rel).await;
                });
            }
        }
        if had_transfers {
            self.emit_save_data();
        }
    }
}

impl std::fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexManager")
            .field("peers", &self.inner.peers.read().len())
            .field("archive", &self.archive_active())
            .finish()
    }
}
