//! The Node: owns the swarm, the journal, both indexes, and every per-peer
//! request channel; exposes the public API and the event bus.
//!
//! ## Per-connection protocol
//!
//! When a connection comes up (dialed on gossip NeighborUp by the side with
//! the larger endpoint id, or accepted through the router):
//!
//! 1. both sides put a framed JSON channel on one bidirectional stream;
//! 2. each requests the other's index-log key, opens a mirror against it,
//!    and subscribes from its stored version;
//! 3. the mirror is registered with the index manager and
//!    `PEER_CONNECTED` fires.
//!
//! On connection close the channel is dropped, the manager forgets the
//! peer, and `PEER_DISCONNECTED` fires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::protocol::{AcceptError, ProtocolHandler};
use iroh::{EndpointAddr, EndpointId, SecretKey};
use iroh_gossip::proto::TopicId;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::blobs::BlobStore;
use crate::config::{NodeConfig, SaveData};
use crate::error::{NodeError, NodeResult};
use crate::events::{emit, NodeEvent, EVENT_CHANNEL_CAPACITY};
use crate::index::{IndexManager, LinkFuture, LocalIndex, TransferLinks};
use crate::journal::{derive_signing_key, Journal, Log, LOCAL_INDEX_LOG};
use crate::messages::{DispatchOutcome, MessageHandler, MessageRegistry};
use crate::net::{read_frame, RpcChannel, Swarm, SwarmEvent};
use crate::protocol::{
    self, Frame, FilePayload, LogEntriesPayload, LogSubscribePayload, MessagePayload,
    ResponseEnvelope, ResponseStatus,
};
use crate::transfer::TransferTable;
use crate::types::{FileRecord, NetworkKey, TransferRef};

type ChannelMap = Arc<RwLock<HashMap<String, Arc<RpcChannel>>>>;

/// State shared between the node, the router's protocol handler, and
/// background tasks.
struct Shared {
    config: Arc<Mutex<NodeConfig>>,
    journal: Journal,
    local_log: Log,
    local: LocalIndex,
    manager: IndexManager,
    channels: ChannelMap,
    /// Peer log mirrors by log key hex, for routing LOG_ENTRIES pushes
    remote_logs: RwLock<HashMap<String, Log>>,
    registry: MessageRegistry,
    events: broadcast::Sender<NodeEvent>,
    closed: AtomicBool,
}

/// A p2p file-synchronization and messaging node.
pub struct Node {
    shared: Arc<Shared>,
    swarm: Arc<Swarm>,
    topic_task: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Bring up the journal, indexes, blob store, and endpoint. The network
    /// is not joined yet; call [`Node::join`].
    pub async fn open(config: NodeConfig) -> NodeResult<Self> {
        Self::open_with_queue(config, Vec::new()).await
    }

    /// Resume a node from previously emitted save-data.
    pub async fn resume(save_data: SaveData) -> NodeResult<Self> {
        let (config, queued) = save_data.into_config();
        Self::open_with_queue(config, queued).await
    }

    async fn open_with_queue(config: NodeConfig, queued: Vec<String>) -> NodeResult<Self> {
        info!(watch_path = ?config.watch_path, "opening node");
        std::fs::create_dir_all(&config.store_path)?;

        let secret_key = SecretKey::from_bytes(config.seed.as_bytes());
        let signing = derive_signing_key(config.seed.as_bytes());

        let journal = Journal::open(&config.store_path)?;
        let local_log = journal.open_log(LOCAL_INDEX_LOG, signing)?;
        let blobs = BlobStore::new_persistent(&config.store_path.join("blobs")).await?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let transfers = TransferTable::new();
        let local = LocalIndex::open(
            config.watch_path.clone(),
            local_log.clone(),
            transfers.clone(),
            events.clone(),
            config.index.clone(),
        )?;

        let swarm = Arc::new(Swarm::bind(secret_key).await?);

        let channels: ChannelMap = Arc::new(RwLock::new(HashMap::new()));
        let links = make_links(channels.clone());
        let archive_on_boot = config.index.archive;
        let config = Arc::new(Mutex::new(config));

        let manager = IndexManager::new(
            local.clone(),
            blobs.clone(),
            swarm.endpoint().clone(),
            transfers,
            events.clone(),
            config.clone(),
            links,
            queued,
        );

        let shared = Arc::new(Shared {
            config,
            journal,
            local_log,
            local: local.clone(),
            manager: manager.clone(),
            channels,
            remote_logs: RwLock::new(HashMap::new()),
            registry: MessageRegistry::new(),
            events,
            closed: AtomicBool::new(false),
        });

        swarm.spawn_router(
            SyncProtocol {
                shared: shared.clone(),
            },
            blobs.protocol(),
        );

        local.start();
        if archive_on_boot {
            manager.start_archive();
        }

        Ok(Self {
            shared,
            swarm,
            topic_task: Mutex::new(None),
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // Network lifecycle
    // ═══════════════════════════════════════════════════════════════════

    /// Join the network with the given key, the configured one, or a newly
    /// generated one. Emits `SAVE_DATA_UPDATE`.
    pub async fn join(&self, network_key: Option<NetworkKey>) -> NodeResult<NetworkKey> {
        self.ensure_open()?;
        let key = {
            let mut config = self.shared.config.lock();
            let key = network_key
                .or(config.network_key)
                .unwrap_or_else(NetworkKey::generate);
            config.network_key = Some(key);
            key
        };

        let topic = TopicId::from_bytes(*key.as_bytes());
        let mut receiver = self.swarm.join(topic).await?;

        let shared = self.shared.clone();
        let swarm = self.swarm.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let SwarmEvent::NeighborUp(peer_id) = event {
                    let peer = hex::encode(peer_id.as_bytes());
                    // One connection per pair: the larger id dials
                    let ours = *swarm.endpoint_id().as_bytes();
                    if ours <= *peer_id.as_bytes() {
                        continue;
                    }
                    if shared.channels.read().contains_key(&peer) {
                        continue;
                    }
                    tokio::spawn(dial_peer(shared.clone(), swarm.clone(), peer_id));
                }
            }
        });
        if let Some(previous) = self.topic_task.lock().replace(task) {
            previous.abort();
        }

        emit(
            &self.shared.events,
            NodeEvent::SaveDataUpdate {
                save_data: self.shared.manager.save_data_view(),
            },
        );
        info!(key = %key, "joined network");
        Ok(key)
    }

    /// Tear everything down: swarm first (no new connections), then the
    /// index manager (cancelling in-flight transfers), then the channels.
    /// Idempotent.
    pub async fn close(&self) -> NodeResult<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing node");
        if let Some(task) = self.topic_task.lock().take() {
            task.abort();
        }
        self.shared.local.close();
        self.swarm.shutdown().await;
        self.shared.manager.close().await;

        let channels: Vec<Arc<RpcChannel>> = {
            let mut map = self.shared.channels.write();
            map.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            channel.close();
        }
        Ok(())
    }

    fn ensure_open(&self) -> NodeResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(NodeError::Cancelled("node is closed".to_string()));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Observation
    // ═══════════════════════════════════════════════════════════════════

    /// Subscribe to the event bus.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.shared.events.subscribe()
    }

    /// This node's peer id, hex-encoded.
    pub fn peer_id(&self) -> String {
        hex::encode(self.swarm.endpoint_id().as_bytes())
    }

    /// Full addressing info for out-of-band exchange.
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.swarm.endpoint_addr()
    }

    /// Add a peer's address out of band (bootstrap without discovery
    /// infrastructure).
    pub fn add_peer_addr(&self, addr: EndpointAddr) {
        self.swarm.add_peer_addr(addr);
    }

    /// Hex ids of fully connected peers.
    pub fn list_peers(&self) -> Vec<String> {
        self.shared.manager.peers()
    }

    /// Snapshot of the local index.
    pub fn list_local_files(&self) -> Vec<FileRecord> {
        self.shared.manager.list_local()
    }

    /// Every index on the network, keyed by peer hex plus `"local"`.
    pub fn list_network_files(&self) -> HashMap<String, Vec<FileRecord>> {
        self.shared.manager.list_network()
    }

    /// Files advertised by peers but absent locally.
    pub fn list_non_local_files(&self) -> Vec<FileRecord> {
        self.shared
            .manager
            .list_nonlocal()
            .into_iter()
            .map(|(_, record)| record)
            .collect()
    }

    /// Current save-data: boot configuration plus queued and in-progress
    /// downloads.
    pub fn save_data(&self) -> SaveData {
        self.shared.manager.save_data_view()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Transfers
    // ═══════════════════════════════════════════════════════════════════

    /// Request a file from a peer and stream it into the watch directory:
    /// FILE_REQUEST → download → FILE_RELEASE.
    pub async fn download_file_from_peer(&self, peer: &str, path: &str) -> NodeResult<()> {
        self.ensure_open()?;
        self.shared.manager.download_from_peer(peer, path).await
    }

    /// Queue a path to download automatically when any peer first
    /// advertises it. Survives restarts via save-data.
    pub fn queue_download(&self, path: &str) {
        self.shared.manager.queue_download(path);
    }

    /// Turn on archive mode: pull every network file not already local.
    pub fn activate_archive(&self) {
        self.shared.manager.activate_archive();
    }

    /// Turn archive mode off.
    pub fn deactivate_archive(&self) {
        self.shared.manager.deactivate_archive();
    }

    // ═══════════════════════════════════════════════════════════════════
    // User messages
    // ═══════════════════════════════════════════════════════════════════

    /// Send a typed message to a peer; the response envelope carries the
    /// remote handler's output.
    pub async fn send_message(
        &self,
        peer: &str,
        kind: &str,
        payload: Value,
    ) -> NodeResult<ResponseEnvelope> {
        self.ensure_open()?;
        let channel = self.shared.channels.read().get(peer).cloned();
        let result = match channel {
            Some(channel) => {
                channel
                    .request(
                        protocol::MESSAGE,
                        json!({ "type": kind, "payload": payload }),
                    )
                    .await
            }
            None => Err(NodeError::NoPeer(peer.to_string())),
        };
        if let Err(e) = &result {
            emit(
                &self.shared.events,
                NodeEvent::Error {
                    message: format!("message to {} failed: {}", peer, e),
                },
            );
        }
        result
    }

    /// Register a persistent handler for a message type.
    pub fn listen(&self, kind: impl Into<String>, handler: MessageHandler) {
        self.shared.registry.listen(kind, handler);
    }

    /// Register a handler that runs at most once.
    pub fn listen_once(&self, kind: impl Into<String>, handler: MessageHandler) {
        self.shared.registry.listen_once(kind, handler);
    }

    /// Remove the handlers for a message type.
    pub fn unlisten(&self, kind: &str) {
        self.shared.registry.unlisten(kind);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("peer_id", &self.peer_id())
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Injected collaborators for the index manager
// ═══════════════════════════════════════════════════════════════════════

fn make_links(channels: ChannelMap) -> TransferLinks {
    let request_channels = channels.clone();
    let request = move |peer: String, path: String| -> LinkFuture<TransferRef> {
        let channels = request_channels.clone();
        Box::pin(async move {
            let channel = channels
                .read()
                .get(&peer)
                .cloned()
                .ok_or_else(|| NodeError::NoPeer(peer.clone()))?;
            let envelope = channel
                .request(protocol::FILE_REQUEST, json!({ "path": path }))
                .await?;
            match envelope.status {
                ResponseStatus::Success => {
                    let transfer_ref: TransferRef = serde_json::from_value(envelope.data)
                        .map_err(|e| {
                            NodeError::InvalidReference(format!(
                                "unexpected FILE_REQUEST payload: {}",
                                e
                            ))
                        })?;
                    if !transfer_ref.is_valid() {
                        return Err(NodeError::InvalidReference(
                            "unexpected transfer payload shape".to_string(),
                        ));
                    }
                    Ok(transfer_ref)
                }
                ResponseStatus::Error => Err(NodeError::Protocol(match envelope.data {
                    Value::String(message) => message,
                    other => other.to_string(),
                })),
                ResponseStatus::UnknownMessageType => Err(NodeError::Protocol(
                    "peer does not understand FILE_REQUEST".to_string(),
                )),
            }
        })
    };

    let release = move |peer: String, path: String| -> LinkFuture<()> {
        let channels = channels.clone();
        Box::pin(async move {
            let channel = channels
                .read()
                .get(&peer)
                .cloned()
                .ok_or_else(|| NodeError::NoPeer(peer.clone()))?;
            let envelope = channel
                .request(protocol::FILE_RELEASE, json!({ "path": path }))
                .await?;
            if !envelope.is_success() {
                return Err(NodeError::Protocol("file release refused".to_string()));
            }
            Ok(())
        })
    };

    TransferLinks {
        request: Arc::new(request),
        release: Arc::new(release),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Connection handling
// ═══════════════════════════════════════════════════════════════════════

/// Router-side handler for the sync ALPN.
#[derive(Clone)]
struct SyncProtocol {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SyncProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProtocol").finish()
    }
}

impl ProtocolHandler for SyncProtocol {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let shared = self.shared.clone();
        async move {
            debug!(peer = %conn.remote_id(), "accepting sync connection");
            let (send, recv) = conn.accept_bi().await.map_err(AcceptError::from_err)?;
            run_connection(shared, conn, send, recv)
                .await
                .map_err(AcceptError::from_err)?;
            Ok(())
        }
    }
}

async fn dial_peer(shared: Arc<Shared>, swarm: Arc<Swarm>, peer_id: EndpointId) {
    let peer = hex::encode(peer_id.as_bytes());
    for attempt in 1..=3u32 {
        if shared.closed.load(Ordering::SeqCst) || shared.channels.read().contains_key(&peer) {
            return;
        }
        match try_dial(&shared, &swarm, peer_id).await {
            Ok(()) => return,
            Err(e) => {
                warn!(peer = %peer, attempt, error = %e, "dial failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn try_dial(shared: &Arc<Shared>, swarm: &Arc<Swarm>, peer_id: EndpointId) -> NodeResult<()> {
    let conn = swarm
        .endpoint()
        .connect(EndpointAddr::new(peer_id), protocol::SYNC_ALPN)
        .await
        .map_err(|e| NodeError::Network(format!("connect failed: {}", e)))?;
    let (send, recv) = conn
        .open_bi()
        .await
        .map_err(|e| NodeError::Network(format!("failed to open stream: {}", e)))?;

    let shared = shared.clone();
    tokio::spawn(async move {
        let peer = conn.remote_id();
        if let Err(e) = run_connection(shared, conn, send, recv).await {
            debug!(%peer, error = %e, "connection ended with error");
        }
    });
    Ok(())
}

/// Drive one connection: install the channel, handshake in the background,
/// read frames until the stream ends, then clean up.
async fn run_connection(
    shared: Arc<Shared>,
    conn: Connection,
    send: SendStream,
    mut recv: RecvStream,
) -> NodeResult<()> {
    let peer = hex::encode(conn.remote_id().as_bytes());
    let channel = Arc::new(RpcChannel::new(peer.clone(), conn, send));

    {
        let mut channels = shared.channels.write();
        if channels.contains_key(&peer) {
            debug!(peer = %peer, "duplicate connection, dropping");
            channel.close();
            return Ok(());
        }
        channels.insert(peer.clone(), channel.clone());
    }
    info!(peer = %peer, "peer channel up");

    let connected = Arc::new(AtomicBool::new(false));
    {
        let shared = shared.clone();
        let channel = channel.clone();
        let connected = connected.clone();
        let task = tokio::spawn(async move {
            match handshake(&shared, &channel).await {
                Ok(()) => connected.store(true, Ordering::SeqCst),
                Err(e) => {
                    warn!(peer = %channel.peer(), error = %e, "peer handshake failed");
                    emit(
                        &shared.events,
                        NodeEvent::Error {
                            message: format!("handshake with {} failed: {}", channel.peer(), e),
                        },
                    );
                }
            }
        });
        channel.register_task(task);
    }

    let result = reader_loop(&shared, &channel, &mut recv).await;
    if let Err(e) = &result {
        debug!(peer = %peer, error = %e, "reader loop ended with error");
    }

    // Cleanup: forget the channel and the peer's index
    shared.channels.write().remove(&peer);
    if let Some(log) = shared.manager.peer_log(&peer) {
        shared.remote_logs.write().remove(&log.key_hex());
    }
    shared.manager.remove_peer(&peer);
    channel.close();
    if connected.load(Ordering::SeqCst) {
        emit(&shared.events, NodeEvent::PeerDisconnected { peer });
    }
    result
}

/// Fetch the peer's index-log key, open a mirror, subscribe to appends, and
/// register the peer with the index manager.
async fn handshake(shared: &Arc<Shared>, channel: &Arc<RpcChannel>) -> NodeResult<()> {
    let envelope = channel
        .request(protocol::LOCAL_INDEX_KEY_REQUEST, Value::Null)
        .await?;
    if !envelope.is_success() {
        return Err(NodeError::Protocol(
            "peer refused index key request".to_string(),
        ));
    }
    let key_hex: String = serde_json::from_value(envelope.data)
        .map_err(|e| NodeError::Protocol(format!("bad index key payload: {}", e)))?;
    let key_bytes: [u8; 32] = hex::decode(&key_hex)
        .map_err(|e| NodeError::InvalidKey(format!("bad log key hex: {}", e)))?
        .try_into()
        .map_err(|_| NodeError::InvalidKey("log key must be 32 bytes".to_string()))?;
    let verifying = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| NodeError::InvalidKey(format!("bad log key: {}", e)))?;

    let log = shared.journal.open_remote(verifying)?;
    shared
        .remote_logs
        .write()
        .insert(key_hex.clone(), log.clone());

    let from = log.version();
    let envelope = channel
        .request(
            protocol::LOG_SUBSCRIBE,
            json!({ "key": key_hex, "from": from }),
        )
        .await?;
    if !envelope.is_success() {
        return Err(NodeError::Protocol(
            "peer refused log subscription".to_string(),
        ));
    }

    shared.manager.add_peer(channel.peer(), log);
    emit(
        &shared.events,
        NodeEvent::PeerConnected {
            peer: channel.peer().to_string(),
        },
    );
    info!(peer = %channel.peer(), "peer connected");
    Ok(())
}

async fn reader_loop(
    shared: &Arc<Shared>,
    channel: &Arc<RpcChannel>,
    recv: &mut RecvStream,
) -> NodeResult<()> {
    loop {
        let frame = match read_frame(recv).await? {
            Some(frame) => frame,
            None => return Ok(()),
        };
        match frame {
            Frame::Response { id, status, data } => {
                channel.complete(id, ResponseEnvelope { status, data });
            }
            Frame::Request {
                id,
                method,
                payload,
            } => {
                let envelope = dispatch_request(shared, channel, &method, payload).await;
                channel.respond(id, envelope).await?;
            }
            Frame::Push { kind, payload } => {
                if let Err(e) = handle_push(shared, channel, &kind, payload) {
                    warn!(peer = %channel.peer(), kind = %kind, error = %e, "push handling failed");
                }
            }
        }
    }
}

/// Protocol method dispatch. Failures never cross the wire as anything but
/// an error-status envelope.
async fn dispatch_request(
    shared: &Arc<Shared>,
    channel: &Arc<RpcChannel>,
    method: &str,
    payload: Value,
) -> ResponseEnvelope {
    debug!(peer = %channel.peer(), method, "inbound request");
    match method {
        protocol::LOCAL_INDEX_KEY_REQUEST => {
            ResponseEnvelope::success(Value::String(shared.local_log.key_hex()))
        }
        protocol::LOG_SUBSCRIBE => match serde_json::from_value::<LogSubscribePayload>(payload) {
            Ok(subscribe) => handle_log_subscribe(shared, channel, subscribe),
            Err(e) => ResponseEnvelope::error(format!("bad LOG_SUBSCRIBE payload: {}", e)),
        },
        protocol::FILE_REQUEST => match serde_json::from_value::<FilePayload>(payload) {
            Ok(request) => {
                match shared
                    .manager
                    .create_upload(&request.path, channel.peer())
                    .await
                {
                    Ok(transfer_ref) => match serde_json::to_value(&transfer_ref) {
                        Ok(value) => ResponseEnvelope::success(value),
                        Err(e) => ResponseEnvelope::error(e.to_string()),
                    },
                    Err(e) => {
                        emit(
                            &shared.events,
                            NodeEvent::Error {
                                message: format!(
                                    "file request for {} failed: {}",
                                    request.path, e
                                ),
                            },
                        );
                        ResponseEnvelope::error(e.to_string())
                    }
                }
            }
            Err(e) => ResponseEnvelope::error(format!("bad FILE_REQUEST payload: {}", e)),
        },
        protocol::FILE_RELEASE => match serde_json::from_value::<FilePayload>(payload) {
            Ok(request) => {
                let _ = shared
                    .manager
                    .close_upload(&request.path, Some(channel.peer()), true);
                ResponseEnvelope::success(Value::Null)
            }
            Err(e) => ResponseEnvelope::error(format!("bad FILE_RELEASE payload: {}", e)),
        },
        protocol::MESSAGE => match serde_json::from_value::<MessagePayload>(payload) {
            Ok(message) => match shared.registry.dispatch(&message.kind, message.payload) {
                DispatchOutcome::Handled(Ok(data)) => ResponseEnvelope::success(data),
                DispatchOutcome::Handled(Err(error)) => {
                    emit(
                        &shared.events,
                        NodeEvent::Error {
                            message: format!("message handler {} failed: {}", message.kind, error),
                        },
                    );
                    ResponseEnvelope::error(error)
                }
                DispatchOutcome::NoHandler => ResponseEnvelope::unknown_message_type(),
            },
            Err(e) => ResponseEnvelope::error(format!("bad MESSAGE payload: {}", e)),
        },
        _ => ResponseEnvelope::unknown_message_type(),
    }
}

/// Serve a log subscription: push everything from the requested version,
/// then keep pushing on every append for the life of the connection.
fn handle_log_subscribe(
    shared: &Arc<Shared>,
    channel: &Arc<RpcChannel>,
    subscribe: LogSubscribePayload,
) -> ResponseEnvelope {
    if subscribe.key != shared.local_log.key_hex() {
        return ResponseEnvelope::error(format!("unknown log key: {}", subscribe.key));
    }

    let log = shared.local_log.clone();
    let pusher_channel = channel.clone();
    let key = subscribe.key;
    let mut cursor = subscribe.from;
    let task = tokio::spawn(async move {
        let mut rx = log.subscribe();
        loop {
            let entries = log.entries_since(cursor);
            if !entries.is_empty() {
                let from = entries[0].seq;
                if let Some(last) = entries.last() {
                    cursor = last.seq + 1;
                }
                let payload = LogEntriesPayload {
                    key: key.clone(),
                    from,
                    entries,
                };
                let value = match serde_json::to_value(&payload) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(error = %e, "failed to encode log entries");
                        break;
                    }
                };
                if pusher_channel.push(protocol::LOG_ENTRIES, value).await.is_err() {
                    break;
                }
            }
            match rx.recv().await {
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    channel.register_task(task);

    ResponseEnvelope::success(json!(shared.local_log.version()))
}

/// Inbound pushes. LOG_ENTRIES feeds the matching mirror; integrity
/// failures trigger a fresh subscription instead of crashing the reader.
fn handle_push(
    shared: &Arc<Shared>,
    channel: &Arc<RpcChannel>,
    kind: &str,
    payload: Value,
) -> NodeResult<()> {
    match kind {
        protocol::LOG_ENTRIES => {
            let update: LogEntriesPayload = serde_json::from_value(payload)
                .map_err(|e| NodeError::Protocol(format!("bad LOG_ENTRIES payload: {}", e)))?;
            let log = shared
                .remote_logs
                .read()
                .get(&update.key)
                .cloned()
                .ok_or_else(|| {
                    NodeError::Protocol(format!("entries for unknown log {}", update.key))
                })?;

            if let Some(first) = update.entries.first() {
                if first.seq == 0 && log.version() > 0 {
                    // The writer started a fresh log; the mirror starts over
                    // and every surviving entry resurfaces as added.
                    log.reset()?;
                }
            }

            if let Err(e) = log.apply_entries(&update.entries) {
                warn!(peer = %channel.peer(), error = %e, "rejected log entries, resubscribing");
                let channel = channel.clone();
                let key = update.key;
                let from = log.version();
                tokio::spawn(async move {
                    let _ = channel
                        .request(protocol::LOG_SUBSCRIBE, json!({ "key": key, "from": from }))
                        .await;
                });
            }
            Ok(())
        }
        _ => Err(NodeError::Protocol(format!("unknown push kind: {}", kind))),
    }
}
