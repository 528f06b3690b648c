//! Node event bus.
//!
//! Every observable state change flows through a single broadcast channel of
//! typed events: local index changes, per-peer index diffs, transfer
//! lifecycle, connectivity, and save-data updates. Delivery is FIFO per
//! subscriber.

use tokio::sync::broadcast;

use crate::config::SaveData;

/// Default capacity for the event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by a node
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A peer's request channel is up and its index log is registered
    PeerConnected { peer: String },
    /// A peer's connection closed; its index is no longer tracked
    PeerDisconnected { peer: String },

    /// A new path appeared in the local index
    LocalFileAdded { path: String, hash: String },
    /// A local path's content hash changed
    LocalFileChanged {
        path: String,
        prev_hash: String,
        hash: String,
    },
    /// A path disappeared from the local index
    LocalFileRemoved { path: String },

    /// A peer's index advertises a path we had not observed from it
    PeerFileAdded {
        peer: String,
        path: String,
        hash: String,
    },
    /// A peer's index changed the hash for a path
    PeerFileChanged {
        peer: String,
        path: String,
        hash: String,
        prev_hash: String,
    },
    /// A peer's index dropped a path
    PeerFileRemoved { peer: String, path: String },

    /// A download transfer-table entry was created
    DownloadStarted { peer: String, path: String },
    /// Download byte-count milestone (1% increments)
    DownloadProgress {
        peer: String,
        path: String,
        bytes: u64,
        total: u64,
        percent: u8,
    },
    /// Download finished and verified
    DownloadCompleted { peer: String, path: String },
    /// Download failed; `error` is a machine-readable kind
    DownloadFailed {
        peer: String,
        path: String,
        error: String,
    },

    /// The persistent boot configuration changed
    SaveDataUpdate { save_data: SaveData },

    /// A recoverable internal failure; the node keeps running
    Error { message: String },
}

impl NodeEvent {
    /// Path this event refers to, if any
    pub fn path(&self) -> Option<&str> {
        match self {
            NodeEvent::LocalFileAdded { path, .. }
            | NodeEvent::LocalFileChanged { path, .. }
            | NodeEvent::LocalFileRemoved { path }
            | NodeEvent::PeerFileAdded { path, .. }
            | NodeEvent::PeerFileChanged { path, .. }
            | NodeEvent::PeerFileRemoved { path, .. }
            | NodeEvent::DownloadStarted { path, .. }
            | NodeEvent::DownloadProgress { path, .. }
            | NodeEvent::DownloadCompleted { path, .. }
            | NodeEvent::DownloadFailed { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Peer this event refers to, if any
    pub fn peer(&self) -> Option<&str> {
        match self {
            NodeEvent::PeerConnected { peer }
            | NodeEvent::PeerDisconnected { peer }
            | NodeEvent::PeerFileAdded { peer, .. }
            | NodeEvent::PeerFileChanged { peer, .. }
            | NodeEvent::PeerFileRemoved { peer, .. }
            | NodeEvent::DownloadStarted { peer, .. }
            | NodeEvent::DownloadProgress { peer, .. }
            | NodeEvent::DownloadCompleted { peer, .. }
            | NodeEvent::DownloadFailed { peer, .. } => Some(peer),
            _ => None,
        }
    }
}

/// Send on the bus, ignoring the no-subscriber case.
pub(crate) fn emit(tx: &broadcast::Sender<NodeEvent>, event: NodeEvent) {
    let _ = tx.send(event);
}
