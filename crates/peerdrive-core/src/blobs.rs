//! Content-addressed blob storage for file transfers.
//!
//! Every upload publishes a single blob into the node's store; the
//! `BlobsProtocol` registered on the router serves it to the requesting
//! peer, which pulls it through the store's downloader. Memory store for
//! tests, filesystem store for real nodes.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use iroh::{Endpoint, EndpointId};
use iroh_blobs::store::fs::FsStore;
use iroh_blobs::store::mem::MemStore;
use iroh_blobs::Hash;
use n0_future::StreamExt;
use tracing::debug;

use crate::error::{NodeError, NodeResult};

enum StoreInner {
    Memory(MemStore),
    Persistent(FsStore),
}

/// Wrapper around an iroh-blobs store.
pub struct BlobStore {
    inner: StoreInner,
}

impl Clone for BlobStore {
    fn clone(&self) -> Self {
        match &self.inner {
            StoreInner::Memory(store) => Self {
                inner: StoreInner::Memory(store.clone()),
            },
            StoreInner::Persistent(store) => Self {
                inner: StoreInner::Persistent(store.clone()),
            },
        }
    }
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner {
            StoreInner::Memory(_) => write!(f, "BlobStore(mem)"),
            StoreInner::Persistent(_) => write!(f, "BlobStore(fs)"),
        }
    }
}

impl BlobStore {
    /// In-memory store; contents are lost on restart.
    pub fn new_memory() -> Self {
        Self {
            inner: StoreInner::Memory(MemStore::new()),
        }
    }

    /// Filesystem store under `path`.
    pub async fn new_persistent(path: &Path) -> NodeResult<Self> {
        tokio::fs::create_dir_all(path).await?;
        let store = FsStore::load(path)
            .await
            .map_err(|e| NodeError::Blob(format!("failed to load blob store at {:?}: {}", path, e)))?;
        Ok(Self {
            inner: StoreInner::Persistent(store),
        })
    }

    /// The underlying store handle, for router integration and downloads.
    pub fn store(&self) -> iroh_blobs::api::Store {
        match &self.inner {
            StoreInner::Memory(store) => store.as_ref().clone(),
            StoreInner::Persistent(store) => (*store).clone().into(),
        }
    }

    /// The protocol handler serving this store over the router.
    pub fn protocol(&self) -> iroh_blobs::BlobsProtocol {
        iroh_blobs::BlobsProtocol::new(&self.store(), None)
    }

    /// Import bytes, returning the content hash.
    pub async fn import_bytes(&self, data: impl Into<Bytes>) -> NodeResult<Hash> {
        let data: Bytes = data.into();
        let len = data.len();
        let blobs = match &self.inner {
            StoreInner::Memory(store) => store.blobs(),
            StoreInner::Persistent(store) => store.blobs(),
        };
        let tag = blobs
            .add_bytes(data)
            .temp_tag()
            .await
            .map_err(|e| NodeError::Blob(format!("failed to import blob: {}", e)))?;
        let hash = tag.hash();
        debug!(?hash, len, "imported blob");
        Ok(hash)
    }

    /// Read a blob back; `None` when it is not held locally.
    pub async fn get_bytes(&self, hash: &Hash) -> NodeResult<Option<Bytes>> {
        let blobs = match &self.inner {
            StoreInner::Memory(store) => store.blobs(),
            StoreInner::Persistent(store) => store.blobs(),
        };
        let present = blobs
            .has(*hash)
            .await
            .map_err(|e| NodeError::Blob(format!("failed to check blob: {}", e)))?;
        if !present {
            return Ok(None);
        }
        let data = blobs
            .get_bytes(*hash)
            .await
            .map_err(|e| NodeError::Blob(format!("failed to read blob: {}", e)))?;
        Ok(Some(data))
    }

    /// Release a transfer blob. Untagged blobs are collected by the store's
    /// GC; nothing further to do here.
    pub fn discard(&self, hash: &Hash) {
        debug!(?hash, "transfer blob released");
    }

    /// Fetch a blob from `provider` into the local store. `on_progress` is
    /// invoked with the cumulative byte count as the transfer streams; every
    /// stream event re-arms the inactivity watchdog, and a stall longer than
    /// `inactivity` fails the download.
    pub async fn download(
        &self,
        hash: Hash,
        provider: EndpointId,
        endpoint: &Endpoint,
        inactivity: Duration,
        mut on_progress: impl FnMut(u64),
    ) -> NodeResult<()> {
        use iroh_blobs::api::downloader::DownloadProgessItem;

        let store = self.store();
        let downloader = store.downloader(endpoint);
        let mut stream = downloader
            .download(hash, vec![provider])
            .stream()
            .await
            .map_err(|e| NodeError::Blob(format!("failed to start download: {}", e)))?;

        loop {
            match tokio::time::timeout(inactivity, stream.next()).await {
                Err(_) => {
                    return Err(NodeError::InactivityTimeout(hex::encode(hash.as_bytes())));
                }
                Ok(None) => break,
                Ok(Some(DownloadProgessItem::Progress(bytes))) => {
                    on_progress(bytes);
                }
                Ok(Some(event)) => {
                    debug!(?hash, ?event, "download progress");
                }
            }
        }
        Ok(())
    }

    /// Parse a 64-char hex string into a blob hash.
    pub fn parse_hash(hex_str: &str) -> NodeResult<Hash> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| NodeError::InvalidReference(format!("bad blob hash hex: {}", e)))?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            NodeError::InvalidReference("blob hash must be 32 bytes".to_string())
        })?;
        Ok(Hash::from_bytes(arr))
    }

    pub fn hash_to_hex(hash: &Hash) -> String {
        hex::encode(hash.as_bytes())
    }
}
