//! Core types for peerdrive nodes

use std::fmt;

use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Wire tag for a transfer reference payload.
pub const TRANSFER_TYPE: &str = "hyperblobs";

/// The 32-byte shared secret that doubles as the discovery topic.
///
/// Anyone holding the key can join the network and read every index.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkKey(pub [u8; 32]);

impl NetworkKey {
    /// Generate a fresh random network key
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64-character hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkKey({}…)", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", hex::encode(&self.0[..4]))
    }
}

impl Serialize for NetworkKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NetworkKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NetworkKey::from_hex(&s).map_err(D::Error::custom)
    }
}

/// Per-node secret seed. The endpoint identity and the index-log signing key
/// are both derived from it, so save-data with the seed is enough to resume
/// the node.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NodeSeed(pub [u8; 32]);

impl NodeSeed {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for NodeSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the full seed
        write!(f, "NodeSeed({}…)", hex::encode(&self.0[..2]))
    }
}

impl Serialize for NodeSeed {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeSeed {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeSeed::from_hex(&s).map_err(D::Error::custom)
    }
}

/// Metadata for a single indexed file, keyed by its watch-path-relative path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Forward-slash relative path (same as the index key)
    pub path: String,
    /// File size in bytes
    pub size: u64,
    /// Modification time, milliseconds since the Unix epoch.
    /// Only used for change detection, never for cross-peer ordering.
    pub modified: f64,
    /// Hex-encoded SHA-256 of the full file contents
    pub hash: String,
}

/// Direction of an in-flight transfer, seen from the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Locator for a single blob within a peer's content store.
///
/// Carries the declared byte length so the downloader can verify it received
/// the whole blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobId {
    /// Hex-encoded blob hash
    pub hash: String,
    /// Declared byte length
    pub size: u64,
}

/// Wire reference to a one-shot transfer object: the store it is published
/// under (`key`) and the blob locator within it (`id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRef {
    #[serde(rename = "type")]
    pub kind: String,
    /// Hex-encoded public key of the providing store
    pub key: String,
    pub id: BlobId,
}

impl TransferRef {
    pub fn new(key: String, id: BlobId) -> Self {
        Self {
            kind: TRANSFER_TYPE.to_string(),
            key,
            id,
        }
    }

    /// Shape check used on both ends of a FILE_REQUEST.
    pub fn is_valid(&self) -> bool {
        self.kind == TRANSFER_TYPE && self.key.len() == 64 && self.id.hash.len() == 64
    }
}
