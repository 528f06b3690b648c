//! Error types for peerdrive nodes

use thiserror::Error;

/// Main error type for node operations
#[derive(Error, Debug)]
pub enum NodeError {
    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The requested file is not in the local index
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// A transfer reference did not have the expected shape
    #[error("Invalid transfer reference: {0}")]
    InvalidReference(String),

    /// No bytes observed on a download stream for the watchdog period
    #[error("Download inactive for too long: {0}")]
    InactivityTimeout(String),

    /// Downloaded byte count does not match the declared blob size
    #[error("Incomplete download of {path}: expected {expected} bytes, got {actual}")]
    Incomplete {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// Downloaded content does not hash to the peer's advertised value
    #[error("Hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Named peer has no active channel
    #[error("No connected peer: {0}")]
    NoPeer(String),

    /// Incoming user message has no registered handler
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// Malformed inbound protocol payload
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation aborted by close() or peer disconnect
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// Error during gossip topic operations
    #[error("Gossip error: {0}")]
    Gossip(String),

    /// Blob store operation failed
    #[error("Blob error: {0}")]
    Blob(String),

    /// Append-only log integrity failure (bad signature, sequence gap)
    #[error("Journal error: {0}")]
    Journal(String),

    /// A path still has in-flight transfers
    #[error("Transfer still active for: {0}")]
    TransferActive(String),

    /// A peer or log key could not be parsed
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl NodeError {
    /// Short machine-readable kind, used in `DOWNLOAD_FAILED` events.
    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::Io(_) => "io_error",
            NodeError::Database(_)
            | NodeError::Transaction(_)
            | NodeError::Table(_)
            | NodeError::StorageOp(_)
            | NodeError::Commit(_) => "io_error",
            NodeError::Serialization(_) => "serialization",
            NodeError::FileNotFound(_) => "not_found",
            NodeError::InvalidReference(_) => "invalid_reference",
            NodeError::InactivityTimeout(_) => "inactivity_timeout",
            NodeError::Incomplete { .. } => "incomplete",
            NodeError::HashMismatch { .. } => "hash_mismatch",
            NodeError::NoPeer(_) => "no_peer",
            NodeError::UnknownMessageType(_) => "unknown_message_type",
            NodeError::Protocol(_) => "protocol_error",
            NodeError::Cancelled(_) => "cancelled",
            NodeError::Network(_) => "network",
            NodeError::Gossip(_) => "network",
            NodeError::Blob(_) => "io_error",
            NodeError::Journal(_) => "io_error",
            NodeError::TransferActive(_) => "transfer_active",
            NodeError::InvalidKey(_) => "invalid_key",
        }
    }
}

/// Result type alias using NodeError
pub type NodeResult<T> = Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NodeError::FileNotFound("a.txt".to_string());
        assert_eq!(format!("{}", err), "File not found: a.txt");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: NodeError = io_err.into();
        assert!(matches!(err, NodeError::Io(_)));
        assert_eq!(err.kind(), "io_error");
    }

    #[test]
    fn test_incomplete_kind() {
        let err = NodeError::Incomplete {
            path: "a.txt".to_string(),
            expected: 10,
            actual: 7,
        };
        assert_eq!(err.kind(), "incomplete");
        assert!(format!("{}", err).contains("expected 10"));
    }

    #[test]
    fn test_hash_mismatch_kind() {
        let err = NodeError::HashMismatch {
            path: "a.txt".to_string(),
            expected: "aa".repeat(32),
            actual: "bb".repeat(32),
        };
        assert_eq!(err.kind(), "hash_mismatch");
        assert!(format!("{}", err).contains("Hash mismatch for a.txt"));
    }
}
