//! Append-only log store backed by redb.
//!
//! The journal holds one named log per concern: the node's own file index
//! plus one mirror per observed peer (`remote/<key>`). Each log is a
//! sequence of ed25519-signed entries; the log key is the signer's verifying
//! key, so a mirror can check integrity without trusting the transport.
//!
//! Logs expose a bee-style sorted-map layer (`path -> FileRecord`) with
//! snapshots (`checkout`), version diffs, and live-append notifications.

mod log;

use std::path::Path;
use std::sync::Arc;

use ed25519_dalek::{SigningKey, VerifyingKey};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use sha2::{Digest, Sha256};

use crate::error::{NodeError, NodeResult};

pub use log::{DiffRow, Log, LogBatch, LogEntry, LogOp};

/// All log entries, keyed by (log name, sequence number).
const LOG_ENTRIES_TABLE: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("log_entries");

/// Name of the node's own index log.
pub const LOCAL_INDEX_LOG: &str = "local/index";

/// Derive the index-log signing key from the node seed.
pub fn derive_signing_key(seed: &[u8; 32]) -> SigningKey {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(b"peerdrive/index-log/v1");
    let digest: [u8; 32] = hasher.finalize().into();
    SigningKey::from_bytes(&digest)
}

/// Log store over a single redb database file.
#[derive(Clone)]
pub struct Journal {
    db: Arc<RwLock<Database>>,
}

impl Journal {
    /// Open (or create) the journal database at `dir/journal.redb`.
    pub fn open(dir: impl AsRef<Path>) -> NodeResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let db = Database::create(dir.join("journal.redb"))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(LOG_ENTRIES_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Open the writable log with the given name.
    pub fn open_log(&self, name: &str, signing: SigningKey) -> NodeResult<Log> {
        let entries = self.load_entries(name)?;
        Log::new(self.clone(), name.to_string(), signing.verifying_key(), Some(signing), entries)
    }

    /// Open the read-only mirror of a peer's log, named by its key.
    pub fn open_remote(&self, key: VerifyingKey) -> NodeResult<Log> {
        let name = format!("remote/{}", hex::encode(key.to_bytes()));
        let entries = self.load_entries(&name)?;
        Log::new(self.clone(), name, key, None, entries)
    }

    pub(crate) fn load_entries(&self, name: &str) -> NodeResult<Vec<LogEntry>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(LOG_ENTRIES_TABLE)?;

        let mut entries = Vec::new();
        for item in table.range((name, 0u64)..=(name, u64::MAX))? {
            let (_, value) = item?;
            let entry: LogEntry = postcard::from_bytes(value.value())
                .map_err(|e| NodeError::Serialization(e.to_string()))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    pub(crate) fn append_entries(&self, name: &str, entries: &[LogEntry]) -> NodeResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(LOG_ENTRIES_TABLE)?;
            for entry in entries {
                let bytes = postcard::to_allocvec(entry)
                    .map_err(|e| NodeError::Serialization(e.to_string()))?;
                table.insert((name, entry.seq), bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Drop every entry of a log (used when a peer's log was re-created).
    pub(crate) fn clear_log(&self, name: &str) -> NodeResult<()> {
        let seqs: Vec<u64> = {
            let db = self.db.read();
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(LOG_ENTRIES_TABLE)?;
            let mut seqs = Vec::new();
            for item in table.range((name, 0u64)..=(name, u64::MAX))? {
                let (key, _) = item?;
                seqs.push(key.value().1);
            }
            seqs
        };

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(LOG_ENTRIES_TABLE)?;
            for seq in seqs {
                table.remove((name, seq))?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").finish()
    }
}
