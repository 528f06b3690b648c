//! A single signed append-only log with a sorted-map layer.

use std::collections::BTreeMap;
use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use crate::error::{NodeError, NodeResult};
use crate::types::FileRecord;

use super::Journal;

/// Domain separator for entry signatures.
const SIGNING_CONTEXT: &[u8] = b"peerdrive/journal/v1";

/// Capacity of the append-notification channel.
const NOTIFY_CAPACITY: usize = 64;

/// One operation on the sorted-map layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogOp {
    Put { path: String, record: FileRecord },
    /// Tombstone for a deleted path
    Del { path: String },
}

impl LogOp {
    pub fn path(&self) -> &str {
        match self {
            LogOp::Put { path, .. } | LogOp::Del { path } => path,
        }
    }
}

/// A signed log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub op: LogOp,
    /// ed25519 signature over the entry digest
    pub signature: Vec<u8>,
}

/// One row of a version diff. `left` carries the value at the newer version,
/// `right` the value at the older one; a row is only produced when they
/// differ.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffRow {
    pub path: String,
    pub left: Option<FileRecord>,
    pub right: Option<FileRecord>,
}

/// Pending operations flushed to the log in one transaction.
#[derive(Debug, Default)]
pub struct LogBatch {
    ops: Vec<LogOp>,
}

impl LogBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, record: FileRecord) {
        self.ops.push(LogOp::Put {
            path: record.path.clone(),
            record,
        });
    }

    pub fn del(&mut self, path: impl Into<String>) {
        self.ops.push(LogOp::Del { path: path.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

struct LogState {
    entries: Vec<LogEntry>,
    map: BTreeMap<String, FileRecord>,
}

struct LogInner {
    journal: Journal,
    name: String,
    verifying: VerifyingKey,
    signing: Option<SigningKey>,
    state: Mutex<LogState>,
    notify: broadcast::Sender<u64>,
}

/// Handle to one log. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Log {
    inner: Arc<LogInner>,
}

fn entry_digest(seq: u64, op: &LogOp) -> NodeResult<[u8; 32]> {
    let op_bytes =
        postcard::to_allocvec(op).map_err(|e| NodeError::Serialization(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(SIGNING_CONTEXT);
    hasher.update(seq.to_be_bytes());
    hasher.update(&op_bytes);
    Ok(hasher.finalize().into())
}

fn apply_op(map: &mut BTreeMap<String, FileRecord>, op: &LogOp) {
    match op {
        LogOp::Put { path, record } => {
            map.insert(path.clone(), record.clone());
        }
        LogOp::Del { path } => {
            map.remove(path);
        }
    }
}

impl Log {
    pub(super) fn new(
        journal: Journal,
        name: String,
        verifying: VerifyingKey,
        signing: Option<SigningKey>,
        entries: Vec<LogEntry>,
    ) -> NodeResult<Self> {
        let mut map = BTreeMap::new();
        for entry in &entries {
            apply_op(&mut map, &entry.op);
        }
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Ok(Self {
            inner: Arc::new(LogInner {
                journal,
                name,
                verifying,
                signing,
                state: Mutex::new(LogState { entries, map }),
                notify,
            }),
        })
    }

    /// Number of appended entries.
    pub fn version(&self) -> u64 {
        self.inner.state.lock().entries.len() as u64
    }

    /// The log key (the writer's verifying key).
    pub fn key(&self) -> VerifyingKey {
        self.inner.verifying
    }

    pub fn key_hex(&self) -> String {
        hex::encode(self.inner.verifying.to_bytes())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current value for a path.
    pub fn get(&self, path: &str) -> Option<FileRecord> {
        self.inner.state.lock().map.get(path).cloned()
    }

    /// Snapshot of the whole sorted map.
    pub fn snapshot(&self) -> BTreeMap<String, FileRecord> {
        self.inner.state.lock().map.clone()
    }

    /// Subscribe to append notifications (the new version is sent).
    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.inner.notify.subscribe()
    }

    /// Append a single Put.
    pub fn put(&self, record: FileRecord) -> NodeResult<u64> {
        let mut batch = LogBatch::new();
        batch.put(record);
        self.flush(batch)
    }

    /// Append a single tombstone.
    pub fn del(&self, path: impl Into<String>) -> NodeResult<u64> {
        let mut batch = LogBatch::new();
        batch.del(path);
        self.flush(batch)
    }

    /// Sign, persist, and apply a batch of operations; one notification for
    /// the whole batch. The in-memory map only changes after the entries are
    /// durably written.
    pub fn flush(&self, batch: LogBatch) -> NodeResult<u64> {
        if batch.is_empty() {
            return Ok(self.version());
        }
        let signing = self
            .inner
            .signing
            .as_ref()
            .ok_or_else(|| NodeError::Journal(format!("log {} is read-only", self.inner.name)))?;

        let mut state = self.inner.state.lock();
        let mut seq = state.entries.len() as u64;
        let mut entries = Vec::with_capacity(batch.ops.len());
        for op in batch.ops {
            let digest = entry_digest(seq, &op)?;
            let signature = signing.sign(&digest).to_bytes().to_vec();
            entries.push(LogEntry { seq, op, signature });
            seq += 1;
        }

        self.inner.journal.append_entries(&self.inner.name, &entries)?;
        for entry in &entries {
            apply_op(&mut state.map, &entry.op);
        }
        state.entries.extend(entries);
        let version = state.entries.len() as u64;
        drop(state);

        let _ = self.inner.notify.send(version);
        Ok(version)
    }

    /// Entries with `seq >= from`.
    pub fn entries_since(&self, from: u64) -> Vec<LogEntry> {
        let state = self.inner.state.lock();
        state
            .entries
            .iter()
            .skip(from as usize)
            .cloned()
            .collect()
    }

    /// Verify and apply entries received from the wire. Entries already held
    /// are skipped; a sequence gap or bad signature rejects the whole call.
    pub fn apply_entries(&self, incoming: &[LogEntry]) -> NodeResult<u64> {
        let mut state = self.inner.state.lock();
        let mut fresh: Vec<LogEntry> = Vec::new();

        for entry in incoming {
            let next = state.entries.len() as u64 + fresh.len() as u64;
            if entry.seq < next {
                continue;
            }
            if entry.seq > next {
                return Err(NodeError::Journal(format!(
                    "sequence gap in {}: expected {}, got {}",
                    self.inner.name, next, entry.seq
                )));
            }
            let digest = entry_digest(entry.seq, &entry.op)?;
            let signature = Signature::from_slice(&entry.signature)
                .map_err(|e| NodeError::Journal(format!("bad signature encoding: {}", e)))?;
            self.inner
                .verifying
                .verify(&digest, &signature)
                .map_err(|_| {
                    NodeError::Journal(format!(
                        "signature verification failed for {} seq {}",
                        self.inner.name, entry.seq
                    ))
                })?;
            fresh.push(entry.clone());
        }

        if fresh.is_empty() {
            return Ok(state.entries.len() as u64);
        }

        self.inner.journal.append_entries(&self.inner.name, &fresh)?;
        for entry in &fresh {
            apply_op(&mut state.map, &entry.op);
        }
        state.entries.extend(fresh);
        let version = state.entries.len() as u64;
        drop(state);

        let _ = self.inner.notify.send(version);
        Ok(version)
    }

    /// Drop all entries, on disk and in memory. Used when the writer's log
    /// was re-created and the mirror must start over.
    pub fn reset(&self) -> NodeResult<()> {
        let mut state = self.inner.state.lock();
        self.inner.journal.clear_log(&self.inner.name)?;
        state.entries.clear();
        state.map.clear();
        drop(state);
        let _ = self.inner.notify.send(0);
        Ok(())
    }

    /// Map snapshot as of `version` (replays the entry prefix).
    pub fn checkout(&self, version: u64) -> BTreeMap<String, FileRecord> {
        let state = self.inner.state.lock();
        let mut map = BTreeMap::new();
        for entry in state.entries.iter().take(version as usize) {
            apply_op(&mut map, &entry.op);
        }
        map
    }

    /// Path-ordered rows where the map differs between two versions.
    /// `left` is the value at `to` (newer), `right` at `from` (older).
    pub fn diff(&self, from: u64, to: u64) -> Vec<DiffRow> {
        let older = self.checkout(from);
        let newer = self.checkout(to);

        let mut paths: Vec<&String> = newer.keys().chain(older.keys()).collect();
        paths.sort();
        paths.dedup();

        let mut rows = Vec::new();
        for path in paths {
            let left = newer.get(path);
            let right = older.get(path);
            if left != right {
                rows.push(DiffRow {
                    path: path.clone(),
                    left: left.cloned(),
                    right: right.cloned(),
                });
            }
        }
        rows
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("name", &self.inner.name)
            .field("version", &self.version())
            .finish()
    }
}
