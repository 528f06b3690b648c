//! The transfer table: which paths are endpoints of in-flight transfers.
//!
//! A path keyed here (in drive-path form, see [`crate::paths::drive_path`])
//! is "busy": the local index must not hash, re-record, or delete it while
//! its bytes may be mid-stream. Entries live from transfer start until both
//! sides release.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::paths;
use crate::types::TransferDirection;

/// One in-flight transfer with a single peer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferEntry {
    pub direction: TransferDirection,
    /// Milliseconds since the Unix epoch
    pub started_at: i64,
}

/// Two-level map: drive path -> peer hex -> entry.
#[derive(Debug, Clone, Default)]
pub struct TransferTable {
    inner: Arc<Mutex<HashMap<String, HashMap<String, TransferEntry>>>>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transfer start. Returns `false` if the same (path, peer)
    /// pair already had an entry.
    pub fn begin(&self, drive_path: &str, peer: &str, direction: TransferDirection) -> bool {
        let mut table = self.inner.lock();
        let peers = table.entry(drive_path.to_string()).or_default();
        peers
            .insert(
                peer.to_string(),
                TransferEntry {
                    direction,
                    started_at: chrono::Utc::now().timestamp_millis(),
                },
            )
            .is_none()
    }

    /// Remove one (path, peer) entry.
    pub fn end(&self, drive_path: &str, peer: &str) -> Option<TransferEntry> {
        let mut table = self.inner.lock();
        let entry = table.get_mut(drive_path)?.remove(peer);
        if table.get(drive_path).is_some_and(|m| m.is_empty()) {
            table.remove(drive_path);
        }
        entry
    }

    /// Remove every entry for a path.
    pub fn end_all(&self, drive_path: &str) -> Vec<(String, TransferEntry)> {
        let mut table = self.inner.lock();
        table
            .remove(drive_path)
            .map(|m| m.into_iter().collect())
            .unwrap_or_default()
    }

    /// Top-level key presence is the busy flag.
    pub fn is_busy(&self, drive_path: &str) -> bool {
        self.inner.lock().contains_key(drive_path)
    }

    /// Number of active transfers for a path.
    pub fn active(&self, drive_path: &str) -> usize {
        self.inner
            .lock()
            .get(drive_path)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Relative paths currently being downloaded (for save-data).
    pub fn downloads(&self) -> Vec<String> {
        let table = self.inner.lock();
        let mut out: Vec<String> = table
            .iter()
            .filter(|(_, peers)| {
                peers
                    .values()
                    .any(|e| e.direction == TransferDirection::Download)
            })
            .map(|(path, _)| paths::from_drive_path(path).to_string())
            .collect();
        out.sort();
        out
    }

    /// Remove and return everything (used by close()).
    pub fn drain(&self) -> Vec<(String, String, TransferEntry)> {
        let mut table = self.inner.lock();
        let mut out = Vec::new();
        for (path, peers) in table.drain() {
            for (peer, entry) in peers {
                out.push((path.clone(), peer, entry));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_flag_lifecycle() {
        let table = TransferTable::new();
        assert!(!table.is_busy("/a.txt"));

        assert!(table.begin("/a.txt", "peer1", TransferDirection::Upload));
        assert!(table.is_busy("/a.txt"));
        assert!(!table.begin("/a.txt", "peer1", TransferDirection::Upload));

        table.end("/a.txt", "peer1");
        assert!(!table.is_busy("/a.txt"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_multiple_peers_one_path() {
        let table = TransferTable::new();
        table.begin("/a.txt", "peer1", TransferDirection::Upload);
        table.begin("/a.txt", "peer2", TransferDirection::Upload);
        assert_eq!(table.active("/a.txt"), 2);

        table.end("/a.txt", "peer1");
        assert!(table.is_busy("/a.txt"));
        table.end("/a.txt", "peer2");
        assert!(!table.is_busy("/a.txt"));
    }

    #[test]
    fn test_end_all() {
        let table = TransferTable::new();
        table.begin("/a.txt", "peer1", TransferDirection::Upload);
        table.begin("/a.txt", "peer2", TransferDirection::Download);
        let ended = table.end_all("/a.txt");
        assert_eq!(ended.len(), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn test_downloads_listing() {
        let table = TransferTable::new();
        table.begin("/up.txt", "peer1", TransferDirection::Upload);
        table.begin("/down.txt", "peer1", TransferDirection::Download);
        table.begin("/nested/d.bin", "peer2", TransferDirection::Download);

        assert_eq!(
            table.downloads(),
            vec!["down.txt".to_string(), "nested/d.bin".to_string()]
        );
    }

    #[test]
    fn test_drain() {
        let table = TransferTable::new();
        table.begin("/a.txt", "peer1", TransferDirection::Upload);
        table.begin("/b.txt", "peer2", TransferDirection::Download);
        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
    }
}
