//! Node configuration and persistent save-data.
//!
//! `SaveData` is the authoritative boot record: everything needed to resume
//! a node (seed, network key, paths, options, queued downloads). The node
//! emits a fresh copy on every mutation that affects it, and must accept any
//! save-data it has previously emitted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{NetworkKey, NodeSeed};

/// Archive wake interval as a multiple of the poll interval.
pub const RELAY_INTERVAL_FACTOR: u32 = 3;

/// Default local index poll interval
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Local file index options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Automatically download every network file not already local
    pub archive: bool,
    /// Full rescan interval for the watch directory
    pub poll_interval_ms: u64,
    /// Use OS filesystem-watch events in addition to polling
    pub watch: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            archive: false,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            watch: true,
        }
    }
}

impl IndexOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Archive loop wake interval (poll interval × 3).
    pub fn archive_interval(&self) -> Duration {
        self.poll_interval() * RELAY_INTERVAL_FACTOR
    }
}

/// Logging options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOptions {
    /// Append JSONL log entries to this file in addition to stderr
    pub file: Option<PathBuf>,
}

/// Everything a node needs at open() time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Directory whose files are indexed and shared
    pub watch_path: PathBuf,
    /// Directory for the journal database and blob store
    pub store_path: PathBuf,
    /// Per-node secret seed (endpoint identity + index-log signing key)
    pub seed: NodeSeed,
    /// Network to join; `None` until the first `join()`
    pub network_key: Option<NetworkKey>,
    pub index: IndexOptions,
    pub log: LogOptions,
}

impl NodeConfig {
    /// New configuration with a fresh random seed.
    pub fn new(watch_path: impl AsRef<Path>, store_path: impl AsRef<Path>) -> Self {
        Self {
            watch_path: watch_path.as_ref().to_path_buf(),
            store_path: store_path.as_ref().to_path_buf(),
            seed: NodeSeed::generate(),
            network_key: None,
            index: IndexOptions::default(),
            log: LogOptions::default(),
        }
    }

    /// Build the save-data view for the given queued-download set.
    pub fn save_data(&self, queued_downloads: Vec<String>) -> SaveData {
        SaveData {
            seed: self.seed,
            network_key: self.network_key,
            watch_path: self.watch_path.clone(),
            store_path: self.store_path.clone(),
            index: self.index.clone(),
            log: self.log.clone(),
            queued_downloads,
        }
    }
}

/// Serialized boot configuration plus the queued-download set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveData {
    pub seed: NodeSeed,
    pub network_key: Option<NetworkKey>,
    pub watch_path: PathBuf,
    pub store_path: PathBuf,
    pub index: IndexOptions,
    pub log: LogOptions,
    /// Paths to fetch when a peer first advertises them. In the emitted view
    /// this is the union of the queued set and in-progress downloads.
    pub queued_downloads: Vec<String>,
}

impl SaveData {
    /// Split back into a boot configuration and the queued set.
    pub fn into_config(self) -> (NodeConfig, Vec<String>) {
        (
            NodeConfig {
                watch_path: self.watch_path,
                store_path: self.store_path,
                seed: self.seed,
                network_key: self.network_key,
                index: self.index,
                log: self.log,
            },
            self.queued_downloads,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = IndexOptions::default();
        assert!(!opts.archive);
        assert!(opts.watch);
        assert_eq!(opts.poll_interval(), Duration::from_millis(5_000));
        assert_eq!(opts.archive_interval(), Duration::from_millis(15_000));
    }

    #[test]
    fn test_save_data_json_roundtrip() {
        let mut config = NodeConfig::new("/tmp/watch", "/tmp/store");
        config.network_key = Some(NetworkKey::generate());
        config.index.archive = true;

        let save = config.save_data(vec!["x.txt".to_string()]);
        let json = serde_json::to_string(&save).unwrap();
        let back: SaveData = serde_json::from_str(&json).unwrap();
        assert_eq!(save, back);

        let (config2, queued) = back.into_config();
        assert_eq!(config2, config);
        assert_eq!(queued, vec!["x.txt".to_string()]);
    }

    #[test]
    fn test_save_data_keys_are_hex_strings() {
        let config = NodeConfig::new("/tmp/watch", "/tmp/store");
        let save = config.save_data(vec![]);
        let json = serde_json::to_value(&save).unwrap();
        assert!(json["seed"].is_string());
        assert!(json["network_key"].is_null());
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let opts = IndexOptions {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(opts.poll_interval() > Duration::ZERO);
    }
}
