//! Local File Index: keeps the node's own log in step with the watch
//! directory.
//!
//! Two sources of change feed one sink. A periodic poll rescans the whole
//! tree; OS watch events handle single paths with a debounce. Both funnel
//! through the same compare-then-hash logic, and both leave busy files
//! (in-flight transfer endpoints) strictly alone.
//!
//! The `(size, modified)` pair is the quick-change key: when both match the
//! cached record the hash is assumed unchanged and not recomputed.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::IndexOptions;
use crate::error::{NodeError, NodeResult};
use crate::events::{emit, NodeEvent};
use crate::hashing;
use crate::journal::{Log, LogBatch};
use crate::paths;
use crate::transfer::TransferTable;
use crate::types::FileRecord;

/// Per-path debounce for raw watch events.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(500);

struct LocalIndexInner {
    watch_path: PathBuf,
    log: Log,
    transfers: TransferTable,
    events: broadcast::Sender<NodeEvent>,
    options: IndexOptions,
    /// Poller/watcher re-arm gate
    enabled: AtomicBool,
    /// At most one full scan at a time
    scanning: AtomicBool,
    /// Paths currently being handled by a watch-event fire
    processing: Mutex<HashSet<String>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The node's own file index.
#[derive(Clone)]
pub struct LocalIndex {
    inner: Arc<LocalIndexInner>,
}

impl LocalIndex {
    /// Open the index over an existing log handle. The in-memory cache is
    /// the log's materialized map, loaded when the log was opened.
    pub fn open(
        watch_path: impl Into<PathBuf>,
        log: Log,
        transfers: TransferTable,
        events: broadcast::Sender<NodeEvent>,
        options: IndexOptions,
    ) -> NodeResult<Self> {
        let watch_path = watch_path.into();
        std::fs::create_dir_all(&watch_path)?;
        Ok(Self {
            inner: Arc::new(LocalIndexInner {
                watch_path,
                log,
                transfers,
                events,
                options,
                enabled: AtomicBool::new(false),
                scanning: AtomicBool::new(false),
                processing: Mutex::new(HashSet::new()),
                watcher: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Start the poller and (if configured) the filesystem watcher.
    pub fn start(&self) {
        if self.inner.enabled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.spawn_poller();
        if self.inner.options.watch {
            if let Err(e) = self.spawn_watcher() {
                warn!(error = %e, "failed to install filesystem watcher, polling only");
            }
        }
    }

    /// Stop background work. The log handle stays readable.
    pub fn close(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        self.inner.watcher.lock().take();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// The underlying log handle.
    pub fn log(&self) -> &Log {
        &self.inner.log
    }

    pub fn watch_path(&self) -> &std::path::Path {
        &self.inner.watch_path
    }

    /// Snapshot of all records, path-sorted.
    pub fn list(&self) -> Vec<FileRecord> {
        self.inner.log.snapshot().into_values().collect()
    }

    /// Cached record for a path.
    pub fn get(&self, path: &str) -> Option<FileRecord> {
        self.inner.log.get(&paths::normalize(path))
    }

    /// True while the path is an endpoint of any in-flight transfer.
    pub fn is_busy(&self, path: &str) -> bool {
        self.inner.transfers.is_busy(&paths::drive_path(path))
    }

    /// Full rescan of the watch directory. Reentrancy-safe: a call while a
    /// scan is already running returns without scheduling another.
    pub async fn poll_once(&self) -> NodeResult<()> {
        if self.inner.scanning.swap(true, Ordering::SeqCst) {
            debug!("scan already running, skipping");
            return Ok(());
        }
        let result = self.scan().await;
        self.inner.scanning.store(false, Ordering::SeqCst);
        result
    }

    fn spawn_poller(&self) {
        let index = self.clone();
        let interval = self.inner.options.poll_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !index.inner.enabled.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = index.poll_once().await {
                    warn!(error = %e, "scan failed");
                }
            }
        });
        self.inner.tasks.lock().push(task);
    }

    fn spawn_watcher(&self) -> NodeResult<()> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<PathBuf>();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            })
            .map_err(|e| NodeError::Io(std::io::Error::other(e)))?;
        watcher
            .watch(&self.inner.watch_path, RecursiveMode::Recursive)
            .map_err(|e| NodeError::Io(std::io::Error::other(e)))?;
        *self.inner.watcher.lock() = Some(watcher);

        let index = self.clone();
        let task = tokio::spawn(async move {
            let mut pending: HashMap<String, tokio::time::Instant> = HashMap::new();
            loop {
                if !index.inner.enabled.load(Ordering::SeqCst) {
                    break;
                }
                let next_deadline = pending.values().min().copied();
                let sleep_until = next_deadline
                    .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
                tokio::select! {
                    received = rx.recv() => {
                        match received {
                            Some(abs) => {
                                if let Some(rel) = paths::to_rel(&index.inner.watch_path, &abs) {
                                    pending.insert(rel, tokio::time::Instant::now() + WATCH_DEBOUNCE);
                                }
                            }
                            None => break,
                        }
                    }
                    _ = tokio::time::sleep_until(sleep_until) => {
                        let now = tokio::time::Instant::now();
                        let due: Vec<String> = pending
                            .iter()
                            .filter(|(_, deadline)| **deadline <= now)
                            .map(|(path, _)| path.clone())
                            .collect();
                        for rel in due {
                            pending.remove(&rel);
                            index.handle_watch_fire(rel);
                        }
                    }
                }
            }
        });
        self.inner.tasks.lock().push(task);
        Ok(())
    }

    /// Debounce fired for a path; run the handler unless one is already
    /// running for the same path.
    fn handle_watch_fire(&self, rel: String) {
        if !self.inner.processing.lock().insert(rel.clone()) {
            return;
        }
        let index = self.clone();
        tokio::spawn(async move {
            if let Err(e) = index.sync_path(&rel).await {
                warn!(path = %rel, error = %e, "watch event handling failed");
            }
            index.inner.processing.lock().remove(&rel);
        });
    }

    /// Bring a single path in line with the filesystem: delete the record
    /// when the path is gone, recurse into new directories, otherwise run
    /// the same compare/hash logic as the poller.
    pub(crate) async fn sync_path(&self, rel: &str) -> NodeResult<()> {
        let rel = paths::normalize(rel);
        if rel.is_empty() || self.is_busy(&rel) {
            return Ok(());
        }
        let abs = paths::to_abs(&self.inner.watch_path, &rel);

        let metadata = match tokio::fs::metadata(&abs).await {
            Err(_) => {
                if self.inner.log.get(&rel).is_some() {
                    self.inner.log.del(rel.clone())?;
                    emit(&self.inner.events, NodeEvent::LocalFileRemoved { path: rel });
                }
                return Ok(());
            }
            Ok(md) => md,
        };

        if metadata.is_dir() {
            let files = {
                let abs = abs.clone();
                tokio::task::spawn_blocking(move || list_files(&abs))
                    .await
                    .map_err(|e| NodeError::Io(std::io::Error::other(e)))?
            };
            for sub in files {
                if let Some(sub_rel) = paths::to_rel(&self.inner.watch_path, &sub.0) {
                    self.sync_file(&sub_rel, sub.1, sub.2).await?;
                }
            }
            return Ok(());
        }

        let size = metadata.len();
        let modified = modified_ms(&metadata);
        self.sync_file(&rel, size, modified).await
    }

    /// Compare one file against the cache; hash and record when it changed.
    async fn sync_file(&self, rel: &str, size: u64, modified: f64) -> NodeResult<()> {
        if self.is_busy(rel) {
            return Ok(());
        }
        let cached = self.inner.log.get(rel);
        if let Some(prev) = &cached {
            if prev.size == size && prev.modified == modified {
                return Ok(());
            }
        }

        let abs = paths::to_abs(&self.inner.watch_path, rel);
        let hash = match hashing::hash_file_async(abs).await {
            Ok(hash) => hash,
            Err(e) => {
                // Transient: the file vanished or is unreadable; the next
                // scan or watch event retries.
                debug!(path = %rel, error = %e, "skipping unreadable file");
                return Ok(());
            }
        };

        let record = FileRecord {
            path: rel.to_string(),
            size,
            modified,
            hash: hash.clone(),
        };

        let event = match &cached {
            None => Some(NodeEvent::LocalFileAdded {
                path: rel.to_string(),
                hash,
            }),
            Some(prev) if prev.hash != hash => Some(NodeEvent::LocalFileChanged {
                path: rel.to_string(),
                prev_hash: prev.hash.clone(),
                hash,
            }),
            // Only the quick-change key moved; refresh it silently.
            Some(_) => None,
        };

        match self.inner.log.put(record) {
            Ok(_) => {
                if let Some(event) = event {
                    emit(&self.inner.events, event);
                }
                Ok(())
            }
            Err(e) => {
                emit(
                    &self.inner.events,
                    NodeEvent::Error {
                        message: format!("index write failed for {}: {}", rel, e),
                    },
                );
                Err(e)
            }
        }
    }

    /// One full pass: walk the tree, update changed records, delete records
    /// whose files are gone. Events fire only after the batch is written.
    async fn scan(&self) -> NodeResult<()> {
        let root = self.inner.watch_path.clone();
        let listing = tokio::task::spawn_blocking(move || list_files(&root))
            .await
            .map_err(|e| NodeError::Io(std::io::Error::other(e)))?;

        let cache = self.inner.log.snapshot();
        let mut batch = LogBatch::new();
        let mut events = Vec::new();
        let mut seen = HashSet::new();

        for (abs, size, modified) in listing {
            let Some(rel) = paths::to_rel(&self.inner.watch_path, &abs) else {
                continue;
            };
            seen.insert(rel.clone());
            if self.is_busy(&rel) {
                continue;
            }
            if let Some(prev) = cache.get(&rel) {
                if prev.size == size && prev.modified == modified {
                    continue;
                }
            }

            let hash = match hashing::hash_file_async(abs).await {
                Ok(hash) => hash,
                Err(e) => {
                    debug!(path = %rel, error = %e, "skipping unreadable file");
                    continue;
                }
            };

            match cache.get(&rel) {
                None => events.push(NodeEvent::LocalFileAdded {
                    path: rel.clone(),
                    hash: hash.clone(),
                }),
                Some(prev) if prev.hash != hash => events.push(NodeEvent::LocalFileChanged {
                    path: rel.clone(),
                    prev_hash: prev.hash.clone(),
                    hash: hash.clone(),
                }),
                Some(_) => {}
            }
            batch.put(FileRecord {
                path: rel,
                size,
                modified,
                hash,
            });
        }

        for path in cache.keys() {
            if !seen.contains(path) && !self.is_busy(path) {
                batch.del(path.clone());
                events.push(NodeEvent::LocalFileRemoved { path: path.clone() });
            }
        }

        if batch.is_empty() {
            return Ok(());
        }
        debug!(ops = batch.len(), "synchronizing index log");
        match self.inner.log.flush(batch) {
            Ok(_) => {
                for event in events {
                    emit(&self.inner.events, event);
                }
                Ok(())
            }
            Err(e) => {
                emit(
                    &self.inner.events,
                    NodeEvent::Error {
                        message: format!("index log write failed: {}", e),
                    },
                );
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for LocalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIndex")
            .field("watch_path", &self.inner.watch_path)
            .field("version", &self.inner.log.version())
            .finish()
    }
}

/// Regular files under `root` with their quick-change keys. Unreadable
/// entries are skipped, not fatal.
fn list_files(root: &std::path::Path) -> Vec<(PathBuf, u64, f64)> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.metadata() {
            Ok(md) => out.push((entry.into_path(), md.len(), modified_ms(&md))),
            Err(e) => warn!(path = ?entry.path(), error = %e, "skipping unreadable file"),
        }
    }
    out
}

fn modified_ms(metadata: &std::fs::Metadata) -> f64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EVENT_CHANNEL_CAPACITY;
    use crate::journal::{derive_signing_key, Journal, LOCAL_INDEX_LOG};

    fn setup(dir: &std::path::Path) -> (LocalIndex, broadcast::Receiver<NodeEvent>, TransferTable) {
        let journal = Journal::open(dir.join("store")).unwrap();
        let log = journal
            .open_log(LOCAL_INDEX_LOG, derive_signing_key(&[1u8; 32]))
            .unwrap();
        let (tx, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let transfers = TransferTable::new();
        let index = LocalIndex::open(
            dir.join("watch"),
            log,
            transfers.clone(),
            tx,
            IndexOptions::default(),
        )
        .unwrap();
        (index, rx, transfers)
    }

    fn drain(rx: &mut broadcast::Receiver<NodeEvent>) -> Vec<NodeEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_scan_adds_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let (index, mut rx, _) = setup(dir.path());

        std::fs::write(index.watch_path().join("a.txt"), b"hello").unwrap();
        index.poll_once().await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], NodeEvent::LocalFileAdded { path, .. } if path == "a.txt"));
        assert_eq!(index.get("a.txt").unwrap().size, 5);

        std::fs::remove_file(index.watch_path().join("a.txt")).unwrap();
        index.poll_once().await.unwrap();
        let events = drain(&mut rx);
        assert!(matches!(&events[0], NodeEvent::LocalFileRemoved { path } if path == "a.txt"));
        assert!(index.get("a.txt").is_none());
    }

    #[tokio::test]
    async fn test_unchanged_files_are_not_rehashed_or_reemitted() {
        let dir = tempfile::tempdir().unwrap();
        let (index, mut rx, _) = setup(dir.path());

        std::fs::write(index.watch_path().join("a.txt"), b"hello").unwrap();
        index.poll_once().await.unwrap();
        drain(&mut rx);

        let version = index.log().version();
        index.poll_once().await.unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(index.log().version(), version);
    }

    #[tokio::test]
    async fn test_change_emits_with_prev_hash() {
        let dir = tempfile::tempdir().unwrap();
        let (index, mut rx, _) = setup(dir.path());
        let file = index.watch_path().join("a.txt");

        std::fs::write(&file, b"one").unwrap();
        index.poll_once().await.unwrap();
        let first_hash = index.get("a.txt").unwrap().hash;
        drain(&mut rx);

        // Force a different mtime so the quick-change key moves
        tokio::time::sleep(Duration::from_millis(20)).await;
        std::fs::write(&file, b"two!").unwrap();
        index.poll_once().await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            NodeEvent::LocalFileChanged {
                path,
                prev_hash,
                hash,
            } => {
                assert_eq!(path, "a.txt");
                assert_eq!(prev_hash, &first_hash);
                assert_ne!(hash, prev_hash);
            }
            other => panic!("expected LocalFileChanged, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nested_paths_and_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let (index, _rx, _) = setup(dir.path());

        let nested = index.watch_path().join("nested").join("with space");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("data file.bin"), b"x").unwrap();
        index.poll_once().await.unwrap();

        assert!(index.get("nested/with space/data file.bin").is_some());
    }

    #[tokio::test]
    async fn test_busy_files_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (index, mut rx, transfers) = setup(dir.path());
        let file = index.watch_path().join("a.txt");

        std::fs::write(&file, b"one").unwrap();
        index.poll_once().await.unwrap();
        drain(&mut rx);

        transfers.begin("/a.txt", "peer1", crate::types::TransferDirection::Download);

        // Neither the change nor the delete may touch the index while busy
        tokio::time::sleep(Duration::from_millis(20)).await;
        std::fs::write(&file, b"two").unwrap();
        index.poll_once().await.unwrap();
        assert!(drain(&mut rx).is_empty());

        std::fs::remove_file(&file).unwrap();
        index.poll_once().await.unwrap();
        assert!(drain(&mut rx).is_empty());
        assert!(index.get("a.txt").is_some());

        // Released: the next scan catches up
        transfers.end("/a.txt", "peer1");
        index.poll_once().await.unwrap();
        let events = drain(&mut rx);
        assert!(matches!(&events[0], NodeEvent::LocalFileRemoved { path } if path == "a.txt"));
    }

    #[tokio::test]
    async fn test_sync_path_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let (index, mut rx, _) = setup(dir.path());

        std::fs::write(index.watch_path().join("b.txt"), b"watch me").unwrap();
        index.sync_path("b.txt").await.unwrap();
        let events = drain(&mut rx);
        assert!(matches!(&events[0], NodeEvent::LocalFileAdded { path, .. } if path == "b.txt"));

        // Re-running with no change stays silent
        index.sync_path("b.txt").await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_sync_path_new_directory_recurses() {
        let dir = tempfile::tempdir().unwrap();
        let (index, mut rx, _) = setup(dir.path());

        let sub = index.watch_path().join("sub");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join("inner.txt"), b"deep").unwrap();

        index.sync_path("sub").await.unwrap();
        let events = drain(&mut rx);
        assert!(
            matches!(&events[0], NodeEvent::LocalFileAdded { path, .. } if path == "sub/inner.txt")
        );
    }
}
