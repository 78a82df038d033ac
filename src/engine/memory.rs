//! Reference engine backed by persistent ordered maps.
//!
//! Snapshots and cursors hold structural clones of the map, so taking a view
//! is O(1) and later writes never disturb an open view. Every store directory
//! may be opened by one store at a time, mirroring an engine LOCK file.

use super::table_file::{read_table, table_exists, write_table};
use super::{EngineError, NativeCursor, NativeStore, SnapshotToken, StoreBackend};
use crate::config::StoreConfig;
use im::OrdMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

type Table = OrdMap<Vec<u8>, Vec<u8>>;

/// Counters describing what the engine has handed out and taken back.
#[derive(Debug, Default)]
pub struct EngineStats {
    stores_opened: AtomicU64,
    stores_closed: AtomicU64,
    snapshots_created: AtomicU64,
    snapshots_released: AtomicU64,
    unknown_snapshot_releases: AtomicU64,
    cursors_opened: AtomicU64,
    cursors_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStatsSnapshot {
    pub stores_opened: u64,
    pub stores_closed: u64,
    pub snapshots_created: u64,
    pub snapshots_released: u64,
    pub unknown_snapshot_releases: u64,
    pub cursors_opened: u64,
    pub cursors_dropped: u64,
}

impl EngineStatsSnapshot {
    pub fn live_snapshots(&self) -> u64 {
        self.snapshots_created - self.snapshots_released
    }

    pub fn live_cursors(&self) -> u64 {
        self.cursors_opened - self.cursors_dropped
    }

    pub fn live_stores(&self) -> u64 {
        self.stores_opened - self.stores_closed
    }
}

impl EngineStats {
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            stores_opened: self.stores_opened.load(Ordering::SeqCst),
            stores_closed: self.stores_closed.load(Ordering::SeqCst),
            snapshots_created: self.snapshots_created.load(Ordering::SeqCst),
            snapshots_released: self.snapshots_released.load(Ordering::SeqCst),
            unknown_snapshot_releases: self.unknown_snapshot_releases.load(Ordering::SeqCst),
            cursors_opened: self.cursors_opened.load(Ordering::SeqCst),
            cursors_dropped: self.cursors_dropped.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    locked: Arc<Mutex<HashSet<PathBuf>>>,
    stats: Arc<EngineStats>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn stats_handle(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }
}

impl StoreBackend for MemoryBackend {
    fn open(&self, path: &Path, config: &StoreConfig) -> Result<Box<dyn NativeStore>, EngineError> {
        let shown = path.display().to_string();
        if !path.is_dir() {
            if !config.create_if_missing || config.read_only {
                return Err(EngineError::Missing { path: shown });
            }
            fs::create_dir_all(path)?;
        }
        let dir = fs::canonicalize(path)?;
        let has_table = table_exists(&dir);
        if has_table && config.error_if_exists {
            return Err(EngineError::AlreadyExists { path: shown });
        }
        if !self.locked.lock().insert(dir.clone()) {
            return Err(EngineError::LockHeld { path: shown });
        }
        let lock = DirLock {
            dir: dir.clone(),
            locked: Arc::clone(&self.locked),
        };
        let table = if has_table {
            read_table(&dir)?
        } else {
            OrdMap::new()
        };
        debug!(path = %shown, entries = table.len(), "memory store opened");
        self.stats.stores_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryStore {
            dir,
            table: RwLock::new(table),
            snapshots: Mutex::new(HashMap::new()),
            next_snapshot: AtomicU64::new(1),
            read_only: config.read_only,
            persist_on_close: config.persist_on_close && !config.read_only,
            stats: Arc::clone(&self.stats),
            _lock: lock,
        }))
    }
}

/// Holds a directory in the backend's lock set until dropped.
#[derive(Debug)]
struct DirLock {
    dir: PathBuf,
    locked: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Drop for DirLock {
    fn drop(&mut self) {
        self.locked.lock().remove(&self.dir);
    }
}

#[derive(Debug)]
struct MemoryStore {
    dir: PathBuf,
    table: RwLock<Table>,
    snapshots: Mutex<HashMap<u64, Table>>,
    next_snapshot: AtomicU64,
    read_only: bool,
    persist_on_close: bool,
    stats: Arc<EngineStats>,
    _lock: DirLock,
}

impl MemoryStore {
    fn view(&self, snapshot: Option<SnapshotToken>) -> Result<Table, EngineError> {
        match snapshot {
            Some(token) => self
                .snapshots
                .lock()
                .get(&token.0)
                .cloned()
                .ok_or(EngineError::UnknownSnapshot(token.0)),
            None => Ok(self.table.read().clone()),
        }
    }
}

impl NativeStore for MemoryStore {
    fn get(
        &self,
        key: &[u8],
        snapshot: Option<SnapshotToken>,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        match snapshot {
            Some(_) => Ok(self.view(snapshot)?.get(key).cloned()),
            None => Ok(self.table.read().get(key).cloned()),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        if self.read_only {
            return Err(EngineError::ReadOnly);
        }
        self.table.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), EngineError> {
        if self.read_only {
            return Err(EngineError::ReadOnly);
        }
        self.table.write().remove(key);
        Ok(())
    }

    fn create_snapshot(&self) -> SnapshotToken {
        let id = self.next_snapshot.fetch_add(1, Ordering::Relaxed);
        let view = self.table.read().clone();
        self.snapshots.lock().insert(id, view);
        self.stats.snapshots_created.fetch_add(1, Ordering::SeqCst);
        SnapshotToken(id)
    }

    fn release_snapshot(&self, snapshot: SnapshotToken) {
        if self.snapshots.lock().remove(&snapshot.0).is_some() {
            self.stats.snapshots_released.fetch_add(1, Ordering::SeqCst);
        } else {
            self.stats
                .unknown_snapshot_releases
                .fetch_add(1, Ordering::SeqCst);
            warn!(snapshot = snapshot.0, "release of unknown snapshot");
        }
    }

    fn new_cursor(
        &self,
        snapshot: Option<SnapshotToken>,
    ) -> Result<Box<dyn NativeCursor>, EngineError> {
        let view = self.view(snapshot)?;
        self.stats.cursors_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryCursor {
            view,
            current: None,
            stats: Arc::clone(&self.stats),
        }))
    }

    fn close(self: Box<Self>) -> Result<(), EngineError> {
        let outstanding = self.snapshots.lock().len();
        if outstanding > 0 {
            warn!(
                path = %self.dir.display(),
                outstanding,
                "closing store with unreleased snapshots"
            );
        }
        let result = if self.persist_on_close {
            write_table(&self.dir, &self.table.read())
        } else {
            Ok(())
        };
        self.stats.stores_closed.fetch_add(1, Ordering::SeqCst);
        result
    }
}

struct MemoryCursor {
    view: Table,
    current: Option<(Vec<u8>, Vec<u8>)>,
    stats: Arc<EngineStats>,
}

impl MemoryCursor {
    fn first_in(&self, start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Option<(Vec<u8>, Vec<u8>)> {
        self.view
            .range((start, end))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    fn last_in(&self, start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Option<(Vec<u8>, Vec<u8>)> {
        self.view
            .range((start, end))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()))
    }
}

impl NativeCursor for MemoryCursor {
    fn seek_to_first(&mut self) {
        self.current = self.view.get_min().cloned();
    }

    fn seek_to_last(&mut self) {
        self.current = self.view.get_max().cloned();
    }

    fn seek(&mut self, target: &[u8]) {
        self.current = self.first_in(Bound::Included(target.to_vec()), Bound::Unbounded);
    }

    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], |(k, _)| k.as_slice())
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], |(_, v)| v.as_slice())
    }

    fn next(&mut self) {
        self.current = match self.current.take() {
            Some((key, _)) => self.first_in(Bound::Excluded(key), Bound::Unbounded),
            None => None,
        };
    }

    fn prev(&mut self) {
        self.current = match self.current.take() {
            Some((key, _)) => self.last_in(Bound::Unbounded, Bound::Excluded(key)),
            None => None,
        };
    }
}

impl Drop for MemoryCursor {
    fn drop(&mut self) {
        self.stats.cursors_dropped.fetch_add(1, Ordering::SeqCst);
    }
}
