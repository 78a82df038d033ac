//! Narrow interface to the external key/value engine.
//!
//! The lifecycle layer only opens and closes stores, creates and releases
//! point-in-time views, and drives cursors. Everything behind these traits
//! (storage format, compaction, caching) belongs to the engine.

pub mod memory;
pub mod table_file;

use std::path::Path;
use thiserror::Error;

use crate::config::StoreConfig;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("corruption in '{path}': {detail}")]
    Corruption { path: String, detail: String },
    #[error("store '{path}' does not exist (create_if_missing is false)")]
    Missing { path: String },
    #[error("store '{path}' exists (error_if_exists is true)")]
    AlreadyExists { path: String },
    #[error("lock on '{path}' is held by another open store")]
    LockHeld { path: String },
    #[error("store is read-only")]
    ReadOnly,
    #[error("unknown snapshot {0}")]
    UnknownSnapshot(u64),
}

/// Engine-issued identifier of a point-in-time view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotToken(pub u64);

/// Opens native stores.
pub trait StoreBackend: Send + Sync {
    fn open(&self, path: &Path, config: &StoreConfig) -> Result<Box<dyn NativeStore>, EngineError>;
}

/// An open native store.
pub trait NativeStore: Send + Sync {
    fn get(&self, key: &[u8], snapshot: Option<SnapshotToken>)
    -> Result<Option<Vec<u8>>, EngineError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError>;

    fn delete(&self, key: &[u8]) -> Result<(), EngineError>;

    fn create_snapshot(&self) -> SnapshotToken;

    /// Returns a view to the engine. Each token is released at most once.
    fn release_snapshot(&self, snapshot: SnapshotToken);

    fn new_cursor(
        &self,
        snapshot: Option<SnapshotToken>,
    ) -> Result<Box<dyn NativeCursor>, EngineError>;

    /// Flushes and closes the store. Called exactly once, after every view
    /// and cursor created from it has been released.
    fn close(self: Box<Self>) -> Result<(), EngineError>;
}

/// A positioned iteration cursor. `key` and `value` return empty slices
/// unless `valid` holds.
pub trait NativeCursor: Send {
    fn seek_to_first(&mut self);
    fn seek_to_last(&mut self);
    /// Positions at the first key at or after `target`.
    fn seek(&mut self, target: &[u8]);
    fn valid(&self) -> bool;
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
    fn next(&mut self);
    fn prev(&mut self);
}
