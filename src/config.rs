use crate::error::KvHandleError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options applied when a store is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub create_if_missing: bool,
    pub error_if_exists: bool,
    pub read_only: bool,
    /// Write the store contents back to its directory when the native store closes.
    pub persist_on_close: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
            read_only: false,
            persist_on_close: true,
        }
    }
}

impl StoreConfig {
    pub fn create_if_missing() -> Self {
        Self {
            create_if_missing: true,
            ..Self::default()
        }
    }

    pub fn read_only() -> Self {
        Self {
            read_only: true,
            persist_on_close: false,
            ..Self::default()
        }
    }
}

/// Runtime configuration for a `HandleRuntime`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub prefetch_worker_threads: usize,
    /// How long a host call waits for a cursor owned by another party before
    /// falling back to a fresh cursor.
    pub handoff_wait_us: u64,
    /// Closing a store also requests close of every iterator still attached to it.
    pub close_iterators_with_store: bool,
    /// Upper bound on simultaneously registered iterators. Zero means unbounded.
    pub max_open_iterators: usize,
    /// Keep one prefetch job per iterator and recycle it between prefetches.
    pub reuse_prefetch_slot: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            prefetch_worker_threads: std::thread::available_parallelism()
                .map(|n| n.get().clamp(1, 4))
                .unwrap_or(2),
            handoff_wait_us: 5_000,
            close_iterators_with_store: false,
            max_open_iterators: 0,
            reuse_prefetch_slot: true,
        }
    }
}

impl RuntimeConfig {
    pub fn development() -> Self {
        Self {
            prefetch_worker_threads: 1,
            handoff_wait_us: 50_000,
            ..Self::default()
        }
    }

    /// Profile for host call threads that must not stall behind a slow look-ahead.
    pub fn low_latency() -> Self {
        Self {
            handoff_wait_us: 250,
            close_iterators_with_store: true,
            ..Self::default()
        }
    }

    pub fn handoff_wait(&self) -> Duration {
        Duration::from_micros(self.handoff_wait_us)
    }

    pub fn validate(&self) -> Result<(), KvHandleError> {
        if self.prefetch_worker_threads == 0 {
            return Err(KvHandleError::InvalidConfig {
                message: "prefetch_worker_threads must be at least 1".into(),
            });
        }
        if self.handoff_wait_us > 10_000_000 {
            return Err(KvHandleError::InvalidConfig {
                message: format!(
                    "handoff_wait_us {} exceeds the 10s ceiling",
                    self.handoff_wait_us
                ),
            });
        }
        Ok(())
    }
}
