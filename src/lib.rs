pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod handle;
pub mod invariant;
pub mod iterator;
pub mod notify;
pub mod prefetch;
pub mod registry;
pub mod snapshot;
pub mod store;

pub use crate::config::{RuntimeConfig, StoreConfig};
pub use crate::error::{KvHandleError, KvHandleErrorCode, ResourceType};
pub use crate::iterator::{IterStep, IteratorAction, ReadOptions, SnapshotChoice};
pub use crate::notify::{HostEvent, HostEventReceiver, HostTerm};
pub use crate::registry::{IteratorRef, SnapshotRef, StoreRef};

use crate::engine::StoreBackend;
use crate::engine::memory::MemoryBackend;
use crate::iterator::IteratorFront;
use crate::notify::HostNotifier;
use crate::prefetch::PrefetchPool;
use crate::registry::{ResourceId, ResourceRegistry};
use crate::snapshot::{ReleaseNotification, SnapshotHandle};
use crate::store::StoreHandle;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Point-in-time counters for a `HandleRuntime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeStats {
    pub open_stores: usize,
    pub registered_snapshots: usize,
    pub open_iterators: usize,
    pub prefetch_workers: usize,
    pub queued_prefetch_jobs: usize,
    pub completed_prefetch_jobs: u64,
    pub panicked_prefetch_jobs: u64,
    pub invariant_violations: u64,
}

/// Host-facing entry point: maps opaque ids to handles and drives them.
///
/// Every id the host holds corresponds to one registry reference. Closing an
/// id drops that reference; the resource itself is torn down once nothing
/// else (iterators, snapshots, in-flight prefetches) refers to it.
pub struct HandleRuntime {
    config: RuntimeConfig,
    backend: Arc<dyn StoreBackend>,
    stores: ResourceRegistry<StoreRef, StoreHandle>,
    snapshots: ResourceRegistry<SnapshotRef, SnapshotHandle>,
    iterators: ResourceRegistry<IteratorRef, IteratorFront>,
    pool: PrefetchPool,
    notifier: HostNotifier,
}

impl HandleRuntime {
    pub fn new(config: RuntimeConfig, backend: Arc<dyn StoreBackend>) -> Result<Self, KvHandleError> {
        Self::build(config, backend, HostNotifier::disabled())
    }

    /// Runtime over the in-process reference engine.
    pub fn in_memory(config: RuntimeConfig) -> Result<Self, KvHandleError> {
        Self::new(config, Arc::new(MemoryBackend::new()))
    }

    /// Like `new`, also returning the receiver for lifecycle events.
    pub fn with_events(
        config: RuntimeConfig,
        backend: Arc<dyn StoreBackend>,
    ) -> Result<(Self, HostEventReceiver), KvHandleError> {
        let (notifier, rx) = HostNotifier::channel();
        Ok((Self::build(config, backend, notifier)?, rx))
    }

    fn build(
        config: RuntimeConfig,
        backend: Arc<dyn StoreBackend>,
        notifier: HostNotifier,
    ) -> Result<Self, KvHandleError> {
        config.validate()?;
        let pool = PrefetchPool::new(config.prefetch_worker_threads)?;
        info!(
            prefetch_worker_threads = config.prefetch_worker_threads,
            handoff_wait_us = config.handoff_wait_us,
            close_iterators_with_store = config.close_iterators_with_store,
            max_open_iterators = config.max_open_iterators,
            events = notifier.is_enabled(),
            "handle runtime started"
        );
        Ok(Self {
            config,
            backend,
            stores: ResourceRegistry::new(),
            snapshots: ResourceRegistry::new(),
            iterators: ResourceRegistry::new(),
            pool,
            notifier,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn open_store(
        &self,
        path: impl AsRef<Path>,
        config: StoreConfig,
    ) -> Result<StoreRef, KvHandleError> {
        let id = self.stores.allocate();
        let store = StoreHandle::open(
            id,
            path.as_ref(),
            config,
            self.backend.as_ref(),
            self.notifier.clone(),
        )?;
        self.stores.insert(id, store);
        Ok(id)
    }

    /// Requests close and drops the host's reference. The native store
    /// closes once its iterators and snapshots are gone.
    pub fn close_store(&self, id: StoreRef) -> Result<(), KvHandleError> {
        let store = self.stores.remove(id)?;
        store.request_close();
        if self.config.close_iterators_with_store {
            for (iterator_id, iterator) in self.iterators.remove_where(|it| it.belongs_to(&store)) {
                debug!(store = %id, iterator = %iterator_id, "closing iterator with its store");
                iterator.request_close();
            }
        }
        debug!(store = %id, refs = store.ref_count(), "store close requested");
        Ok(())
    }

    /// Forced close: tears down every iterator and registered snapshot on
    /// the store, then waits until the native store has closed.
    pub fn destroy_store(&self, id: StoreRef) -> Result<(), KvHandleError> {
        let store = self.stores.remove(id)?;
        store.request_close();
        for (_, iterator) in self.iterators.remove_where(|it| it.belongs_to(&store)) {
            iterator.await_close_and_destroy();
        }
        for (_, snapshot) in self.snapshots.remove_where(|s| s.belongs_to(&store)) {
            drop(snapshot);
        }
        store.await_close_and_destroy();
        Ok(())
    }

    pub fn put(&self, store: StoreRef, key: &[u8], value: &[u8]) -> Result<(), KvHandleError> {
        let store = self.stores.lookup(store)?;
        store.native()?.put(key, value)?;
        Ok(())
    }

    pub fn get(&self, store: StoreRef, key: &[u8]) -> Result<Option<Vec<u8>>, KvHandleError> {
        let store = self.stores.lookup(store)?;
        Ok(store.native()?.get(key, None)?)
    }

    /// Reads `key` as of a registered snapshot.
    pub fn get_at(&self, id: SnapshotRef, key: &[u8]) -> Result<Option<Vec<u8>>, KvHandleError> {
        let snapshot = self.snapshots.lookup(id)?;
        let store = snapshot.store().ok_or_else(|| KvHandleError::Closing {
            resource_type: ResourceType::Snapshot,
            resource_id: id.raw(),
        })?;
        Ok(store.native()?.get(key, snapshot.token())?)
    }

    pub fn delete(&self, store: StoreRef, key: &[u8]) -> Result<(), KvHandleError> {
        let store = self.stores.lookup(store)?;
        store.native()?.delete(key)?;
        Ok(())
    }

    /// Registers a snapshot. `reference` comes back in the
    /// `SnapshotReleased` event once the native view is returned.
    pub fn create_snapshot(
        &self,
        store: StoreRef,
        reference: Option<HostTerm>,
    ) -> Result<SnapshotRef, KvHandleError> {
        let store = self.stores.lookup(store)?;
        let id = self.snapshots.allocate();
        let snapshot = SnapshotHandle::create(
            &store,
            Some(ReleaseNotification {
                snapshot: id,
                notifier: self.notifier.clone(),
                reference,
            }),
        )?;
        self.snapshots.insert(id, snapshot);
        Ok(id)
    }

    /// Drops the host's reference. Iterators reading through the snapshot
    /// keep it alive until they close.
    pub fn release_snapshot(&self, id: SnapshotRef) -> Result<(), KvHandleError> {
        let snapshot = self.snapshots.remove(id)?;
        debug!(snapshot = %id, refs = snapshot.ref_count(), "snapshot released by host");
        Ok(())
    }

    pub fn open_iterator(
        &self,
        store: StoreRef,
        keys_only: bool,
        options: ReadOptions,
    ) -> Result<IteratorRef, KvHandleError> {
        let limit = self.config.max_open_iterators;
        if limit > 0 && self.iterators.len() >= limit {
            return Err(KvHandleError::TooManyIterators { limit });
        }
        let store = self.stores.lookup(store)?;
        let snapshot = match &options.snapshot {
            SnapshotChoice::Latest => None,
            SnapshotChoice::Fresh => Some(SnapshotHandle::create(&store, None)?),
            SnapshotChoice::Existing(snapshot_id) => {
                let snapshot = self.snapshots.lookup(*snapshot_id)?;
                if !snapshot.belongs_to(&store) {
                    return Err(KvHandleError::not_found(
                        ResourceType::Snapshot,
                        snapshot_id.raw(),
                    ));
                }
                Some(snapshot)
            }
        };
        let id = self.iterators.allocate();
        let iterator = IteratorFront::open(
            id,
            &store,
            keys_only,
            &options,
            snapshot,
            &self.config,
            self.notifier.clone(),
        )?;
        if let Err(rejected) = self.iterators.insert_within(id, iterator, limit) {
            rejected.await_close_and_destroy();
            return Err(KvHandleError::TooManyIterators { limit });
        }
        Ok(id)
    }

    pub fn iterator_move(
        &self,
        id: IteratorRef,
        action: IteratorAction,
    ) -> Result<IterStep, KvHandleError> {
        let iterator = self.iterators.lookup(id)?;
        IteratorFront::step(&iterator, action, &self.pool)
    }

    pub fn iterator_next(&self, id: IteratorRef) -> Result<IterStep, KvHandleError> {
        self.iterator_move(id, IteratorAction::Next)
    }

    pub fn iterator_prev(&self, id: IteratorRef) -> Result<IterStep, KvHandleError> {
        self.iterator_move(id, IteratorAction::Prev)
    }

    pub fn iterator_first(&self, id: IteratorRef) -> Result<IterStep, KvHandleError> {
        self.iterator_move(id, IteratorAction::First)
    }

    pub fn iterator_last(&self, id: IteratorRef) -> Result<IterStep, KvHandleError> {
        self.iterator_move(id, IteratorAction::Last)
    }

    pub fn iterator_seek(&self, id: IteratorRef, key: &[u8]) -> Result<IterStep, KvHandleError> {
        self.iterator_move(id, IteratorAction::Seek(key.to_vec()))
    }

    pub fn iterator_prefetch(&self, id: IteratorRef) -> Result<IterStep, KvHandleError> {
        self.iterator_move(id, IteratorAction::Prefetch)
    }

    pub fn iterator_prefetch_stop(&self, id: IteratorRef) -> Result<IterStep, KvHandleError> {
        self.iterator_move(id, IteratorAction::PrefetchStop)
    }

    /// Requests close without waiting. An in-flight prefetch finishes first.
    pub fn close_iterator(&self, id: IteratorRef) -> Result<(), KvHandleError> {
        let iterator = self.iterators.remove(id)?;
        iterator.request_close();
        Ok(())
    }

    /// Closes and waits until the iterator has released everything it held.
    pub fn destroy_iterator(&self, id: IteratorRef) -> Result<(), KvHandleError> {
        self.iterators.remove(id)?.await_close_and_destroy();
        Ok(())
    }

    pub fn release_iterator_work_slot(&self, id: IteratorRef) -> Result<bool, KvHandleError> {
        Ok(self.iterators.lookup(id)?.release_reusable_work_slot())
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            open_stores: self.stores.len(),
            registered_snapshots: self.snapshots.len(),
            open_iterators: self.iterators.len(),
            prefetch_workers: self.pool.worker_count(),
            queued_prefetch_jobs: self.pool.queued_jobs(),
            completed_prefetch_jobs: self.pool.completed_jobs(),
            panicked_prefetch_jobs: self.pool.panicked_jobs(),
            invariant_violations: invariant::reported_count(),
        }
    }

    /// Closes everything in dependency order and stops the worker pool.
    pub fn shutdown(mut self) {
        self.close_all();
    }

    fn close_all(&mut self) {
        let iterators = self.iterators.drain();
        let snapshots = self.snapshots.drain();
        let stores = self.stores.drain();
        if iterators.is_empty() && snapshots.is_empty() && stores.is_empty() {
            self.pool.shutdown();
            return;
        }
        info!(
            iterators = iterators.len(),
            snapshots = snapshots.len(),
            stores = stores.len(),
            "force-closing host resources"
        );
        for (_, iterator) in iterators {
            iterator.await_close_and_destroy();
        }
        drop(snapshots);
        for (_, store) in stores {
            store.await_close_and_destroy();
        }
        self.pool.shutdown();
    }
}

impl Drop for HandleRuntime {
    fn drop(&mut self) {
        self.close_all();
    }
}
