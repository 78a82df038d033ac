use crate::config::StoreConfig;
use crate::engine::{NativeStore, StoreBackend};
use crate::error::{KvHandleError, ResourceType};
use crate::handle::{ManagedHandle, OwningHandle};
use crate::invariant::{self, InvariantViolation, ViolationKind};
use crate::notify::{HostEvent, HostNotifier};
use crate::registry::{IteratorRef, ResourceId, StoreRef};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Dependents {
    closing: bool,
    iterators: BTreeSet<IteratorRef>,
}

/// Wraps one open native store.
///
/// Iterator fronts register themselves as dependents. The native store is
/// closed by `shutdown` only when no dependent remains.
pub struct StoreHandle {
    id: StoreRef,
    path: PathBuf,
    config: StoreConfig,
    native: Option<Box<dyn NativeStore>>,
    dependents: Mutex<Dependents>,
    notifier: HostNotifier,
}

impl StoreHandle {
    pub fn open(
        id: StoreRef,
        path: &Path,
        config: StoreConfig,
        backend: &dyn StoreBackend,
        notifier: HostNotifier,
    ) -> Result<OwningHandle<StoreHandle>, KvHandleError> {
        let native = backend
            .open(path, &config)
            .map_err(|source| KvHandleError::StoreOpen {
                path: path.display().to_string(),
                source,
            })?;
        info!(
            store = %id,
            path = %path.display(),
            create_if_missing = config.create_if_missing,
            read_only = config.read_only,
            "store opened"
        );
        Ok(OwningHandle::new(StoreHandle {
            id,
            path: path.to_path_buf(),
            config,
            native: Some(native),
            dependents: Mutex::new(Dependents::default()),
            notifier,
        }))
    }

    pub fn id(&self) -> StoreRef {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The open native store. Only `shutdown` takes it away.
    pub fn native(&self) -> Result<&dyn NativeStore, KvHandleError> {
        self.native.as_deref().ok_or_else(|| KvHandleError::Closing {
            resource_type: ResourceType::Store,
            resource_id: self.id.raw(),
        })
    }

    pub fn is_closing(&self) -> bool {
        self.dependents.lock().closing
    }

    /// Registers an iterator front. Refused once close has been requested.
    pub fn add_dependent(&self, iterator: IteratorRef) -> Result<(), KvHandleError> {
        let mut deps = self.dependents.lock();
        if deps.closing {
            return Err(KvHandleError::Closing {
                resource_type: ResourceType::Store,
                resource_id: self.id.raw(),
            });
        }
        deps.iterators.insert(iterator);
        Ok(())
    }

    pub fn remove_dependent(&self, iterator: IteratorRef) -> bool {
        self.dependents.lock().iterators.remove(&iterator)
    }

    pub fn dependents(&self) -> Vec<IteratorRef> {
        self.dependents.lock().iterators.iter().copied().collect()
    }

    pub fn dependent_count(&self) -> usize {
        self.dependents.lock().iterators.len()
    }
}

impl ManagedHandle for StoreHandle {
    const KIND: &'static str = "store";

    fn on_close_requested(&self) {
        let mut deps = self.dependents.lock();
        deps.closing = true;
        debug!(
            store = %self.id,
            dependents = deps.iterators.len(),
            "store close requested"
        );
    }

    fn shutdown(&mut self) {
        let Some(native) = self.native.take() else {
            return;
        };
        let remaining = self.dependents.get_mut().iterators.len();
        if remaining > 0 {
            invariant::report(&InvariantViolation::new(
                ViolationKind::DependentsAtShutdown,
                format!("{} reached shutdown with {remaining} iterators", self.id),
            ));
            // Cursors may still read through the engine; never close under them.
            std::mem::forget(native);
            return;
        }
        if let Err(e) = native.close() {
            warn!(store = %self.id, error = %e, "native store close failed");
        }
        info!(store = %self.id, path = %self.path.display(), "store closed");
        self.notifier.post(HostEvent::StoreClosed { store: self.id });
    }
}

#[cfg(test)]
mod tests {
    use super::StoreHandle;
    use crate::config::StoreConfig;
    use crate::engine::memory::MemoryBackend;
    use crate::error::KvHandleErrorCode;
    use crate::handle::CloseState;
    use crate::notify::{HostEvent, HostNotifier};
    use crate::registry::{IteratorRef, ResourceId, StoreRef};
    use tempfile::tempdir;

    #[test]
    fn open_failure_carries_engine_cause() {
        let dir = tempdir().expect("temp");
        let backend = MemoryBackend::new();
        let err = StoreHandle::open(
            StoreRef::from_raw(1),
            &dir.path().join("absent"),
            StoreConfig::default(),
            &backend,
            HostNotifier::disabled(),
        )
        .expect_err("missing store");
        assert_eq!(err.code(), KvHandleErrorCode::StoreOpenFailed);
        assert_eq!(backend.stats().stores_opened, 0);
    }

    #[test]
    fn close_request_blocks_new_dependents() {
        let dir = tempdir().expect("temp");
        let backend = MemoryBackend::new();
        let store = StoreHandle::open(
            StoreRef::from_raw(1),
            dir.path(),
            StoreConfig::create_if_missing(),
            &backend,
            HostNotifier::disabled(),
        )
        .expect("open");
        store.add_dependent(IteratorRef::from_raw(10)).expect("add");
        assert!(store.request_close());
        assert!(store.is_closing());
        let err = store
            .add_dependent(IteratorRef::from_raw(11))
            .expect_err("closing");
        assert_eq!(err.code(), KvHandleErrorCode::StoreClosing);
        assert!(store.remove_dependent(IteratorRef::from_raw(10)));
        assert!(!store.remove_dependent(IteratorRef::from_raw(10)));
        assert_eq!(store.dependent_count(), 0);
        store.await_close_and_destroy();
        assert_eq!(backend.stats().stores_closed, 1);
    }

    #[test]
    fn shutdown_posts_store_closed() {
        let dir = tempdir().expect("temp");
        let backend = MemoryBackend::new();
        let (notifier, mut rx) = HostNotifier::channel();
        let store = StoreHandle::open(
            StoreRef::from_raw(3),
            dir.path(),
            StoreConfig::create_if_missing(),
            &backend,
            notifier,
        )
        .expect("open");
        let waiter = store.close_waiter();
        drop(store);
        assert_eq!(waiter.state(), CloseState::DestructorDone);
        assert_eq!(
            rx.try_recv().expect("event"),
            HostEvent::StoreClosed {
                store: StoreRef::from_raw(3)
            }
        );
    }

    #[test]
    #[cfg(not(feature = "hardened"))]
    fn shutdown_with_dependents_leaves_native_store_open() {
        let dir = tempdir().expect("temp");
        let backend = MemoryBackend::new();
        let store = StoreHandle::open(
            StoreRef::from_raw(4),
            dir.path(),
            StoreConfig::create_if_missing(),
            &backend,
            HostNotifier::disabled(),
        )
        .expect("open");
        store.add_dependent(IteratorRef::from_raw(1)).expect("add");
        let before = crate::invariant::reported_count();
        drop(store);
        assert!(crate::invariant::reported_count() > before);
        let stats = backend.stats();
        assert_eq!(stats.stores_closed, 0);
        assert_eq!(stats.live_stores(), 1);
    }
}
