use crate::engine::SnapshotToken;
use crate::error::KvHandleError;
use crate::handle::{ManagedHandle, OwningHandle};
use crate::notify::{HostEvent, HostNotifier, HostTerm};
use crate::registry::SnapshotRef;
use crate::store::StoreHandle;
use tracing::{trace, warn};

/// Where to report a snapshot's release, and what to hand back to the host.
#[derive(Debug, Clone)]
pub struct ReleaseNotification {
    pub snapshot: SnapshotRef,
    pub notifier: HostNotifier,
    pub reference: Option<HostTerm>,
}

/// A point-in-time view of a store.
///
/// Holds its own store reference, so the native store cannot close before the
/// view is given back. Shared between a host registration and any cursors
/// reading through it.
pub struct SnapshotHandle {
    store: Option<OwningHandle<StoreHandle>>,
    token: Option<SnapshotToken>,
    notification: Option<ReleaseNotification>,
}

impl SnapshotHandle {
    pub fn create(
        store: &OwningHandle<StoreHandle>,
        notification: Option<ReleaseNotification>,
    ) -> Result<OwningHandle<SnapshotHandle>, KvHandleError> {
        let token = store.native()?.create_snapshot();
        trace!(store = %store.id(), token = token.0, "snapshot created");
        Ok(OwningHandle::new(SnapshotHandle {
            store: Some(store.clone()),
            token: Some(token),
            notification,
        }))
    }

    /// Engine token for reads through this view.
    pub fn token(&self) -> Option<SnapshotToken> {
        self.token
    }

    pub fn store(&self) -> Option<&OwningHandle<StoreHandle>> {
        self.store.as_ref()
    }

    /// True when `store` is the store this view was taken from.
    pub fn belongs_to(&self, store: &OwningHandle<StoreHandle>) -> bool {
        self.store.as_ref().is_some_and(|own| own.ptr_eq(store))
    }
}

impl ManagedHandle for SnapshotHandle {
    const KIND: &'static str = "snapshot";

    fn shutdown(&mut self) {
        let store = self.store.take();
        if let (Some(token), Some(store)) = (self.token.take(), store.as_ref()) {
            match store.native() {
                Ok(native) => native.release_snapshot(token),
                Err(e) => warn!(token = token.0, error = %e, "snapshot outlived its native store"),
            }
            trace!(store = %store.id(), token = token.0, "snapshot released");
        }
        if let Some(notification) = self.notification.take() {
            notification.notifier.post(HostEvent::SnapshotReleased {
                snapshot: notification.snapshot,
                reference: notification.reference,
            });
        }
        drop(store);
    }
}

#[cfg(test)]
mod tests {
    use super::{ReleaseNotification, SnapshotHandle};
    use crate::config::StoreConfig;
    use crate::engine::memory::MemoryBackend;
    use crate::handle::{OwningHandle, ReleaseOutcome};
    use crate::notify::{HostEvent, HostNotifier, HostTerm};
    use crate::registry::{ResourceId, SnapshotRef, StoreRef};
    use crate::store::StoreHandle;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::{TempDir, tempdir};

    fn open_store(backend: &MemoryBackend) -> (TempDir, OwningHandle<StoreHandle>) {
        let dir = tempdir().expect("temp");
        let store = StoreHandle::open(
            StoreRef::from_raw(1),
            dir.path(),
            StoreConfig::create_if_missing(),
            backend,
            HostNotifier::disabled(),
        )
        .expect("open");
        (dir, store)
    }

    #[test]
    fn shared_snapshot_releases_native_view_once() {
        let backend = MemoryBackend::new();
        let (_dir, store) = open_store(&backend);
        let (notifier, mut rx) = HostNotifier::channel();
        let snapshot = SnapshotHandle::create(
            &store,
            Some(ReleaseNotification {
                snapshot: SnapshotRef::from_raw(5),
                notifier,
                reference: Some(HostTerm(42)),
            }),
        )
        .expect("snapshot");
        assert!(snapshot.belongs_to(&store));
        assert_eq!(store.ref_count(), 2);

        let holders = 8;
        let barrier = Arc::new(Barrier::new(holders));
        let joins: Vec<_> = (0..holders)
            .map(|_| {
                let mine = snapshot.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    mine.release()
                })
            })
            .collect();
        let main = snapshot.release();
        let destroyed = joins
            .into_iter()
            .map(|j| j.join().expect("holder"))
            .chain(std::iter::once(main))
            .filter(|outcome| *outcome == ReleaseOutcome::Destroyed)
            .count();
        assert_eq!(destroyed, 1);

        let stats = backend.stats();
        assert_eq!(stats.snapshots_created, 1);
        assert_eq!(stats.snapshots_released, 1);
        assert_eq!(stats.unknown_snapshot_releases, 0);
        assert_eq!(store.ref_count(), 1);
        assert_eq!(
            rx.try_recv().expect("release event"),
            HostEvent::SnapshotReleased {
                snapshot: SnapshotRef::from_raw(5),
                reference: Some(HostTerm(42)),
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn snapshot_keeps_store_open() {
        let backend = MemoryBackend::new();
        let (_dir, store) = open_store(&backend);
        let snapshot = SnapshotHandle::create(&store, None).expect("snapshot");
        let waiter = store.close_waiter();
        store.request_close();
        drop(store);
        assert!(!waiter.is_destroyed());
        assert_eq!(backend.stats().stores_closed, 0);
        drop(snapshot);
        assert!(waiter.is_destroyed());
        let stats = backend.stats();
        assert_eq!(stats.snapshots_released, 1);
        assert_eq!(stats.stores_closed, 1);
    }
}
