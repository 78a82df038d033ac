//! Host-side registration of live handles.
//!
//! The host never sees an `OwningHandle`; it holds an opaque id that maps to
//! the registry's reference. Removing the entry drops that reference.

use crate::error::{KvHandleError, ResourceType};
use crate::handle::{ManagedHandle, OwningHandle};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identifier handed to the host.
pub trait ResourceId: Copy + Eq + Hash + Ord + fmt::Debug + Send + Sync + 'static {
    const RESOURCE_TYPE: ResourceType;

    fn from_raw(raw: u64) -> Self;
    fn raw(self) -> u64;
}

macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl ResourceId for $name {
            const RESOURCE_TYPE: ResourceType = $kind;

            fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $kind, self.0)
            }
        }
    };
}

resource_id!(
    /// Host reference to an open store.
    StoreRef,
    ResourceType::Store
);
resource_id!(
    /// Host reference to an iterator front.
    IteratorRef,
    ResourceType::Iterator
);
resource_id!(
    /// Host reference to a registered snapshot.
    SnapshotRef,
    ResourceType::Snapshot
);

/// Id-to-handle map for one resource kind. Ids are never reused.
pub struct ResourceRegistry<I: ResourceId, T: ManagedHandle> {
    next_id: AtomicU64,
    entries: RwLock<HashMap<I, OwningHandle<T>>>,
    _id: PhantomData<fn() -> I>,
}

impl<I: ResourceId, T: ManagedHandle> Default for ResourceRegistry<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: ResourceId, T: ManagedHandle> ResourceRegistry<I, T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
            _id: PhantomData,
        }
    }

    /// Allocates an id for a handle that is about to be built.
    pub fn allocate(&self) -> I {
        I::from_raw(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn insert(&self, id: I, handle: OwningHandle<T>) {
        self.entries.write().insert(id, handle);
    }

    /// Inserts unless `limit` entries are already registered (`0` is
    /// unbounded). Count and insert happen under one write lock; a rejected
    /// handle is handed back.
    pub fn insert_within(
        &self,
        id: I,
        handle: OwningHandle<T>,
        limit: usize,
    ) -> Result<(), OwningHandle<T>> {
        let mut entries = self.entries.write();
        if limit > 0 && entries.len() >= limit {
            return Err(handle);
        }
        entries.insert(id, handle);
        Ok(())
    }

    /// Returns a new reference to the registered handle.
    pub fn lookup(&self, id: I) -> Result<OwningHandle<T>, KvHandleError> {
        self.entries
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| KvHandleError::not_found(I::RESOURCE_TYPE, id.raw()))
    }

    /// Unregisters `id`, handing the registry's reference to the caller.
    pub fn remove(&self, id: I) -> Result<OwningHandle<T>, KvHandleError> {
        self.entries
            .write()
            .remove(&id)
            .ok_or_else(|| KvHandleError::not_found(I::RESOURCE_TYPE, id.raw()))
    }

    /// Removes every entry matching `pred`.
    pub fn remove_where(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<(I, OwningHandle<T>)> {
        let mut entries = self.entries.write();
        let ids: Vec<I> = entries
            .iter()
            .filter_map(|(id, handle)| {
                let value: &T = handle;
                pred(value).then_some(*id)
            })
            .collect();
        ids.into_iter()
            .filter_map(|id| entries.remove(&id).map(|handle| (id, handle)))
            .collect()
    }

    /// Removes every entry, ordered by id.
    pub fn drain(&self) -> Vec<(I, OwningHandle<T>)> {
        let mut drained: Vec<_> = self.entries.write().drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }

    pub fn contains(&self, id: I) -> bool {
        self.entries.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
