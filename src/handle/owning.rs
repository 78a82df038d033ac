use super::close::{CloseControl, CloseState, CloseWaiter};
use crate::invariant;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tracing::trace;

/// A handle whose lifetime is driven by `OwningHandle` references.
pub trait ManagedHandle: Send + Sync + 'static {
    /// Short name used in lifecycle logs.
    const KIND: &'static str;

    /// Stops accepting new work and releases dependents.
    ///
    /// Runs exactly once, on the thread whose release dropped the count to
    /// zero, before the value's fields are dropped.
    fn shutdown(&mut self);

    /// Runs only in the `request_close` call that moved the handle out of `Open`.
    fn on_close_requested(&self) {}
}

/// Signals `DestructorDone` when dropped. Declared after the value in
/// `Managed` so it fires only once the value's fields are gone.
struct DestructionSignal {
    control: Arc<CloseControl>,
}

impl Drop for DestructionSignal {
    fn drop(&mut self) {
        self.control.finish_destruction();
    }
}

struct Managed<T: ManagedHandle> {
    value: T,
    done: DestructionSignal,
}

impl<T: ManagedHandle> Drop for Managed<T> {
    fn drop(&mut self) {
        if let Err(violation) = self.done.control.begin_destruction() {
            invariant::report(&violation);
            return;
        }
        trace!(kind = T::KIND, "handle reached zero references; shutting down");
        self.value.shutdown();
    }
}

/// Result of an explicit `OwningHandle::release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// This release dropped the count to zero and ran the destructor.
    Destroyed,
    /// Other references keep the handle alive.
    Retained,
}

/// Counted reference to a managed handle.
///
/// Cloning increments the count and dropping decrements it; the decrement
/// that reaches zero runs `ManagedHandle::shutdown` and frees the value on
/// the calling thread.
pub struct OwningHandle<T: ManagedHandle> {
    inner: Arc<Managed<T>>,
}

impl<T: ManagedHandle> OwningHandle<T> {
    /// Wraps a freshly built handle with a count of one.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Managed {
                value,
                done: DestructionSignal {
                    control: Arc::new(CloseControl::default()),
                },
            }),
        }
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn close_state(&self) -> CloseState {
        self.inner.done.control.state()
    }

    pub fn close_waiter(&self) -> CloseWaiter {
        CloseWaiter::new(Arc::clone(&self.inner.done.control))
    }

    /// Rebinds this reference to `target`. The previous target is released
    /// before returning; rebinding to the same handle changes nothing.
    pub fn reset(&mut self, target: &Self) {
        if self.ptr_eq(target) {
            return;
        }
        let previous = std::mem::replace(self, target.clone());
        drop(previous);
    }

    /// Drops this reference and reports whether it was the last one.
    pub fn release(self) -> ReleaseOutcome {
        match Arc::into_inner(self.inner) {
            Some(managed) => {
                drop(managed);
                ReleaseOutcome::Destroyed
            }
            None => ReleaseOutcome::Retained,
        }
    }

    /// Open -> CloseRequested. Only the winning caller runs `on_close_requested`.
    pub fn request_close(&self) -> bool {
        if self.inner.done.control.request() {
            trace!(kind = T::KIND, "close requested");
            self.inner.value.on_close_requested();
            true
        } else {
            false
        }
    }

    /// Requests close, drops this reference, and blocks until the destructor
    /// has finished on whichever thread releases the last reference.
    ///
    /// Must not be called from a thread that other holders are waiting on
    /// (a prefetch worker, or while this thread holds another clone).
    pub fn await_close_and_destroy(self) {
        let waiter = self.close_waiter();
        self.request_close();
        drop(self);
        waiter.wait();
    }
}

impl<T: ManagedHandle> Clone for OwningHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ManagedHandle> Deref for OwningHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner.value
    }
}

impl<T: ManagedHandle> fmt::Debug for OwningHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwningHandle")
            .field("kind", &T::KIND)
            .field("refs", &self.ref_count())
            .field("state", &self.close_state())
            .finish()
    }
}
