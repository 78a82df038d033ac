//! Reference-counted handles with a host-aware close protocol.
//!
//! Every native resource wrapper (store, snapshot, cursor, iterator front) is
//! a `ManagedHandle` reached only through `OwningHandle` references:
//!
//! ```text
//! Open ──request_close──▶ CloseRequested ──last release──▶ DestructorRunning
//!                                                              │ shutdown(), drop fields
//!                                                              ▼
//!                                                       DestructorDone ──▶ waiters wake
//! ```
//!
//! The close state lives in a control block allocated apart from the handle,
//! so `await_close_and_destroy` keeps a valid view of it while the handle
//! itself is torn down on another thread.

mod close;
mod owning;

pub use close::{CloseState, CloseWaiter};
pub use owning::{ManagedHandle, OwningHandle, ReleaseOutcome};
