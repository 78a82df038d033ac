//! Cursor handles shared between a host thread and prefetch workers.

mod handoff;

pub use handoff::{HandoffFlag, HandoffState};

use crate::engine::NativeCursor;
use crate::error::KvHandleError;
use crate::handle::{ManagedHandle, OwningHandle};
use crate::invariant::{self, InvariantViolation, ViolationKind};
use crate::iterator::IterStep;
use crate::snapshot::SnapshotHandle;
use crate::store::StoreHandle;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::trace;

struct CursorState {
    native: Box<dyn NativeCursor>,
    prefetched: Option<IterStep>,
}

/// One native cursor plus the references that keep its sources alive.
///
/// `state` is only locked by the holder of a flag claim, so the lock is never
/// contended; the flag decides ownership and the lock only hands out the
/// borrow.
///
/// Field order is teardown order: the native cursor goes first, then the
/// snapshot, then the store.
pub struct CursorHandle {
    state: Arc<Mutex<CursorState>>,
    flag: HandoffFlag,
    keys_only: bool,
    prefetch_started: AtomicBool,
    snapshot: Option<OwningHandle<SnapshotHandle>>,
    store: OwningHandle<StoreHandle>,
}

fn handoff_violation(detail: String) -> InvariantViolation {
    let violation = InvariantViolation::new(ViolationKind::HandoffOwnership, detail);
    invariant::report(&violation);
    violation
}

impl CursorHandle {
    pub fn open(
        store: &OwningHandle<StoreHandle>,
        snapshot: Option<&OwningHandle<SnapshotHandle>>,
        keys_only: bool,
    ) -> Result<OwningHandle<CursorHandle>, KvHandleError> {
        let token = snapshot.and_then(|s| s.token());
        let native = store.native()?.new_cursor(token)?;
        trace!(store = %store.id(), snapshot = ?token, keys_only, "cursor opened");
        Ok(OwningHandle::new(CursorHandle {
            state: Arc::new(Mutex::new(CursorState {
                native,
                prefetched: None,
            })),
            flag: HandoffFlag::default(),
            keys_only,
            prefetch_started: AtomicBool::new(false),
            snapshot: snapshot.cloned(),
            store: store.clone(),
        }))
    }

    pub fn handoff_state(&self) -> HandoffState {
        self.flag.load()
    }

    pub fn keys_only(&self) -> bool {
        self.keys_only
    }

    /// True once any prefetch has been handed to the background.
    pub fn prefetch_started(&self) -> bool {
        self.prefetch_started.load(Ordering::Acquire)
    }

    pub fn store(&self) -> &OwningHandle<StoreHandle> {
        &self.store
    }

    pub fn snapshot(&self) -> Option<&OwningHandle<SnapshotHandle>> {
        self.snapshot.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn flag(&self) -> &HandoffFlag {
        &self.flag
    }
}

impl ManagedHandle for CursorHandle {
    const KIND: &'static str = "cursor";

    fn shutdown(&mut self) {
        trace!(
            store = %self.store.id(),
            handoff = self.flag.load().as_str(),
            "cursor released"
        );
    }
}

/// The flag half of a foreground claim. Returns the cursor to `Idle` on drop
/// unless the claim was handed to the background.
struct ForegroundClaim {
    cursor: OwningHandle<CursorHandle>,
    claimed_from: HandoffState,
    handed_off: bool,
}

impl Drop for ForegroundClaim {
    fn drop(&mut self) {
        if self.handed_off {
            return;
        }
        if let Err(observed) = self
            .cursor
            .flag
            .transition(HandoffState::ForegroundOwns, HandoffState::Idle)
        {
            handoff_violation(format!(
                "foreground release while cursor was {}",
                observed.as_str()
            ));
        }
    }
}

/// Why a foreground claim was not granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimError {
    /// Another party still owns the cursor.
    Held(HandoffState),
    Violation(InvariantViolation),
}

/// Exclusive foreground access to a cursor. Dropping it returns the cursor to `Idle`.
pub struct ForegroundGuard {
    // Unlocked before `claim` gives the flag back.
    state: ArcMutexGuard<RawMutex, CursorState>,
    claim: ForegroundClaim,
}

impl ForegroundGuard {
    pub fn try_acquire(cursor: &OwningHandle<CursorHandle>) -> Result<Self, ClaimError> {
        let claimed_from = cursor
            .flag
            .try_claim_foreground()
            .map_err(ClaimError::Held)?;
        Self::claimed(cursor, claimed_from)
    }

    /// Waits up to `wait` for another owner to let go.
    pub fn acquire(
        cursor: &OwningHandle<CursorHandle>,
        wait: Duration,
    ) -> Result<Self, ClaimError> {
        let claimed_from = cursor
            .flag
            .claim_foreground(wait)
            .map_err(ClaimError::Held)?;
        Self::claimed(cursor, claimed_from)
    }

    fn claimed(
        cursor: &OwningHandle<CursorHandle>,
        claimed_from: HandoffState,
    ) -> Result<Self, ClaimError> {
        let claim = ForegroundClaim {
            cursor: cursor.clone(),
            claimed_from,
            handed_off: false,
        };
        match cursor.state.try_lock_arc() {
            Some(state) => Ok(Self { state, claim }),
            None => Err(ClaimError::Violation(handoff_violation(
                "cursor state locked outside a flag claim".to_string(),
            ))),
        }
    }

    pub fn handle(&self) -> &OwningHandle<CursorHandle> {
        &self.claim.cursor
    }

    /// Whether this claim picked up a finished background step.
    pub fn claimed_from(&self) -> HandoffState {
        self.claim.claimed_from
    }

    /// Takes the result a background step left behind, if any.
    pub fn take_prefetched(&mut self) -> Option<IterStep> {
        self.state.prefetched.take()
    }

    pub fn native(&mut self) -> &mut dyn NativeCursor {
        self.state.native.as_mut()
    }

    pub fn valid(&self) -> bool {
        self.state.native.valid()
    }

    pub fn key(&self) -> &[u8] {
        self.state.native.key()
    }

    pub fn value(&self) -> &[u8] {
        self.state.native.value()
    }

    /// ForegroundOwns -> BackgroundOwns. The returned claim is the only way
    /// to step the cursor until its result is published.
    pub fn hand_to_background(self) -> Result<BackgroundClaim, InvariantViolation> {
        let ForegroundGuard { mut state, mut claim } = self;
        state.prefetched = None;
        drop(state);
        claim.handed_off = true;
        let cursor = claim.cursor.clone();
        cursor.prefetch_started.store(true, Ordering::Release);
        cursor
            .flag
            .transition(HandoffState::ForegroundOwns, HandoffState::BackgroundOwns)
            .map_err(|observed| {
                handoff_violation(format!(
                    "handoff from a guard while cursor was {}",
                    observed.as_str()
                ))
            })?;
        Ok(BackgroundClaim {
            cursor,
            published: false,
        })
    }
}

/// Background ownership of a handed-off cursor. Not `Clone`: exactly one
/// exists per handoff. Dropping it unpublished marks the step done with no
/// result, so the next foreground claim steps the cursor itself.
pub struct BackgroundClaim {
    cursor: OwningHandle<CursorHandle>,
    published: bool,
}

impl BackgroundClaim {
    pub fn handle(&self) -> &OwningHandle<CursorHandle> {
        &self.cursor
    }

    /// Runs one step on the cursor, then publishes its result.
    pub fn complete(
        mut self,
        step: impl FnOnce(&mut dyn NativeCursor) -> IterStep,
    ) -> Result<(), InvariantViolation> {
        let observed = self.cursor.flag.load();
        if observed != HandoffState::BackgroundOwns {
            self.published = true;
            return Err(handoff_violation(format!(
                "background step on a cursor in state {}",
                observed.as_str()
            )));
        }
        {
            let Some(mut state) = self.cursor.state.try_lock() else {
                self.published = true;
                return Err(handoff_violation(
                    "cursor state locked during a background step".to_string(),
                ));
            };
            let result = step(state.native.as_mut());
            state.prefetched = Some(result);
        }
        self.published = true;
        self.cursor
            .flag
            .transition(HandoffState::BackgroundOwns, HandoffState::BackgroundDone)
            .map_err(|observed| {
                handoff_violation(format!(
                    "cursor left background ownership as {}",
                    observed.as_str()
                ))
            })
    }
}

impl Drop for BackgroundClaim {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        if let Err(observed) = self
            .cursor
            .flag
            .transition(HandoffState::BackgroundOwns, HandoffState::BackgroundDone)
        {
            handoff_violation(format!(
                "unpublished background claim while cursor was {}",
                observed.as_str()
            ));
        }
    }
}
