//! Host-visible iterators.
//!
//! An `IteratorFront` owns the store, snapshot and cursor references behind
//! one host iterator. Each host call claims the cursor through its handoff
//! flag; `Prefetch` additionally hands the cursor to a pool worker that steps
//! it one entry ahead while the host is busy with the current one.

use crate::config::RuntimeConfig;
use crate::cursor::{BackgroundClaim, ClaimError, CursorHandle, ForegroundGuard, HandoffState};
use crate::engine::NativeCursor;
use crate::error::{KvHandleError, ResourceType};
use crate::handle::{ManagedHandle, OwningHandle};
use crate::notify::{HostEvent, HostNotifier};
use crate::prefetch::{Job, PrefetchPool};
use crate::registry::{IteratorRef, ResourceId, SnapshotRef};
use crate::snapshot::SnapshotHandle;
use crate::store::StoreHandle;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorAction {
    First,
    Last,
    Next,
    Prev,
    Seek(Vec<u8>),
    /// Like `Next`, then steps one entry ahead in the background.
    Prefetch,
    /// Like `Next`, consuming any look-ahead without starting another.
    PrefetchStop,
}

impl IteratorAction {
    fn consumes_lookahead(&self) -> bool {
        matches!(
            self,
            IteratorAction::Next | IteratorAction::Prefetch | IteratorAction::PrefetchStop
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterStep {
    /// `value` is `None` for keys-only iterators.
    Entry {
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    },
    Exhausted,
}

impl IterStep {
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            IterStep::Entry { key, .. } => Some(key),
            IterStep::Exhausted => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, IterStep::Exhausted)
    }
}

/// Which point-in-time view an iterator reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SnapshotChoice {
    /// The store's current contents when the cursor is created.
    #[default]
    Latest,
    /// A private snapshot released together with the iterator.
    Fresh,
    /// A snapshot the host registered earlier on the same store.
    Existing(SnapshotRef),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub snapshot: SnapshotChoice,
    /// Exclusive upper bound; entries at or past it read as `Exhausted`.
    pub iterate_upper_bound: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Position {
    Unpositioned,
    At(Vec<u8>),
    Exhausted,
}

/// Boxed prefetch work item. Lives in its front's work slot between runs.
#[derive(Default)]
pub struct PrefetchJob {
    front: Option<OwningHandle<IteratorFront>>,
    cursor: Option<BackgroundClaim>,
}

impl Job for PrefetchJob {
    fn shard_key(&self) -> u64 {
        self.front.as_ref().map_or(0, |front| front.id.raw())
    }

    fn run(mut self: Box<Self>) {
        let (Some(front), Some(cursor)) = (self.front.take(), self.cursor.take()) else {
            return;
        };
        // Back in the slot before publishing, so the next claim can reuse it.
        front.return_job(self);
        if cursor.complete(|native| front.step_ahead(native)).is_err() {
            return;
        }
        trace!(iterator = %front.id, "prefetch step published");
        front.notifier.post(HostEvent::PrefetchReady { iterator: front.id });
    }
}

pub struct IteratorFront {
    id: IteratorRef,
    keys_only: bool,
    upper_bound: Option<Vec<u8>>,
    handoff_wait: Duration,
    reuse_slot: bool,
    position: Mutex<Position>,
    cursor: Mutex<Option<OwningHandle<CursorHandle>>>,
    snapshot: Option<OwningHandle<SnapshotHandle>>,
    slot: Mutex<Option<Box<PrefetchJob>>>,
    jobs_allocated: AtomicUsize,
    fallbacks: AtomicU64,
    notifier: HostNotifier,
    store: Option<OwningHandle<StoreHandle>>,
}

impl IteratorFront {
    /// Creates the cursor and registers with the store. `options.snapshot`
    /// must already be resolved into `snapshot`.
    pub fn open(
        id: IteratorRef,
        store: &OwningHandle<StoreHandle>,
        keys_only: bool,
        options: &ReadOptions,
        snapshot: Option<OwningHandle<SnapshotHandle>>,
        config: &RuntimeConfig,
        notifier: HostNotifier,
    ) -> Result<OwningHandle<IteratorFront>, KvHandleError> {
        let cursor = CursorHandle::open(store, snapshot.as_ref(), keys_only)?;
        store.add_dependent(id)?;
        debug!(
            iterator = %id,
            store = %store.id(),
            keys_only,
            snapshot = snapshot.is_some(),
            "iterator opened"
        );
        Ok(OwningHandle::new(IteratorFront {
            id,
            keys_only,
            upper_bound: options.iterate_upper_bound.clone(),
            handoff_wait: config.handoff_wait(),
            reuse_slot: config.reuse_prefetch_slot,
            position: Mutex::new(Position::Unpositioned),
            cursor: Mutex::new(Some(cursor)),
            snapshot,
            slot: Mutex::new(None),
            jobs_allocated: AtomicUsize::new(0),
            fallbacks: AtomicU64::new(0),
            notifier,
            store: Some(store.clone()),
        }))
    }

    pub fn id(&self) -> IteratorRef {
        self.id
    }

    pub fn keys_only(&self) -> bool {
        self.keys_only
    }

    pub fn belongs_to(&self, store: &OwningHandle<StoreHandle>) -> bool {
        self.store.as_ref().is_some_and(|own| own.ptr_eq(store))
    }

    pub fn handoff_state(&self) -> Option<HandoffState> {
        self.cursor.lock().as_ref().map(|c| c.handoff_state())
    }

    /// Prefetch jobs allocated over this iterator's life.
    pub fn jobs_allocated(&self) -> usize {
        self.jobs_allocated.load(Ordering::Relaxed)
    }

    /// Times a host call gave up on a busy prefetch and switched cursors.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Frees an idle prefetch job. Returns whether one was held.
    pub fn release_reusable_work_slot(&self) -> bool {
        self.slot.lock().take().is_some()
    }

    pub fn step(
        this: &OwningHandle<IteratorFront>,
        action: IteratorAction,
        pool: &PrefetchPool,
    ) -> Result<IterStep, KvHandleError> {
        let (mut guard, fell_back) = this.claim_cursor()?;
        let pending = guard.take_prefetched();
        let mut position = this.position.lock();
        let reposition = fell_back || (pending.is_some() && !action.consumes_lookahead());
        let step = match &action {
            IteratorAction::Next | IteratorAction::Prefetch | IteratorAction::PrefetchStop => {
                match pending {
                    Some(step) if !reposition => step,
                    _ => this.advance(&mut guard, &position, reposition),
                }
            }
            IteratorAction::Prev => this.retreat(&mut guard, &position, reposition),
            IteratorAction::First => {
                guard.native().seek_to_first();
                this.entry_at(guard.native())
            }
            IteratorAction::Last => {
                this.seek_last(guard.native());
                this.entry_at(guard.native())
            }
            IteratorAction::Seek(target) => {
                guard.native().seek(target);
                this.entry_at(guard.native())
            }
        };
        *position = match &step {
            IterStep::Entry { key, .. } => Position::At(key.clone()),
            IterStep::Exhausted => Position::Exhausted,
        };
        drop(position);
        if action == IteratorAction::Prefetch && !step.is_exhausted() {
            Self::launch_prefetch(this, guard, pool)?;
        }
        Ok(step)
    }

    fn busy(&self) -> KvHandleError {
        KvHandleError::Busy {
            resource_type: ResourceType::Iterator,
            resource_id: self.id.raw(),
        }
    }

    fn closing(&self) -> KvHandleError {
        KvHandleError::Closing {
            resource_type: ResourceType::Iterator,
            resource_id: self.id.raw(),
        }
    }

    /// Claims the current cursor, or a replacement when a background step
    /// outlasts the handoff wait. The flag tells whether the cursor must be
    /// repositioned from the last delivered key.
    fn claim_cursor(&self) -> Result<(ForegroundGuard, bool), KvHandleError> {
        let cursor = self.cursor.lock().clone().ok_or_else(|| self.closing())?;
        match ForegroundGuard::acquire(&cursor, self.handoff_wait) {
            Ok(guard) => Ok((guard, false)),
            Err(ClaimError::Held(HandoffState::BackgroundOwns)) => {
                Ok((self.fall_back(&cursor)?, true))
            }
            Err(ClaimError::Held(_)) => Err(self.busy()),
            Err(ClaimError::Violation(violation)) => Err(violation.into()),
        }
    }

    fn fall_back(&self, stale: &OwningHandle<CursorHandle>) -> Result<ForegroundGuard, KvHandleError> {
        let store = self.store.as_ref().ok_or_else(|| self.closing())?;
        let fresh = CursorHandle::open(store, self.snapshot.as_ref(), self.keys_only)?;
        let guard = ForegroundGuard::try_acquire(&fresh).map_err(|_| self.busy())?;
        {
            let mut current = self.cursor.lock();
            match current.as_mut() {
                Some(cursor) if cursor.ptr_eq(stale) => cursor.reset(&fresh),
                _ => return Err(self.busy()),
            }
        }
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        warn!(
            iterator = %self.id,
            wait_us = self.handoff_wait.as_micros() as u64,
            "prefetch still running after handoff wait; continuing on a fresh cursor"
        );
        Ok(guard)
    }

    fn entry_at(&self, native: &dyn NativeCursor) -> IterStep {
        if !native.valid() {
            return IterStep::Exhausted;
        }
        let key = native.key();
        if self
            .upper_bound
            .as_deref()
            .is_some_and(|bound| key >= bound)
        {
            return IterStep::Exhausted;
        }
        IterStep::Entry {
            key: key.to_vec(),
            value: (!self.keys_only).then(|| native.value().to_vec()),
        }
    }

    fn seek_last(&self, native: &mut dyn NativeCursor) {
        match self.upper_bound.as_deref() {
            Some(bound) => {
                native.seek(bound);
                if native.valid() {
                    native.prev();
                } else {
                    native.seek_to_last();
                }
            }
            None => native.seek_to_last(),
        }
    }

    fn advance(&self, guard: &mut ForegroundGuard, position: &Position, reposition: bool) -> IterStep {
        let native = guard.native();
        match position {
            Position::Exhausted => return IterStep::Exhausted,
            Position::Unpositioned => native.seek_to_first(),
            Position::At(last) if reposition => {
                native.seek(last);
                if native.valid() && native.key() == last.as_slice() {
                    native.next();
                }
            }
            Position::At(_) => native.next(),
        }
        self.entry_at(native)
    }

    fn retreat(&self, guard: &mut ForegroundGuard, position: &Position, reposition: bool) -> IterStep {
        let native = guard.native();
        match position {
            Position::Exhausted => return IterStep::Exhausted,
            Position::Unpositioned => self.seek_last(native),
            Position::At(last) if reposition => {
                native.seek(last);
                if native.valid() {
                    native.prev();
                } else {
                    native.seek_to_last();
                }
            }
            Position::At(_) => native.prev(),
        }
        self.entry_at(native)
    }

    /// The step a prefetch worker runs: one entry past the delivered one.
    fn step_ahead(&self, native: &mut dyn NativeCursor) -> IterStep {
        native.next();
        self.entry_at(native)
    }

    fn launch_prefetch(
        this: &OwningHandle<IteratorFront>,
        guard: ForegroundGuard,
        pool: &PrefetchPool,
    ) -> Result<(), KvHandleError> {
        let cursor = guard.hand_to_background()?;
        let mut job = this.take_job();
        job.front = Some(this.clone());
        job.cursor = Some(cursor);
        trace!(iterator = %this.id, "prefetch handed to background");
        if let Err(job) = pool.submit(job) {
            debug!(iterator = %this.id, "prefetch pool not accepting work; stepping inline");
            job.run();
        }
        Ok(())
    }

    fn take_job(&self) -> Box<PrefetchJob> {
        if self.reuse_slot {
            if let Some(job) = self.slot.lock().take() {
                return job;
            }
        }
        self.jobs_allocated.fetch_add(1, Ordering::Relaxed);
        Box::new(PrefetchJob::default())
    }

    fn return_job(&self, job: Box<PrefetchJob>) {
        if !self.reuse_slot {
            return;
        }
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(job);
        }
    }
}

impl ManagedHandle for IteratorFront {
    const KIND: &'static str = "iterator";

    fn shutdown(&mut self) {
        drop(self.cursor.get_mut().take());
        drop(self.snapshot.take());
        if let Some(store) = &self.store {
            store.remove_dependent(self.id);
        }
        drop(self.slot.get_mut().take());
        self.notifier.post(HostEvent::IteratorClosed { iterator: self.id });
        debug!(
            iterator = %self.id,
            fallbacks = self.fallbacks.load(Ordering::Relaxed),
            "iterator closed"
        );
        drop(self.store.take());
    }
}
