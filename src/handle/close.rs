use crate::invariant::{InvariantViolation, ViolationKind};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Close progress of a managed handle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CloseState {
    Open,
    CloseRequested,
    DestructorRunning,
    DestructorDone,
}

impl CloseState {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseState::Open => "open",
            CloseState::CloseRequested => "close_requested",
            CloseState::DestructorRunning => "destructor_running",
            CloseState::DestructorDone => "destructor_done",
        }
    }
}

/// Close state plus the primitives waiters block on.
///
/// Allocated separately from the handle it describes so a waiter can keep
/// reading it after the handle itself has been freed.
#[derive(Debug)]
pub(crate) struct CloseControl {
    state: Mutex<CloseState>,
    cv: Condvar,
}

impl Default for CloseControl {
    fn default() -> Self {
        Self {
            state: Mutex::new(CloseState::Open),
            cv: Condvar::new(),
        }
    }
}

impl CloseControl {
    pub(crate) fn state(&self) -> CloseState {
        *self.state.lock()
    }

    /// Open -> CloseRequested. Returns true only for the caller that moved it.
    pub(crate) fn request(&self) -> bool {
        let mut state = self.state.lock();
        if *state == CloseState::Open {
            *state = CloseState::CloseRequested;
            true
        } else {
            false
        }
    }

    /// Enters DestructorRunning. A handle dropped without an explicit request
    /// passes through CloseRequested inside the same critical section.
    pub(crate) fn begin_destruction(&self) -> Result<(), InvariantViolation> {
        let mut state = self.state.lock();
        match *state {
            CloseState::Open | CloseState::CloseRequested => {
                *state = CloseState::DestructorRunning;
                Ok(())
            }
            other => Err(InvariantViolation::new(
                ViolationKind::DoubleDestroy,
                format!("destructor entered while already {}", other.as_str()),
            )),
        }
    }

    pub(crate) fn finish_destruction(&self) {
        let mut state = self.state.lock();
        *state = CloseState::DestructorDone;
        self.cv.notify_all();
    }

    pub(crate) fn wait_destroyed(&self) {
        let mut state = self.state.lock();
        while *state != CloseState::DestructorDone {
            self.cv.wait(&mut state);
        }
    }

    pub(crate) fn wait_destroyed_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while *state != CloseState::DestructorDone {
            if self.cv.wait_until(&mut state, deadline).timed_out() {
                return *state == CloseState::DestructorDone;
            }
        }
        true
    }
}

/// Observer of a handle's close progress that stays valid after the handle is gone.
#[derive(Debug, Clone)]
pub struct CloseWaiter {
    control: Arc<CloseControl>,
}

impl CloseWaiter {
    pub(crate) fn new(control: Arc<CloseControl>) -> Self {
        Self { control }
    }

    pub fn state(&self) -> CloseState {
        self.control.state()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == CloseState::DestructorDone
    }

    /// Blocks until the handle's destructor has finished.
    pub fn wait(&self) {
        self.control.wait_destroyed();
    }

    /// Like `wait`, bounded. Returns whether the destructor finished in time.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.control.wait_destroyed_for(timeout)
    }
}
