use std::hint;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Who may touch a cursor right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandoffState {
    Idle = 0,
    ForegroundOwns = 1,
    BackgroundOwns = 2,
    /// A background step finished; its result waits for the next foreground claim.
    BackgroundDone = 3,
}

impl HandoffState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => HandoffState::Idle,
            1 => HandoffState::ForegroundOwns,
            2 => HandoffState::BackgroundOwns,
            _ => HandoffState::BackgroundDone,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HandoffState::Idle => "idle",
            HandoffState::ForegroundOwns => "foreground",
            HandoffState::BackgroundOwns => "background",
            HandoffState::BackgroundDone => "background_done",
        }
    }
}

/// Single-word ownership flag. Every transition is a compare-and-swap, so at
/// most one party owns the cursor at any instant.
#[derive(Debug)]
pub struct HandoffFlag(AtomicU8);

impl Default for HandoffFlag {
    fn default() -> Self {
        Self(AtomicU8::new(HandoffState::Idle as u8))
    }
}

const SPIN_ROUNDS: u32 = 64;
const YIELD_ROUNDS: u32 = 16;
const SLEEP_STEP: Duration = Duration::from_micros(50);

impl HandoffFlag {
    pub fn load(&self) -> HandoffState {
        HandoffState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves `from -> to`, or returns the state actually observed.
    pub fn transition(&self, from: HandoffState, to: HandoffState) -> Result<(), HandoffState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(HandoffState::from_u8)
    }

    /// One foreground claim attempt. On success returns the state claimed
    /// from (`Idle` or `BackgroundDone`).
    pub fn try_claim_foreground(&self) -> Result<HandoffState, HandoffState> {
        match self.transition(HandoffState::Idle, HandoffState::ForegroundOwns) {
            Ok(()) => Ok(HandoffState::Idle),
            Err(HandoffState::BackgroundDone) => self
                .transition(HandoffState::BackgroundDone, HandoffState::ForegroundOwns)
                .map(|()| HandoffState::BackgroundDone),
            Err(observed) => Err(observed),
        }
    }

    /// Claims for the foreground, waiting up to `wait` for the current owner.
    /// Spins first, then yields, then sleeps in short steps. On timeout
    /// returns the owner observed last.
    pub fn claim_foreground(&self, wait: Duration) -> Result<HandoffState, HandoffState> {
        let deadline = Instant::now() + wait;
        let mut round = 0u32;
        loop {
            let observed = match self.try_claim_foreground() {
                Ok(from) => return Ok(from),
                Err(observed) => observed,
            };
            if Instant::now() >= deadline {
                return Err(observed);
            }
            if round < SPIN_ROUNDS {
                hint::spin_loop();
            } else if round < SPIN_ROUNDS + YIELD_ROUNDS {
                thread::yield_now();
            } else {
                let left = deadline.saturating_duration_since(Instant::now());
                thread::sleep(left.min(SLEEP_STEP));
            }
            round = round.saturating_add(1);
        }
    }
}
