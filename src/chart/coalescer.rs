//! CH-05: Change coalescer — bursts of change events become one refetch.
//!
//! Explicit state machine: `Idle → Buffering → Fetching → Idle`. Time comes
//! from the caller, so the debounce is testable without sleeping.
//!
//! - Every qualifying event in `Buffering` pushes the deadline out by the
//!   quiet window, but never past `burst_started + max_burst`.
//! - Events during `Fetching` mark the fetch dirty; a dirty fetch starts a
//!   fresh quiet window when it finishes.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn utc_now(&self) -> DateTime<Utc>;
}

/// Real time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
    elapsed: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: Utc::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut elapsed) = self.elapsed.lock() {
            *elapsed += by;
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    fn elapsed(&self) -> Duration {
        self.elapsed.lock().map(|e| *e).unwrap_or_default()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.elapsed()).unwrap_or_default();
        self.wall_origin + elapsed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalescerState {
    Idle,
    Buffering { burst_started: Instant, deadline: Instant },
    Fetching { dirty: bool },
}

#[derive(Debug)]
pub struct Coalescer {
    quiet_window: Duration,
    max_burst: Duration,
    state: CoalescerState,
}

impl Coalescer {
    pub fn new(quiet_window: Duration, max_burst: Duration) -> Self {
        Self {
            quiet_window,
            max_burst: max_burst.max(quiet_window),
            state: CoalescerState::Idle,
        }
    }

    pub fn state(&self) -> CoalescerState {
        self.state
    }

    pub fn is_fetching(&self) -> bool {
        matches!(self.state, CoalescerState::Fetching { .. })
    }

    /// A qualifying change event arrived.
    pub fn on_event(&mut self, now: Instant) {
        self.state = match self.state {
            CoalescerState::Idle => CoalescerState::Buffering {
                burst_started: now,
                deadline: now + self.quiet_window,
            },
            CoalescerState::Buffering { burst_started, .. } => CoalescerState::Buffering {
                burst_started,
                deadline: (now + self.quiet_window).min(burst_started + self.max_burst),
            },
            CoalescerState::Fetching { .. } => CoalescerState::Fetching { dirty: true },
        };
    }

    /// Returns `true` exactly once per burst, when the deadline has passed.
    /// The coalescer is then `Fetching` until `fetch_finished`.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.state {
            CoalescerState::Buffering { deadline, .. } if now >= deadline => {
                self.state = CoalescerState::Fetching { dirty: false };
                true
            }
            _ => false,
        }
    }

    /// A fetch was issued outside the debounce (scope switch, manual refresh).
    /// Any pending burst is covered by it.
    pub fn fetch_started(&mut self) {
        self.state = CoalescerState::Fetching { dirty: false };
    }

    pub fn fetch_finished(&mut self, now: Instant) {
        self.state = match self.state {
            CoalescerState::Fetching { dirty: true } => CoalescerState::Buffering {
                burst_started: now,
                deadline: now + self.quiet_window,
            },
            _ => CoalescerState::Idle,
        };
    }

    /// Drop any pending timer or fetch bookkeeping.
    pub fn cancel(&mut self) {
        self.state = CoalescerState::Idle;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            CoalescerState::Buffering { deadline, .. } => Some(deadline),
            _ => None,
        }
    }
}
