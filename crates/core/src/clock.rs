//! Monotonic decisecond clock, injected into the reconciler
//!
//! Scan rate-limiting compares tick timestamps instead of reading a
//! global timer, so tests can drive time with a fake.

use std::cell::Cell;
use std::time::Instant;

/// Source of monotonic deciseconds
pub trait Clock {
    /// Current time in deciseconds since an arbitrary origin
    fn now_ds(&self) -> u64;
}

/// Wall-clock backed implementation
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ds(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64 / 100
    }
}

/// Manually advanced clock for tests
pub struct FakeClock {
    ds: Cell<u64>,
}

impl FakeClock {
    #[must_use]
    pub fn new(start_ds: u64) -> Self {
        Self {
            ds: Cell::new(start_ds),
        }
    }

    /// Advance the clock by `ds` deciseconds
    pub fn advance(&self, ds: u64) {
        self.ds.set(self.ds.get() + ds);
    }
}

impl Clock for FakeClock {
    fn now_ds(&self) -> u64 {
        self.ds.get()
    }
}
