//! Time source for timers and optimistic timestamps.

use crate::types::Timestamp;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync {
    /// Monotonic time used for grace, gap and mutation timers.
    fn now(&self) -> Instant;

    /// Wall-clock time stamped on optimistic entities.
    fn wall(&self) -> Timestamp;
}

/// The system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    wall_origin: Timestamp,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(wall_origin: Timestamp) -> Self {
        Self {
            origin: Instant::now(),
            wall_origin,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Timestamp(0))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }

    fn wall(&self) -> Timestamp {
        Timestamp(self.wall_origin.0 + self.offset.lock().as_micros() as i64)
    }
}
