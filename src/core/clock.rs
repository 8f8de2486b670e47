//! SC-003: Time source for execution timestamps.

use chrono::{DateTime, Utc};
use std::cell::Cell;

/// Supplies "now" for ledger rows and artifact completion times.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock UTC, truncated to the microsecond precision the ledger stores.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let now = Utc::now();
        DateTime::<Utc>::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
    }
}

/// Deterministic clock that advances by a fixed step on every call.
#[derive(Debug)]
pub struct TickClock {
    next_us: Cell<i64>,
    step_us: i64,
}

impl TickClock {
    /// Start at `start`, advancing one second per reading.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            next_us: Cell::new(start.timestamp_micros()),
            step_us: 1_000_000,
        }
    }

    /// Jump forward without producing a reading.
    pub fn advance(&self, us: i64) {
        self.next_us.set(self.next_us.get() + us);
    }
}

impl Clock for TickClock {
    fn now(&self) -> DateTime<Utc> {
        let current = self.next_us.get();
        self.next_us.set(current + self.step_us);
        DateTime::<Utc>::from_timestamp_micros(current).unwrap_or_default()
    }
}
