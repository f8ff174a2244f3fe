//! Process-monotonic timestamp source for durable writes.
//!
//! Wall-clock microseconds, bumped by one whenever the wall clock stalls or
//! steps backwards, so no two calls in one process ever return the same
//! value.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Strictly increasing microsecond clock.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Next timestamp: `max(wall, last + 1)`.
    pub fn now(&self) -> u64 {
        let wall = wall_micros();
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(current + 1);
            match self
                .last
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    /// Never hand out `timestamp` or anything below it again.
    ///
    /// Used when reopening a log whose entries were stamped by an earlier
    /// process, possibly with a wall clock ahead of this one.
    pub fn observe(&self, timestamp: u64) {
        self.last.fetch_max(timestamp, Ordering::AcqRel);
    }

    /// Last value handed out (0 if none).
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

fn wall_micros() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
