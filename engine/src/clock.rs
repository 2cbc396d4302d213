//! Time sources.
//!
//! All timestamps in the engine (document `_modified`, tombstone delete times,
//! collection attributes) come from a [`Clock`] held by the engine context, so
//! tests can pin time with a [`FixedClock`].

use crate::Timestamp;
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};

/// A source of wall-clock time in epoch milliseconds.
pub trait Clock: Send + Sync + Debug {
    fn now_millis(&self) -> Timestamp;
}

/// Real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct FixedClock {
    millis: AtomicI64,
}

impl FixedClock {
    pub fn new(millis: Timestamp) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    pub fn set(&self, millis: Timestamp) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: Timestamp) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_millis(&self) -> Timestamp {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Strictly increasing counter for locally created tombstones.
///
/// Each value is the current time, bumped past the previous value when the
/// clock has not moved, so tombstones created in the same millisecond still
/// get distinct, ordered counters usable as delta cursors.
#[derive(Debug, Default)]
pub struct TombstoneCounter {
    last: AtomicI64,
}

impl TombstoneCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, now: Timestamp) -> Timestamp {
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }

    /// Move the counter forward so it never issues a value at or below `seen`.
    pub fn observe(&self, seen: Timestamp) {
        self.last.fetch_max(seen, Ordering::SeqCst);
    }
}
