//! Strictly increasing millisecond clock.
//!
//! File timestamps double as chunk-key file ids and event timestamps are
//! event-log keys, so neither may repeat even when two writes land in the
//! same millisecond or the wall clock steps backwards.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::utils::now_ms;

#[derive(Debug)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    /// Create a clock that never returns a value `<= seed`.
    pub fn new(seed: i64) -> Self {
        Self {
            last: AtomicI64::new(seed),
        }
    }

    /// Next tick: wall-clock milliseconds, bumped past the previous tick.
    pub fn next(&self) -> i64 {
        let now = now_ms();
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(prev + 1)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new(0)
    }
}
