//! Clock sources.
//!
//! The analyzer assumes a monotonic, per-core consistent nanosecond clock
//! that never reads exactly zero: a zero start timestamp is how a window
//! says "not open".

use std::sync::atomic::{AtomicU64, Ordering};

pub trait Clock: Send + Sync {
    /// Current time in nanoseconds.
    fn now(&self) -> u64;
}

/// A clock that reads whatever it was last set to.
///
/// Replayed traces carry their own timestamps; the replay loop sets this
/// clock to the timestamp of each line before dispatching it.
#[derive(Debug, Default)]
pub struct TraceClock {
    now: AtomicU64,
}

impl TraceClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, ns: u64) {
        self.now.store(ns, Ordering::Relaxed);
    }
}

impl Clock for TraceClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_clock_reads_last_set() {
        let clock = TraceClock::new(100);
        assert_eq!(clock.now(), 100);
        clock.set(7);
        assert_eq!(clock.now(), 7);
        // a dyn Clock sees the same value
        let shared: &dyn Clock = &clock;
        assert_eq!(shared.now(), 7);
    }
}
