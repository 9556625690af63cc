//! Interrupt-safe duration capture.
//!
//! Window durations exclude interrupt and NMI time by pushing the window's
//! start timestamp forward when the interrupt finishes. A single start
//! field thus says whether the window is open, holds its start, and absorbs
//! the interference. The price is that a nested handler may rebase the
//! start while the thread is halfway through reading it:
//!
//! ```text
//! now = clock()
//!         ---> interrupt: start += irq duration
//! duration = now - start      // too small, maybe negative
//! ```
//!
//! Both operations below snapshot the per-core interrupt generation counter
//! around the critical access and retry when it moved. This is an optimistic
//! read/write pair, not a lock: nothing ever waits on another context.

use std::sync::atomic::{AtomicU64, Ordering, compiler_fence};

use log::debug;

use crate::clock::Clock;
use crate::percpu::CoreRecord;

/// Elapsed time since `start`, then close the window by zeroing `start`.
///
/// The result is signed: a residual race the counter cannot see (e.g. a
/// rebase landing between the last counter read and the zeroing) can still
/// produce a negative value. It is returned as is and never clamped here.
pub fn int_safe_duration(record: &CoreRecord, start: &AtomicU64, clock: &dyn Clock) -> i64 {
    let duration = loop {
        let generation = record.int_counter.load(Ordering::Acquire);
        compiler_fence(Ordering::SeqCst);

        let now = clock.now();
        let duration = now.wrapping_sub(start.load(Ordering::Relaxed)) as i64;

        compiler_fence(Ordering::SeqCst);
        if generation == record.int_counter.load(Ordering::Acquire) {
            break duration;
        }
    };

    if duration < 0 {
        debug!("negative duration {} ns: start rebased during capture", duration);
    }

    start.store(0, Ordering::Relaxed);
    duration
}

/// Stamp `start` with the current time, retrying if an interrupt arrived
/// in the middle of the write.
pub fn set_int_safe_start(record: &CoreRecord, start: &AtomicU64, clock: &dyn Clock) {
    loop {
        let generation = record.int_counter.load(Ordering::Acquire);
        compiler_fence(Ordering::SeqCst);

        start.store(clock.now(), Ordering::Relaxed);

        compiler_fence(Ordering::SeqCst);
        if generation == record.int_counter.load(Ordering::Acquire) {
            return;
        }
    }
}
