//! Per-core latency records.
//!
//! Each core owns one [`CoreRecord`]. Only code executing on that core
//! touches it, but that code runs at several priority levels (thread, IRQ,
//! NMI) which nest. Every field is therefore an atomic: loads and stores are
//! relaxed, ordering against nested handlers comes from the interrupt
//! generation counter (see `duration`).

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

use log::debug;
use serde::Serialize;

use crate::error::{Result, RtslError};

#[derive(Debug, Default)]
pub struct WindowState {
    /// Zero means the window is not open.
    pub(crate) start: AtomicU64,
    pub(crate) max: AtomicU64,
}

impl WindowState {
    #[inline]
    pub fn is_open(&self) -> bool {
        self.start.load(Ordering::Relaxed) != 0
    }

    #[inline]
    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    /// Push the start forward so `duration` is excluded from the window.
    #[inline]
    pub(crate) fn discount(&self, duration: i64) {
        if self.is_open() {
            self.start.fetch_add(duration as u64, Ordering::Relaxed);
        }
    }

    fn reset(&self) {
        self.start.store(0, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
    }
}

/// Preemption or IRQ disabled by a thread.
#[derive(Debug, Default)]
pub struct PoidState {
    pub(crate) preempt_disabled: AtomicBool,
    pub(crate) irq_disabled: AtomicBool,
    pub(crate) window: WindowState,
}

/// Scheduler tail delay, tagged with the thread that entered the scheduler.
#[derive(Debug, Default)]
pub struct DstState {
    pub(crate) tid: AtomicU32,
    pub(crate) window: WindowState,
}

/// The interrupt currently being serviced, if any.
#[derive(Debug, Default)]
pub struct IrqState {
    /// Best-effort arrival stamp, only used for reporting.
    pub(crate) arrival: AtomicU64,
    pub(crate) start: AtomicU64,
    pub(crate) vector: AtomicI32,
    /// PSD was already open when the interrupt masked IRQs.
    pub(crate) was_psd: AtomicBool,
}

impl IrqState {
    #[inline]
    pub fn is_open(&self) -> bool {
        self.start.load(Ordering::Relaxed) != 0
    }
}

#[derive(Debug, Default)]
pub struct NmiState {
    pub(crate) start: AtomicU64,
}

#[derive(Debug, Default)]
pub struct CoreRecord {
    /// Bumped by interrupt and NMI entry only.
    pub(crate) int_counter: AtomicU64,
    pub(crate) poid: PoidState,
    pub(crate) paie: WindowState,
    pub(crate) psd: WindowState,
    pub(crate) dst: DstState,
    pub(crate) irq: IrqState,
    pub(crate) nmi: NmiState,
    pub(crate) running: AtomicBool,
}

/// Running maxima of one core, in nanoseconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowMaxima {
    pub poid: u64,
    pub paie: u64,
    pub psd: u64,
    pub dst: u64,
}

/// Which windows currently have a start timestamp.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OpenWindows {
    pub poid: bool,
    pub paie: bool,
    pub psd: bool,
    pub dst: bool,
    pub irq: bool,
}

impl CoreRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero every field, as at module load.
    pub fn reset(&self) {
        self.int_counter.store(0, Ordering::Relaxed);

        self.poid.preempt_disabled.store(false, Ordering::Relaxed);
        self.poid.irq_disabled.store(false, Ordering::Relaxed);
        self.poid.window.reset();

        self.paie.reset();
        self.psd.reset();

        self.dst.tid.store(0, Ordering::Relaxed);
        self.dst.window.reset();

        self.irq.arrival.store(0, Ordering::Relaxed);
        self.irq.start.store(0, Ordering::Relaxed);
        self.irq.vector.store(0, Ordering::Relaxed);
        self.irq.was_psd.store(false, Ordering::Relaxed);

        self.nmi.start.store(0, Ordering::Relaxed);

        self.running.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn interrupt_generation(&self) -> u64 {
        self.int_counter.load(Ordering::Acquire)
    }

    pub fn maxima(&self) -> WindowMaxima {
        WindowMaxima {
            poid: self.poid.window.max(),
            paie: self.paie.max(),
            psd: self.psd.max(),
            dst: self.dst.window.max(),
        }
    }

    pub fn open_windows(&self) -> OpenWindows {
        OpenWindows {
            poid: self.poid.window.is_open(),
            paie: self.paie.is_open(),
            psd: self.psd.is_open(),
            dst: self.dst.window.is_open(),
            irq: self.irq.is_open(),
        }
    }
}

/// One record per core, allocated once and indexed by core id.
#[derive(Debug)]
pub struct CoreRecords {
    records: Box<[CoreRecord]>,
}

impl CoreRecords {
    pub fn new(nr_cpus: usize) -> Result<Self> {
        if nr_cpus == 0 {
            return Err(RtslError::InvalidConfiguration(
                "at least one core is required".to_string(),
            ));
        }

        let mut records = Vec::new();
        records
            .try_reserve_exact(nr_cpus)
            .map_err(|_| RtslError::OutOfMemory(nr_cpus))?;
        records.extend((0..nr_cpus).map(|_| CoreRecord::new()));

        debug!("Allocated {} core records", nr_cpus);
        Ok(Self {
            records: records.into_boxed_slice(),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, cpu: u32) -> Option<&CoreRecord> {
        self.records.get(cpu as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoreRecord> {
        self.records.iter()
    }

    pub fn reset_all(&self) {
        for record in self.records.iter() {
            record.reset();
        }
    }

    pub fn stop_all(&self) {
        for record in self.records.iter() {
            record.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_is_closed() {
        let record = CoreRecord::new();
        assert_eq!(record.open_windows(), OpenWindows::default());
        assert_eq!(record.maxima(), WindowMaxima::default());
        assert!(!record.is_running());
    }

    #[test]
    fn test_reset_clears_everything() {
        let record = CoreRecord::new();
        record.int_counter.store(9, Ordering::Relaxed);
        record.poid.window.start.store(10, Ordering::Relaxed);
        record.poid.window.max.store(11, Ordering::Relaxed);
        record.poid.irq_disabled.store(true, Ordering::Relaxed);
        record.psd.start.store(12, Ordering::Relaxed);
        record.dst.tid.store(42, Ordering::Relaxed);
        record.irq.was_psd.store(true, Ordering::Relaxed);
        record.start();

        record.reset();

        assert_eq!(record.interrupt_generation(), 0);
        assert_eq!(record.open_windows(), OpenWindows::default());
        assert_eq!(record.maxima(), WindowMaxima::default());
        assert!(!record.poid.irq_disabled.load(Ordering::Relaxed));
        assert_eq!(record.dst.tid.load(Ordering::Relaxed), 0);
        assert!(!record.irq.was_psd.load(Ordering::Relaxed));
        assert!(!record.is_running());
    }

    #[test]
    fn test_discount_only_touches_open_windows() {
        let window = WindowState::default();
        window.discount(50);
        assert!(!window.is_open());

        window.start.store(100, Ordering::Relaxed);
        window.discount(50);
        assert_eq!(window.start.load(Ordering::Relaxed), 150);
    }

    #[test]
    fn test_records_zero_cores_rejected() {
        assert!(matches!(
            CoreRecords::new(0),
            Err(RtslError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_records_indexed_by_core() {
        let records = CoreRecords::new(4).unwrap();
        assert_eq!(records.len(), 4);
        assert!(records.get(3).is_some());
        assert!(records.get(4).is_none());

        records.get(2).unwrap().start();
        records.stop_all();
        assert!(records.iter().all(|r| !r.is_running()));
    }
}
