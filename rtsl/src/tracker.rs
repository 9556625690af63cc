//! Window tracker.
//!
//! The handlers here implement the per-core latency state machine. Each one
//! runs on the core whose record it is given, at whatever priority level
//! the hook fired at (thread, IRQ or NMI), and must complete in bounded time:
//! no locks, no allocation, no blocking. Guard clauses that return early are
//! the common case, not errors.
//!
//! Windows (all per core):
//! - POID: a thread has preemption or IRQs (or both) disabled.
//! - PAIE: preemption and IRQs enabled with a reschedule pending, until the
//!   scheduler is entered.
//! - PSD: the scheduler's own preemption-disabled section.
//! - DST: from IRQs being disabled for the context switch until preemption
//!   is enabled on the way out of the scheduler.
//!
//! IRQ and NMI execution time is discounted from every window that was open
//! while the handler ran, by moving the window's start forward.

use std::sync::atomic::{AtomicU64, Ordering};

use rtsl_common::{IrqExecution, NmiExecution, Sample, TaskContext, Window, WindowSample};

use crate::clock::Clock;
use crate::duration::{int_safe_duration, set_int_safe_start};
use crate::percpu::CoreRecord;
use crate::sink::SampleSink;

/// Everything a handler needs, resolved once per event.
pub struct CoreContext<'a> {
    pub cpu: u32,
    pub record: &'a CoreRecord,
    pub clock: &'a dyn Clock,
    pub sink: &'a dyn SampleSink,
    pub task: TaskContext,
    /// Global collection flag, as observed when the event fired.
    pub enabled: bool,
}

impl<'a> CoreContext<'a> {
    /// Check, and possibly reach, the initial condition of this core.
    ///
    /// A core starts tracking on the first scheduler entry after collection
    /// was enabled, provided IRQs are unmasked: the scheduler can legally be
    /// entered with IRQs disabled (preempt_schedule_irq), and starting there
    /// would leave the window flags out of step with reality.
    fn initialized(&self) -> bool {
        if self.record.is_running() {
            return true;
        }
        if !self.enabled || self.task.irqs_disabled {
            return false;
        }
        self.record.start();
        true
    }

    fn set_start(&self, start: &AtomicU64) {
        set_int_safe_start(self.record, start, self.clock);
    }

    fn duration(&self, start: &AtomicU64) -> i64 {
        int_safe_duration(self.record, start, self.clock)
    }

    /// Emit a window sample and raise the running maximum if exceeded.
    fn report(&self, window: Window, duration: i64, max: &AtomicU64) {
        let sample = WindowSample {
            cpu: self.cpu,
            window,
            duration,
        };
        self.sink.emit(Sample::Window(sample));

        if duration <= 0 || duration as u64 <= max.load(Ordering::Relaxed) {
            return;
        }
        max.store(duration as u64, Ordering::Relaxed);
        self.sink.emit(Sample::NewMax(sample));
    }

    fn poid_duration(&self) {
        let poid = &self.record.poid.window;
        if !poid.is_open() {
            return;
        }

        let duration = self.duration(&poid.start);

        // idle waits for work with preemption disabled; it would own the max
        if self.task.idle {
            return;
        }
        self.report(Window::Poid, duration, &poid.max);
    }

    fn paie_duration(&self) {
        let paie = &self.record.paie;
        if !paie.is_open() {
            return;
        }

        let duration = self.duration(&paie.start);
        if self.task.idle {
            return;
        }
        self.report(Window::Paie, duration, &paie.max);
    }

    /// Account the interrupt that just finished and discount it from every
    /// window it interfered with.
    fn irq_occurrence(&self) {
        let record = self.record;
        let irq = &record.irq;

        let duration = self.duration(&irq.start);
        self.sink.emit(Sample::IrqExecution(IrqExecution {
            cpu: self.cpu,
            vector: irq.vector.load(Ordering::Relaxed),
            start: irq.arrival.load(Ordering::Relaxed),
            duration,
        }));

        record.poid.window.discount(duration);
        record.dst.window.discount(duration);
        record.paie.discount(duration);

        // PSD is checked through was_psd rather than its own start: an IRQ
        // that sets need_resched opens PSD before IRQs are re-enabled (see
        // preempt_schedule_irq), and that PSD must not absorb the IRQ.
        if irq.was_psd.load(Ordering::Relaxed) {
            record.psd.discount(duration);
        }

        irq.vector.store(0, Ordering::Relaxed);
        irq.was_psd.store(false, Ordering::Relaxed);
    }

    /// IRQs disabled by a thread.
    pub fn irq_disable_normal(&self) {
        let record = self.record;
        let poid = &record.poid;

        if record.psd.is_open() {
            // Until the context switch changes the current thread, DST has
            // not started yet: keep moving its start up to now.
            if record.dst.tid.load(Ordering::Relaxed) == self.task.tid {
                self.set_start(&record.dst.window.start);
            }
            // Fall through: after a preemption from IRQ the thread returns
            // from the scheduler with IRQs disabled, still inside PSD, and
            // that is where its POID starts.
        }

        poid.irq_disabled.store(true, Ordering::Relaxed);

        if poid.window.is_open() {
            return;
        }
        self.set_start(&poid.window.start);
    }

    /// IRQs disabled by the entry point of an interrupt.
    pub fn irq_disable_irq(&self) {
        let record = self.record;
        let irq = &record.irq;

        if record.psd.is_open() {
            irq.was_psd.store(true, Ordering::Relaxed);
        }

        // reporting only, no need for the safe write
        irq.arrival.store(self.clock.now(), Ordering::Relaxed);

        self.set_start(&irq.start);
    }

    /// IRQs enabled on the way out of an interrupt.
    pub fn irq_enable_irq(&self) {
        if !self.record.irq.is_open() {
            return;
        }
        self.irq_occurrence();
    }

    /// IRQs enabled by a thread.
    pub fn irq_enable_normal(&self) {
        let record = self.record;
        let poid = &record.poid;

        poid.irq_disabled.store(false, Ordering::Relaxed);

        // preemption still disabled, or inside the scheduler: the POID
        // continues until the thread is really preemptible again
        if poid.preempt_disabled.load(Ordering::Relaxed) || record.psd.is_open() {
            return;
        }

        self.poid_duration();

        if self.task.need_resched {
            self.set_start(&record.paie.start);
        }
    }

    /// Regular preempt_disable, contributing to POID.
    pub fn preempt_disable_nosched(&self) {
        let record = self.record;
        let poid = &record.poid;

        // preemption toggled inside an interrupt is interference
        if record.irq.is_open() {
            return;
        }

        poid.preempt_disabled.store(true, Ordering::Relaxed);

        if poid.irq_disabled.load(Ordering::Relaxed) {
            return;
        }
        self.set_start(&poid.window.start);
    }

    /// Regular preempt_enable, closing POID.
    pub fn preempt_enable_nosched(&self) {
        let record = self.record;
        let poid = &record.poid;

        if record.irq.is_open() {
            return;
        }

        poid.preempt_disabled.store(false, Ordering::Relaxed);

        if poid.irq_disabled.load(Ordering::Relaxed) {
            return;
        }

        self.poid_duration();

        if self.task.need_resched {
            self.set_start(&record.paie.start);
        }
    }

    /// Preemption disabled to call the scheduler: PSD starts, and PAIE ends
    /// if a reschedule was pending.
    pub fn preempt_disable_sched(&self) {
        let record = self.record;

        if !self.initialized() {
            return;
        }

        // PAIE only counts if the scheduler was called with IRQs enabled;
        // preempt_schedule_irq enters with them disabled.
        if self.task.need_resched
            && !record.irq.is_open()
            && !record.poid.irq_disabled.load(Ordering::Relaxed)
        {
            self.paie_duration();
        }

        record.paie.start.store(0, Ordering::Relaxed);

        // a change of tid at the next IRQ disable means the switch happened
        record.dst.tid.store(self.task.tid, Ordering::Relaxed);

        self.set_start(&record.psd.start);
    }

    /// Preemption enabled on the way out of the scheduler: end of PSD and
    /// DST, and start of PAIE if a reschedule is already pending again.
    pub fn preempt_enable_sched(&self) {
        let record = self.record;

        let dst = &record.dst.window;
        if dst.is_open() {
            let duration = self.duration(&dst.start);
            self.report(Window::Dst, duration, &dst.max);
        }

        let psd = &record.psd;
        if psd.is_open() {
            let duration = self.duration(&psd.start);
            self.report(Window::Psd, duration, &psd.max);
        }

        if self.task.need_resched {
            self.set_start(&record.paie.start);
        }
    }

    pub fn nmi_entry(&self) {
        // NMIs are not preempted by anything this tracker handles
        self.record.nmi.start.store(self.clock.now(), Ordering::Relaxed);
    }

    pub fn nmi_exit(&self) {
        let record = self.record;
        let start = record.nmi.start.swap(0, Ordering::Relaxed);
        if start == 0 {
            return;
        }

        let duration = self.clock.now().wrapping_sub(start) as i64;
        self.sink.emit(Sample::NmiExecution(NmiExecution {
            cpu: self.cpu,
            start,
            duration,
        }));

        record.int_counter.fetch_add(1, Ordering::Release);

        if record.irq.is_open() {
            record.irq.start.fetch_add(duration as u64, Ordering::Relaxed);
        }
        record.poid.window.discount(duration);
        record.psd.discount(duration);
        record.dst.window.discount(duration);
        record.paie.discount(duration);
    }

    /// First identification of an interrupt: which vector (or irq number)
    /// is being serviced.
    pub fn irq_vector_entry(&self, vector: i32) {
        self.record.irq.vector.store(vector, Ordering::Relaxed);
        self.record.int_counter.fetch_add(1, Ordering::Release);
    }
}
