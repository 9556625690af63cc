//! Collection controller.
//!
//! Owns the per-core table, the global enable flag and the hook set.
//! Enable and disable are serialized by one lock and always act on all
//! hooks and all cores together. The event path only reads the flag and the
//! armed bitmaps; it never takes the lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};
use rtsl_common::{Event, TaskContext};
use serde::Serialize;

use crate::clock::Clock;
use crate::error::{Result, RtslError};
use crate::hooks::{self, HookKind, HookSpec};
use crate::percpu::{CoreRecords, WindowMaxima};
use crate::registry::{HookRegistry, HookSet};
use crate::sink::SampleSink;
use crate::tracker::CoreContext;

/// State of one core at the end of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoreSnapshot {
    pub cpu: u32,
    pub running: bool,
    pub maxima: WindowMaxima,
}

pub struct Controller<R: HookRegistry> {
    enabled: AtomicBool,
    armed: [AtomicBool; HookKind::COUNT],
    hook_names: Box<[&'static str]>,
    hook_armed: Box<[AtomicBool]>,
    records: CoreRecords,
    hooks: Mutex<HookSet<R>>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn SampleSink>,
}

impl<R: HookRegistry> Controller<R> {
    pub fn new(
        nr_cpus: usize,
        registry: R,
        table: Vec<HookSpec>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn SampleSink>,
    ) -> Result<Self> {
        let records = CoreRecords::new(nr_cpus)?;
        let hook_names: Box<[&'static str]> = table.iter().map(|h| h.name).collect();
        let hook_armed = hook_names.iter().map(|_| AtomicBool::new(false)).collect();
        Ok(Self {
            enabled: AtomicBool::new(false),
            armed: std::array::from_fn(|_| AtomicBool::new(false)),
            hook_names,
            hook_armed,
            records,
            hooks: Mutex::new(HookSet::new(registry, table)),
            clock,
            sink,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HookSet<R>> {
        self.hooks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn nr_cpus(&self) -> usize {
        self.records.len()
    }

    /// Start (or restart from scratch) a collection session.
    pub fn enable(&self) -> Result<()> {
        let mut hooks = self.lock();
        if self.is_enabled() {
            self.disable_locked(&mut hooks);
        }
        self.enable_locked(&mut hooks)
    }

    /// Stop collecting. A no-op if already stopped.
    pub fn disable(&self) {
        let mut hooks = self.lock();
        if self.is_enabled() {
            self.disable_locked(&mut hooks);
        }
    }

    fn enable_locked(&self, hooks: &mut HookSet<R>) -> Result<()> {
        self.records.reset_all();

        hooks.register_all()?;
        self.sync_armed(hooks);

        self.enabled.store(true, Ordering::Release);
        info!("Collection enabled on {} cores", self.records.len());
        Ok(())
    }

    fn disable_locked(&self, hooks: &mut HookSet<R>) {
        self.enabled.store(false, Ordering::Release);

        self.records.stop_all();
        self.records.reset_all();

        hooks.unregister_all();
        self.sync_armed(hooks);
        info!("Collection disabled");
    }

    fn sync_armed(&self, hooks: &HookSet<R>) {
        for (flag, armed) in self.armed.iter().zip(hooks.armed_kinds()) {
            flag.store(armed, Ordering::Release);
        }
        for (flag, armed) in self.hook_armed.iter().zip(hooks.registered_flags()) {
            flag.store(armed, Ordering::Release);
        }
    }

    /// Text control surface: `"1"` (re)starts, `"0"` stops.
    ///
    /// Accepts 1 to 3 bytes and only looks at the first one, so `"1\n"` is
    /// fine. Returns the number of bytes consumed.
    pub fn write_control(&self, input: &[u8]) -> Result<usize> {
        if input.is_empty() || input.len() > 3 {
            return Err(RtslError::InvalidArgument(format!(
                "expected 1 to 3 bytes, got {}",
                input.len()
            )));
        }

        match input[0] {
            b'1' => self.enable()?,
            b'0' => self.disable(),
            other => {
                return Err(RtslError::InvalidArgument(format!(
                    "unexpected control value {:?}",
                    other as char
                )));
            }
        }
        Ok(input.len())
    }

    pub fn read_control(&self) -> String {
        let _hooks = self.lock();
        format!("{:x}\n", self.is_enabled() as u8)
    }

    /// Hot path: deliver one event fired on `cpu`.
    ///
    /// Events of a kind with no registered hook, or for an unknown core,
    /// are dropped. Returns whether the event was dispatched.
    pub fn handle(&self, cpu: u32, task: TaskContext, event: &Event) -> bool {
        if !self.armed[HookKind::of(event).index()].load(Ordering::Acquire) {
            return false;
        }
        let Some(record) = self.records.get(cpu) else {
            debug!("event for unknown cpu {}", cpu);
            return false;
        };

        let ctx = CoreContext {
            cpu,
            record,
            clock: self.clock.as_ref(),
            sink: self.sink.as_ref(),
            task,
            enabled: self.is_enabled(),
        };
        hooks::dispatch(&ctx, event);
        true
    }

    /// Like [`Controller::handle`], for an event delivered by the named hook.
    /// Sources that see every hook (trace replay) use this to drop events of
    /// hooks that are not registered.
    pub fn handle_hook(&self, hook: &str, cpu: u32, task: TaskContext, event: &Event) -> bool {
        self.is_hook_registered(hook) && self.handle(cpu, task, event)
    }

    pub fn is_hook_registered(&self, name: &str) -> bool {
        self.hook_names
            .iter()
            .zip(self.hook_armed.iter())
            .any(|(hook, armed)| *hook == name && armed.load(Ordering::Acquire))
    }

    pub fn is_running(&self, cpu: u32) -> bool {
        self.records.get(cpu).is_some_and(|r| r.is_running())
    }

    pub fn maxima(&self, cpu: u32) -> Option<WindowMaxima> {
        self.records.get(cpu).map(|r| r.maxima())
    }

    pub fn snapshot(&self) -> Vec<CoreSnapshot> {
        self.records
            .iter()
            .enumerate()
            .map(|(cpu, record)| CoreSnapshot {
                cpu: cpu as u32,
                running: record.is_running(),
                maxima: record.maxima(),
            })
            .collect()
    }

    /// Access to the registry, under the control lock.
    pub fn with_registry<T>(&self, f: impl FnOnce(&R) -> T) -> T {
        f(self.lock().registry())
    }
}

impl<R: HookRegistry> Drop for Controller<R> {
    fn drop(&mut self) {
        if self.is_enabled() {
            self.disable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TraceClock;
    use crate::hooks::{IrqSource, hook_table};
    use crate::registry::MemoryRegistry;
    use crate::sink::MemorySink;
    use rtsl_common::{Origin, Sample, Window};

    struct Fixture {
        controller: Controller<MemoryRegistry>,
        clock: Arc<TraceClock>,
        sink: Arc<MemorySink>,
    }

    fn fixture_with(registry: MemoryRegistry, table: Vec<HookSpec>) -> Fixture {
        let clock = Arc::new(TraceClock::new(1_000));
        let sink = Arc::new(MemorySink::new());
        let controller =
            Controller::new(2, registry, table, clock.clone(), sink.clone()).unwrap();
        Fixture {
            controller,
            clock,
            sink,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryRegistry::new(), hook_table(IrqSource::Handler))
    }

    fn task() -> TaskContext {
        TaskContext {
            tid: 42,
            ..Default::default()
        }
    }

    fn sched(to_schedule: bool, disable: bool) -> Event {
        let origin = Origin::default();
        if disable {
            Event::PreemptDisable {
                origin,
                to_schedule,
            }
        } else {
            Event::PreemptEnable {
                origin,
                to_schedule,
            }
        }
    }

    impl Fixture {
        fn at(&self, offset: u64) -> &Controller<MemoryRegistry> {
            self.clock.set(1_000 + offset);
            &self.controller
        }

        fn psd(&self, cpu: u32, from: u64, to: u64) {
            self.at(from).handle(cpu, task(), &sched(true, true));
            self.at(to).handle(cpu, task(), &sched(true, false));
        }
    }

    #[test]
    fn test_starts_disabled() {
        let f = fixture();
        assert!(!f.controller.is_enabled());
        assert_eq!(f.controller.read_control(), "0\n");
        assert_eq!(f.controller.nr_cpus(), 2);
    }

    #[test]
    fn test_events_ignored_while_disabled() {
        let f = fixture();
        f.psd(0, 0, 8);
        assert!(f.sink.samples().is_empty());
        assert!(!f.controller.is_running(0));
    }

    #[test]
    fn test_enable_and_measure() {
        let f = fixture();
        f.controller.enable().unwrap();
        assert_eq!(f.controller.read_control(), "1\n");
        assert!(f.controller.is_hook_registered("preempt_disable"));

        f.psd(1, 0, 8);
        assert!(f.controller.is_running(1));
        assert!(!f.controller.is_running(0));
        assert_eq!(f.controller.maxima(1).unwrap().psd, 8);
        assert_eq!(
            f.sink.samples()[0],
            Sample::Window(rtsl_common::WindowSample {
                cpu: 1,
                window: Window::Psd,
                duration: 8,
            })
        );
    }

    #[test]
    fn test_core_waits_for_irqs_enabled() {
        let f = fixture();
        f.controller.enable().unwrap();

        let masked = TaskContext {
            irqs_disabled: true,
            ..task()
        };
        f.at(0).handle(0, masked, &sched(true, true));
        assert!(!f.controller.is_running(0));

        f.psd(0, 10, 15);
        assert!(f.controller.is_running(0));
        assert_eq!(f.controller.maxima(0).unwrap().psd, 5);
    }

    #[test]
    fn test_reenable_resets_state() {
        let f = fixture();
        f.controller.enable().unwrap();
        f.psd(0, 0, 30);
        assert_eq!(f.controller.maxima(0).unwrap().psd, 30);

        f.controller.enable().unwrap();
        assert!(f.controller.is_enabled());
        assert_eq!(f.controller.maxima(0).unwrap(), WindowMaxima::default());
        assert!(!f.controller.is_running(0));

        // a smaller window is a new maximum again
        f.sink.take();
        f.psd(0, 40, 50);
        assert_eq!(f.controller.maxima(0).unwrap().psd, 10);
        assert!(f.sink.samples().iter().any(|s| matches!(s, Sample::NewMax(_))));
    }

    #[test]
    fn test_disable_is_idempotent() {
        let f = fixture();
        f.controller.disable();
        assert!(!f.controller.is_enabled());

        f.controller.enable().unwrap();
        f.psd(0, 0, 5);
        f.controller.disable();
        f.controller.disable();
        assert!(!f.controller.is_enabled());
        assert_eq!(f.controller.with_registry(|r| r.registered_len()), 0);
        assert_eq!(f.controller.maxima(0).unwrap(), WindowMaxima::default());
        assert!(!f.controller.is_running(0));
    }

    #[test]
    fn test_enable_fails_as_a_unit() {
        let table: Vec<HookSpec> = hook_table(IrqSource::Handler).into_iter().take(5).collect();
        let fourth = table[3].name;
        let f = fixture_with(MemoryRegistry::new().without(fourth), table);

        let err = f.controller.enable().unwrap_err();
        assert!(matches!(err, RtslError::InvalidConfiguration(_)));
        assert!(!f.controller.is_enabled());
        assert_eq!(f.controller.with_registry(|r| r.registered_len()), 0);
        assert_eq!(f.controller.read_control(), "0\n");
    }

    #[test]
    fn test_unregistered_kind_not_dispatched() {
        // only scheduler hooks: NMI exits must not be seen
        let table: Vec<HookSpec> = hook_table(IrqSource::Handler)
            .into_iter()
            .filter(|h| h.name.starts_with("preempt_"))
            .collect();
        let f = fixture_with(MemoryRegistry::new(), table);
        f.controller.enable().unwrap();

        f.at(0).handle(0, task(), &sched(true, true));
        f.at(1).handle(0, task(), &Event::NmiEntry);
        f.at(4).handle(0, task(), &Event::NmiExit);
        f.at(10).handle(0, task(), &sched(true, false));

        assert_eq!(f.controller.maxima(0).unwrap().psd, 10);
        assert!(
            !f.sink
                .samples()
                .iter()
                .any(|s| matches!(s, Sample::NmiExecution(_)))
        );
    }

    #[test]
    fn test_control_writes() {
        let f = fixture();
        assert_eq!(f.controller.write_control(b"1").unwrap(), 1);
        assert!(f.controller.is_enabled());
        assert_eq!(f.controller.write_control(b"1\n").unwrap(), 2);
        assert!(f.controller.is_enabled());
        assert_eq!(f.controller.write_control(b"0\n").unwrap(), 2);
        assert!(!f.controller.is_enabled());
        assert_eq!(f.controller.write_control(b"0").unwrap(), 1);
        assert!(!f.controller.is_enabled());
    }

    #[test]
    fn test_control_rejects_invalid_input() {
        let f = fixture();
        f.controller.write_control(b"1").unwrap();

        let err = f.controller.write_control(b"2").unwrap_err();
        assert!(matches!(err, RtslError::InvalidArgument(_)));
        assert!(f.controller.is_enabled());
        assert_eq!(f.controller.read_control(), "1\n");

        assert!(f.controller.write_control(b"").is_err());
        assert!(f.controller.write_control(b"1111").is_err());
        assert_eq!(f.controller.read_control(), "1\n");
    }

    #[test]
    fn test_snapshot() {
        let f = fixture();
        f.controller.enable().unwrap();
        f.psd(1, 0, 3);

        let snapshot = f.controller.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(!snapshot[0].running);
        assert!(snapshot[1].running);
        assert_eq!(snapshot[1].maxima.psd, 3);
    }

    #[test]
    fn test_unknown_cpu_ignored() {
        let f = fixture();
        f.controller.enable().unwrap();
        f.psd(7, 0, 3);
        assert!(f.sink.samples().is_empty());
    }

    #[test]
    fn test_handle_reports_dispatch() {
        let f = fixture();
        let vector = Event::IrqVectorEntry { vector: 34 };
        assert!(!f.controller.handle(0, task(), &sched(true, true)));
        assert!(!f.controller.handle_hook("local_timer_entry", 0, task(), &vector));

        f.controller.enable().unwrap();
        assert!(f.controller.handle(0, task(), &sched(true, true)));
        assert!(!f.controller.handle(7, task(), &sched(true, true)));
        assert!(f.controller.handle_hook("local_timer_entry", 0, task(), &vector));
        // same kind as the timer hook, but only in the vector table
        assert!(!f.controller.is_hook_registered("external_interrupt_entry"));
        assert!(!f.controller.handle_hook("external_interrupt_entry", 0, task(), &vector));

        f.controller.disable();
        assert!(!f.controller.is_hook_registered("local_timer_entry"));
        assert!(!f.controller.handle_hook("local_timer_entry", 0, task(), &vector));
    }

    #[test]
    fn test_concurrent_control_is_serialized() {
        let f = fixture();
        let controller = &f.controller;
        std::thread::scope(|s| {
            for i in 0..8 {
                s.spawn(move || {
                    let value: &[u8] = if i % 2 == 0 { b"1" } else { b"0" };
                    controller.write_control(value).unwrap();
                });
            }
        });

        // whatever the final state, registration matches it exactly
        let registered = controller.with_registry(|r| r.registered_len());
        if controller.is_enabled() {
            assert_eq!(registered, 18);
        } else {
            assert_eq!(registered, 0);
        }
    }
}
