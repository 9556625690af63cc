#![no_std]

//! Types shared between hook sources and the rtsl latency analyzer.
//!
//! Everything here is plain `Copy` data so it can be produced from any
//! execution context (tracepoint callback, trace replay, test harness)
//! without allocation.

/// Latency windows tracked per core.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
#[cfg_attr(feature = "user", serde(rename_all = "lowercase"))]
pub enum Window {
    /// Preemption or IRQ disabled by a thread.
    Poid = 0,
    /// Preemption and IRQ enabled with a reschedule pending.
    Paie = 1,
    /// Preemption disabled to schedule.
    Psd = 2,
    /// Scheduler tail delay after a context switch.
    Dst = 3,
}

impl Window {
    pub const ALL: [Window; 4] = [Window::Poid, Window::Paie, Window::Psd, Window::Dst];

    pub fn name(self) -> &'static str {
        match self {
            Window::Poid => "poid",
            Window::Paie => "paie",
            Window::Psd => "psd",
            Window::Dst => "dst",
        }
    }

    /// Name of the distinguished sample emitted when the running maximum grows.
    pub fn max_name(self) -> &'static str {
        match self {
            Window::Poid => "max_poid",
            Window::Paie => "max_paie",
            Window::Psd => "max_psd",
            Window::Dst => "max_dst",
        }
    }
}

/// Snapshot of the execution environment at the instant a hook fired.
///
/// The analyzer never looks these facts up itself; whoever delivers the
/// event is responsible for filling them in.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
pub struct TaskContext {
    /// Thread id of the task running on the core.
    pub tid: u32,
    /// The running context is the idle task.
    pub idle: bool,
    /// Interrupts are masked on the core.
    pub irqs_disabled: bool,
    /// A (non-lazy) reschedule has been requested.
    pub need_resched: bool,
}

/// Instruction pointers reported by the preempt/irq toggle hooks.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
pub struct Origin {
    pub ip: u64,
    pub parent_ip: u64,
}

/// Hook payloads, one variant per event source kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
pub enum Event {
    IrqDisable { origin: Origin, irq_entry: bool },
    IrqEnable { origin: Origin, irq_exit: bool },
    PreemptDisable { origin: Origin, to_schedule: bool },
    PreemptEnable { origin: Origin, to_schedule: bool },
    NmiEntry,
    NmiExit,
    /// Entry of a vectored (APIC) interrupt handler.
    IrqVectorEntry { vector: i32 },
    /// Entry of a generic irq handler, identified by irq number.
    IrqHandlerEntry { irq: i32 },
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
pub struct WindowSample {
    pub cpu: u32,
    pub window: Window,
    /// Signed: a negative value is a capture race, see the duration engine.
    pub duration: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
pub struct IrqExecution {
    pub cpu: u32,
    pub vector: i32,
    /// Arrival time of the interrupt.
    pub start: u64,
    pub duration: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
pub struct NmiExecution {
    pub cpu: u32,
    pub start: u64,
    pub duration: i64,
}

/// Everything the analyzer reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
#[cfg_attr(feature = "user", serde(tag = "kind", rename_all = "snake_case"))]
pub enum Sample {
    Window(WindowSample),
    NewMax(WindowSample),
    IrqExecution(IrqExecution),
    NmiExecution(NmiExecution),
}

impl Sample {
    pub fn cpu(&self) -> u32 {
        match self {
            Sample::Window(s) | Sample::NewMax(s) => s.cpu,
            Sample::IrqExecution(s) => s.cpu,
            Sample::NmiExecution(s) => s.cpu,
        }
    }

    pub fn duration(&self) -> i64 {
        match self {
            Sample::Window(s) | Sample::NewMax(s) => s.duration,
            Sample::IrqExecution(s) => s.duration,
            Sample::NmiExecution(s) => s.duration,
        }
    }

    /// Trace event name of the sample (`poid`, `max_psd`, `irq_execution`, ...).
    pub fn name(&self) -> &'static str {
        match self {
            Sample::Window(s) => s.window.name(),
            Sample::NewMax(s) => s.window.max_name(),
            Sample::IrqExecution(_) => "irq_execution",
            Sample::NmiExecution(_) => "nmi_execution",
        }
    }

    /// Copy of the sample with its duration replaced.
    pub fn with_duration(mut self, duration: i64) -> Self {
        match &mut self {
            Sample::Window(s) | Sample::NewMax(s) => s.duration = duration,
            Sample::IrqExecution(s) => s.duration = duration,
            Sample::NmiExecution(s) => s.duration = duration,
        }
        self
    }
}
