//! Hook table and event dispatcher.
//!
//! Every hook the analyzer listens to is known at compile time. The table
//! maps its name (as the hook source knows it) to a tracefs category and to
//! the kind of handler that serves it; `dispatch` routes a payload to the
//! tracker handler for its sub-kind.

use rtsl_common::Event;
use serde::Deserialize;

use crate::tracker::CoreContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    NmiEntry,
    NmiExit,
    IrqDisable,
    IrqEnable,
    IrqVectorEntry,
    IrqHandlerEntry,
    PreemptDisable,
    PreemptEnable,
}

impl HookKind {
    pub const COUNT: usize = 8;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn of(event: &Event) -> HookKind {
        match event {
            Event::IrqDisable { .. } => HookKind::IrqDisable,
            Event::IrqEnable { .. } => HookKind::IrqEnable,
            Event::PreemptDisable { .. } => HookKind::PreemptDisable,
            Event::PreemptEnable { .. } => HookKind::PreemptEnable,
            Event::NmiEntry => HookKind::NmiEntry,
            Event::NmiExit => HookKind::NmiExit,
            Event::IrqVectorEntry { .. } => HookKind::IrqVectorEntry,
            Event::IrqHandlerEntry { .. } => HookKind::IrqHandlerEntry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookSpec {
    pub name: &'static str,
    pub category: &'static str,
    pub kind: HookKind,
}

const fn hook(category: &'static str, name: &'static str, kind: HookKind) -> HookSpec {
    HookSpec {
        name,
        category,
        kind,
    }
}

/// How device interrupts are identified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IrqSource {
    /// Architectures with a vectored external interrupt entry hook.
    Vector,
    /// The generic irq_handler_entry hook, keyed by irq number.
    #[default]
    Handler,
}

const COMMON_HOOKS: [HookSpec; 17] = [
    hook("nmi", "nmi_entry", HookKind::NmiEntry),
    hook("nmi", "nmi_exit", HookKind::NmiExit),
    hook("preemptirq", "irq_disable", HookKind::IrqDisable),
    hook("preemptirq", "irq_enable", HookKind::IrqEnable),
    hook("irq_vectors", "local_timer_entry", HookKind::IrqVectorEntry),
    hook("irq_vectors", "thermal_apic_entry", HookKind::IrqVectorEntry),
    hook("irq_vectors", "deferred_error_apic_entry", HookKind::IrqVectorEntry),
    hook("irq_vectors", "threshold_apic_entry", HookKind::IrqVectorEntry),
    hook("irq_vectors", "call_function_single_entry", HookKind::IrqVectorEntry),
    hook("irq_vectors", "call_function_entry", HookKind::IrqVectorEntry),
    hook("irq_vectors", "reschedule_entry", HookKind::IrqVectorEntry),
    hook("irq_vectors", "irq_work_entry", HookKind::IrqVectorEntry),
    hook("irq_vectors", "x86_platform_ipi_entry", HookKind::IrqVectorEntry),
    hook("irq_vectors", "error_apic_entry", HookKind::IrqVectorEntry),
    hook("irq_vectors", "spurious_apic_entry", HookKind::IrqVectorEntry),
    hook("preemptirq", "preempt_disable", HookKind::PreemptDisable),
    hook("preemptirq", "preempt_enable", HookKind::PreemptEnable),
];

const EXTERNAL_INTERRUPT: HookSpec = hook(
    "irq_vectors",
    "external_interrupt_entry",
    HookKind::IrqVectorEntry,
);
const IRQ_HANDLER: HookSpec = hook("irq", "irq_handler_entry", HookKind::IrqHandlerEntry);

/// The full hook list for the given interrupt identification scheme, in
/// registration order.
pub fn hook_table(irq_source: IrqSource) -> Vec<HookSpec> {
    let mut table = COMMON_HOOKS.to_vec();
    let device = match irq_source {
        IrqSource::Vector => EXTERNAL_INTERRUPT,
        IrqSource::Handler => IRQ_HANDLER,
    };
    // device interrupts sit right after the local timer
    table.insert(5, device);
    table
}

/// Look up a hook by name in either variant of the table.
pub fn find_hook(name: &str) -> Option<HookSpec> {
    COMMON_HOOKS
        .iter()
        .chain([EXTERNAL_INTERRUPT, IRQ_HANDLER].iter())
        .find(|h| h.name == name)
        .copied()
}

/// Route one event to its handler.
///
/// Apart from the scheduler entry, which is where a core reaches its
/// initial condition, nothing is done before the core is running.
pub fn dispatch(ctx: &CoreContext<'_>, event: &Event) {
    if let Event::PreemptDisable {
        to_schedule: true, ..
    } = event
    {
        ctx.preempt_disable_sched();
        return;
    }

    if !ctx.record.is_running() {
        return;
    }

    match *event {
        Event::IrqDisable { irq_entry, .. } => {
            if irq_entry {
                ctx.irq_disable_irq();
            } else {
                ctx.irq_disable_normal();
            }
        }
        Event::IrqEnable { irq_exit, .. } => {
            if irq_exit {
                ctx.irq_enable_irq();
            } else {
                ctx.irq_enable_normal();
            }
        }
        Event::PreemptDisable { .. } => ctx.preempt_disable_nosched(),
        Event::PreemptEnable { to_schedule, .. } => {
            if to_schedule {
                ctx.preempt_enable_sched();
            } else {
                ctx.preempt_enable_nosched();
            }
        }
        Event::NmiEntry => ctx.nmi_entry(),
        Event::NmiExit => ctx.nmi_exit(),
        Event::IrqVectorEntry { vector } => ctx.irq_vector_entry(vector),
        Event::IrqHandlerEntry { irq } => ctx.irq_vector_entry(irq),
    }
}
