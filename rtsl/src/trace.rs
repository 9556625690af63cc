//! ftrace text format.
//!
//! Turns lines as printed by `trace` / `trace_pipe`:
//!
//! ```text
//!   kworker/1:2-117   [001] dN.1.  2411.000105: preempt_disable: to_sched=1
//! ```
//!
//! into hook events, and replays a stream of them through a [`Controller`].

use std::io::BufRead;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use rtsl_common::{Event, Origin, TaskContext};
use serde::Serialize;

use crate::clock::TraceClock;
use crate::controller::Controller;
use crate::error::{Result, RtslError};
use crate::hooks::{HookKind, HookSpec, find_hook};
use crate::registry::HookRegistry;

static LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?P<comm>.+?)-(?P<pid>\d+)\s+(?:\(\s*[-\d]+\)\s+)?\[(?P<cpu>\d+)\]\s+(?:(?P<flags>\S+)\s+)?(?P<secs>\d+)\.(?P<frac>\d+):\s+(?P<event>\w+):\s*(?P<args>.*)$",
    )
    .expect("trace line pattern is valid")
});

/// One trace line resolved to a hook event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub cpu: u32,
    pub ts_ns: u64,
    pub comm: String,
    pub task: TaskContext,
    pub hook: HookSpec,
    pub event: Event,
}

/// Parse one line.
///
/// Blank lines, `#` header lines and events that are not analyzer hooks
/// yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<TraceRecord>> {
    let trimmed = line.trim_end();
    if trimmed.trim_start().is_empty() || trimmed.trim_start().starts_with('#') {
        return Ok(None);
    }

    let caps = LINE_RE
        .captures(trimmed)
        .ok_or_else(|| RtslError::Parse(trimmed.to_string()))?;

    let Some(hook) = find_hook(&caps["event"]) else {
        return Ok(None);
    };

    let pid: u32 = parse_num(&caps["pid"], trimmed)?;
    let cpu: u32 = parse_num(&caps["cpu"], trimmed)?;
    let ts_ns = timestamp_ns(&caps["secs"], &caps["frac"], trimmed)?;
    let task = task_context(pid, caps.name("flags").map_or("", |m| m.as_str()));
    let event = build_event(hook.kind, &Args::parse(&caps["args"]), trimmed)?;

    Ok(Some(TraceRecord {
        cpu,
        ts_ns,
        comm: caps["comm"].to_string(),
        task,
        hook,
        event,
    }))
}

fn parse_num<T: std::str::FromStr>(s: &str, line: &str) -> Result<T> {
    s.parse()
        .map_err(|_| RtslError::Parse(format!("bad number '{}' in: {}", s, line)))
}

/// `secs.frac` to nanoseconds; `frac` is microseconds or nanoseconds
/// depending on the trace clock, so it is scaled by its width.
fn timestamp_ns(secs: &str, frac: &str, line: &str) -> Result<u64> {
    if frac.len() > 9 {
        return Err(RtslError::Parse(format!("bad timestamp in: {}", line)));
    }
    let scale = 10u64.pow(9 - frac.len() as u32);
    let secs: u64 = parse_num(secs, line)?;
    let frac: u64 = parse_num(frac, line)?;
    secs.checked_mul(1_000_000_000)
        .and_then(|ns| ns.checked_add(frac * scale))
        .ok_or_else(|| RtslError::Parse(format!("timestamp out of range in: {}", line)))
}

fn task_context(pid: u32, flags: &str) -> TaskContext {
    let mut chars = flags.chars();
    let irqs_off = chars.next();
    let resched = chars.next();
    TaskContext {
        tid: pid,
        idle: pid == 0,
        irqs_disabled: matches!(irqs_off, Some('d' | 'D')),
        need_resched: matches!(resched, Some('N' | 'n' | 'B' | 'b')),
    }
}

struct Args<'a> {
    pairs: Vec<(&'a str, &'a str)>,
}

impl<'a> Args<'a> {
    fn parse(args: &'a str) -> Self {
        let pairs = args
            .split_whitespace()
            .filter_map(|kv| kv.split_once('='))
            .collect();
        Self { pairs }
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some("1" | "true" | "y" | "Y"))
    }

    fn hex(&self, key: &str) -> u64 {
        self.get(key)
            .and_then(|v| u64::from_str_radix(v.trim_start_matches("0x"), 16).ok())
            .unwrap_or(0)
    }

    fn int(&self, key: &str, line: &str) -> Result<i32> {
        let value = self
            .get(key)
            .ok_or_else(|| RtslError::Parse(format!("missing '{}' in: {}", key, line)))?;
        parse_num(value, line)
    }
}

fn build_event(kind: HookKind, args: &Args<'_>, line: &str) -> Result<Event> {
    let origin = Origin {
        ip: args.hex("caller"),
        parent_ip: args.hex("parent"),
    };
    let event = match kind {
        HookKind::NmiEntry => Event::NmiEntry,
        HookKind::NmiExit => Event::NmiExit,
        HookKind::IrqDisable => Event::IrqDisable {
            origin,
            irq_entry: args.flag("irq_entry"),
        },
        HookKind::IrqEnable => Event::IrqEnable {
            origin,
            irq_exit: args.flag("irq_exit"),
        },
        HookKind::PreemptDisable => Event::PreemptDisable {
            origin,
            to_schedule: args.flag("to_sched"),
        },
        HookKind::PreemptEnable => Event::PreemptEnable {
            origin,
            to_schedule: args.flag("to_sched"),
        },
        HookKind::IrqVectorEntry => Event::IrqVectorEntry {
            vector: args.int("vector", line)?,
        },
        HookKind::IrqHandlerEntry => Event::IrqHandlerEntry {
            irq: args.int("irq", line)?,
        },
    };
    Ok(event)
}

/// Counters of one replay run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub lines: u64,
    pub events: u64,
    pub skipped: u64,
    pub malformed: u64,
}

/// Feed every line of `reader` to the controller, in order.
///
/// The clock is set to each line's timestamp before its event is handled.
/// Events whose hook is not currently registered, or that name an unknown
/// cpu, are skipped. Malformed lines are counted apart. Stops early when `should_stop` returns true.
pub fn replay<R, B>(
    reader: B,
    controller: &Controller<R>,
    clock: &TraceClock,
    should_stop: impl Fn() -> bool,
) -> Result<ReplayStats>
where
    R: HookRegistry,
    B: BufRead,
{
    let mut stats = ReplayStats::default();

    for line in reader.lines() {
        if should_stop() {
            info!("Replay interrupted after {} lines", stats.lines);
            break;
        }
        let line = line?;
        stats.lines += 1;

        let record = match parse_line(&line) {
            Ok(Some(record)) => record,
            Ok(None) => {
                stats.skipped += 1;
                continue;
            }
            Err(e) => {
                warn!("Skipping line {}: {}", stats.lines, e);
                stats.malformed += 1;
                continue;
            }
        };

        clock.set(record.ts_ns);
        if controller.handle_hook(record.hook.name, record.cpu, record.task, &record.event) {
            stats.events += 1;
        } else {
            debug!(
                "{} from {}-{} on cpu {} not dispatched",
                record.hook.name, record.comm, record.task.tid, record.cpu
            );
            stats.skipped += 1;
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> TraceRecord {
        parse_line(line).unwrap().unwrap()
    }

    #[test]
    fn test_parse_preempt_disable() {
        let r = parse("  kworker/1:2-117   [001] dN.1.  2411.000105: preempt_disable: to_sched=1");
        assert_eq!(r.cpu, 1);
        assert_eq!(r.ts_ns, 2_411_000_105_000);
        assert_eq!(r.comm, "kworker/1:2");
        assert_eq!(r.hook.name, "preempt_disable");
        assert_eq!(
            r.task,
            TaskContext {
                tid: 117,
                idle: false,
                irqs_disabled: true,
                need_resched: true,
            }
        );
        assert_eq!(
            r.event,
            Event::PreemptDisable {
                origin: Origin::default(),
                to_schedule: true,
            }
        );
    }

    #[test]
    fn test_parse_nanosecond_timestamp() {
        let r = parse("bash-1 [000] .... 5.000000042: nmi_entry:");
        assert_eq!(r.ts_ns, 5_000_000_042);
        assert_eq!(r.event, Event::NmiEntry);
    }

    #[test]
    fn test_parse_idle_and_flags() {
        let r = parse("<idle>-0 [003] ..... 10.000010: irq_enable: irq_exit=1");
        assert!(r.task.idle);
        assert!(!r.task.irqs_disabled);
        assert!(!r.task.need_resched);
        assert_eq!(
            r.event,
            Event::IrqEnable {
                origin: Origin::default(),
                irq_exit: true,
            }
        );
    }

    #[test]
    fn test_parse_lowercase_need_resched() {
        // lazy (n) and folded (b) reschedule flags count as pending
        let r = parse("sh-42 [000] .n... 1.000001: preempt_enable:");
        assert!(r.task.need_resched);
        let r = parse("sh-42 [000] .b... 1.000001: preempt_enable:");
        assert!(r.task.need_resched);
        let r = parse("sh-42 [000] dB.1. 1.000001: preempt_enable:");
        assert!(r.task.need_resched);
        let r = parse("sh-42 [000] ..... 1.000001: preempt_enable:");
        assert!(!r.task.need_resched);
    }

    #[test]
    fn test_parse_origin() {
        let r = parse(
            "sh-42 [000] d.... 1.000001: irq_disable: caller=0xffffffff8100 parent=0x10",
        );
        assert_eq!(
            r.event,
            Event::IrqDisable {
                origin: Origin {
                    ip: 0xffff_ffff_8100,
                    parent_ip: 0x10,
                },
                irq_entry: false,
            }
        );
    }

    #[test]
    fn test_parse_interrupt_entries() {
        let r = parse("sh-42 [000] d.h1. 1.000001: local_timer_entry: vector=236");
        assert_eq!(r.event, Event::IrqVectorEntry { vector: 236 });

        let r = parse("sh-42 [000] d.h1. 1.000001: irq_handler_entry: irq=24 name=eth0");
        assert_eq!(r.event, Event::IrqHandlerEntry { irq: 24 });
        assert_eq!(r.hook.category, "irq");
    }

    #[test]
    fn test_parse_comm_with_dash_and_tgid() {
        let r = parse("ksoftirqd-0-15 (   15) [002] ..s1. 3.000001: preempt_enable:");
        assert_eq!(r.comm, "ksoftirqd-0");
        assert_eq!(r.task.tid, 15);
        assert_eq!(r.cpu, 2);
    }

    #[test]
    fn test_skips_headers_and_foreign_events() {
        assert!(parse_line("# tracer: nop").unwrap().is_none());
        assert!(parse_line("").unwrap().is_none());
        assert!(
            parse_line("sh-42 [000] d.... 1.000001: sched_switch: prev_comm=sh")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            parse_line("not a trace line"),
            Err(RtslError::Parse(_))
        ));
        // vector entries need their vector
        assert!(parse_line("sh-42 [000] d.h1. 1.000001: local_timer_entry:").is_err());
        assert!(parse_line("sh-42 [000] d.h1. 1.000001: irq_handler_entry: irq=x").is_err());
    }
}
