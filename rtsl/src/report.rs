//! End-of-session summary.

use std::fmt::Write as _;

use serde::Serialize;

use crate::controller::CoreSnapshot;
use crate::trace::ReplayStats;

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub elapsed_ns: u64,
    pub stats: ReplayStats,
    pub cores: Vec<CoreSnapshot>,
}

impl SessionReport {
    pub fn new(elapsed_ns: u64, stats: ReplayStats, cores: Vec<CoreSnapshot>) -> Self {
        Self {
            elapsed_ns,
            stats,
            cores,
        }
    }

    /// Cores that reached their initial condition during the session.
    fn running_cores(&self) -> impl Iterator<Item = &CoreSnapshot> {
        self.cores.iter().filter(|c| c.running)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Plain text table of the per-core maxima, in nanoseconds.
    pub fn to_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:>4} {:>8} {:>12} {:>12} {:>12} {:>12}",
            "CPU", "RUNNING", "MAX_POID", "MAX_PAIE", "MAX_PSD", "MAX_DST"
        );
        for core in &self.cores {
            let _ = writeln!(
                out,
                "{:>4} {:>8} {:>12} {:>12} {:>12} {:>12}",
                core.cpu,
                if core.running { "yes" } else { "no" },
                core.maxima.poid,
                core.maxima.paie,
                core.maxima.psd,
                core.maxima.dst
            );
        }
        let _ = writeln!(
            out,
            "\n{} of {} cores running",
            self.running_cores().count(),
            self.cores.len()
        );
        let _ = writeln!(
            out,
            "{} lines, {} events, {} skipped, {} malformed in {:.3}s",
            self.stats.lines,
            self.stats.events,
            self.stats.skipped,
            self.stats.malformed,
            self.elapsed_ns as f64 / 1e9
        );
        out
    }
}
