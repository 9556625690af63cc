//! Reporting sinks.
//!
//! Sinks are called from the measurement hot path, possibly from nested
//! interrupt context on a live system, so `emit` must be short and must not
//! fail.

use std::sync::Mutex;

use log::{debug, info};
use rtsl_common::Sample;
use serde::Deserialize;

use crate::telemetry;

pub trait SampleSink: Send + Sync {
    fn emit(&self, sample: Sample);
}

/// What to do with a negative duration coming out of the capture engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegativePolicy {
    /// Report the raw signed value.
    #[default]
    Keep,
    /// Report zero.
    Clamp,
    /// Do not report the sample at all.
    Drop,
}

impl NegativePolicy {
    /// Returns the sample to report, or `None` if it must be dropped.
    pub fn apply(self, sample: Sample) -> Option<Sample> {
        if sample.duration() >= 0 {
            return Some(sample);
        }
        debug!(
            "{} cpu={} negative duration {}ns ({:?})",
            sample.name(),
            sample.cpu(),
            sample.duration(),
            self
        );
        match self {
            NegativePolicy::Keep => Some(sample),
            NegativePolicy::Clamp => Some(sample.with_duration(0)),
            NegativePolicy::Drop => None,
        }
    }
}

/// One `info!` line per sample.
pub struct LogSink {
    policy: NegativePolicy,
}

impl LogSink {
    pub fn new(policy: NegativePolicy) -> Self {
        Self { policy }
    }
}

impl SampleSink for LogSink {
    fn emit(&self, sample: Sample) {
        let Some(sample) = self.policy.apply(sample) else {
            return;
        };
        match sample {
            Sample::Window(s) | Sample::NewMax(s) => info!(
                "{} cpu={} duration={}ns",
                sample.name().to_ascii_uppercase(),
                s.cpu,
                s.duration
            ),
            Sample::IrqExecution(s) => info!(
                "IRQ cpu={} vector={} start={} duration={}ns",
                s.cpu, s.vector, s.start, s.duration
            ),
            Sample::NmiExecution(s) => info!(
                "NMI cpu={} start={} duration={}ns",
                s.cpu, s.start, s.duration
            ),
        }
    }
}

/// Forwards samples to the OpenTelemetry instruments.
pub struct TelemetrySink {
    policy: NegativePolicy,
}

impl TelemetrySink {
    pub fn new(policy: NegativePolicy) -> Self {
        Self { policy }
    }
}

impl SampleSink for TelemetrySink {
    fn emit(&self, sample: Sample) {
        // histograms are unsigned: whatever survives the policy is clamped
        let Some(sample) = self.policy.apply(sample) else {
            return;
        };
        let duration = sample.duration().max(0) as u64;
        match sample {
            Sample::Window(s) => telemetry::record_window_sample(s.window, s.cpu, duration),
            Sample::NewMax(s) => telemetry::record_new_max(s.window, s.cpu, duration),
            Sample::IrqExecution(s) => telemetry::record_irq_execution(s.vector, s.cpu, duration),
            Sample::NmiExecution(s) => telemetry::record_nmi_execution(s.cpu, duration),
        }
    }
}

/// Keeps every sample in memory.
#[derive(Default)]
pub struct MemorySink {
    samples: Mutex<Vec<Sample>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn take(&self) -> Vec<Sample> {
        std::mem::take(&mut *self.samples.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl SampleSink for MemorySink {
    fn emit(&self, sample: Sample) {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sample);
    }
}

/// Delivers every sample to each inner sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn SampleSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl SampleSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl SampleSink for FanoutSink {
    fn emit(&self, sample: Sample) {
        for sink in &self.sinks {
            sink.emit(sample);
        }
    }
}

impl<T: SampleSink + ?Sized> SampleSink for std::sync::Arc<T> {
    fn emit(&self, sample: Sample) {
        (**self).emit(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtsl_common::{Window, WindowSample};
    use std::sync::Arc;

    fn poid(duration: i64) -> Sample {
        Sample::Window(WindowSample {
            cpu: 1,
            window: Window::Poid,
            duration,
        })
    }

    #[test]
    fn test_policy_passes_non_negative() {
        for policy in [NegativePolicy::Keep, NegativePolicy::Clamp, NegativePolicy::Drop] {
            assert_eq!(policy.apply(poid(0)), Some(poid(0)));
            assert_eq!(policy.apply(poid(12)), Some(poid(12)));
        }
    }

    #[test]
    fn test_policy_negative() {
        assert_eq!(NegativePolicy::Keep.apply(poid(-5)), Some(poid(-5)));
        assert_eq!(NegativePolicy::Clamp.apply(poid(-5)), Some(poid(0)));
        assert_eq!(NegativePolicy::Drop.apply(poid(-5)), None);
    }

    #[test]
    fn test_fanout_delivers_to_all() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new().with(a.clone()).with(b.clone());
        assert_eq!(fanout.len(), 2);

        fanout.emit(poid(3));
        assert_eq!(a.samples(), vec![poid(3)]);
        assert_eq!(b.take(), vec![poid(3)]);
        assert!(b.samples().is_empty());
    }

    #[test]
    fn test_telemetry_sink_without_provider() {
        // no meter provider installed: must be a silent no-op
        let sink = TelemetrySink::new(NegativePolicy::Drop);
        sink.emit(poid(10));
        sink.emit(poid(-10));
    }
}
