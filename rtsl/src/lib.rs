pub mod clock;
pub mod controller;
pub mod duration;
pub mod error;
pub mod hooks;
pub mod percpu;
pub mod registry;
pub mod report;
pub mod settings;
pub mod sink;
pub mod telemetry;
pub mod trace;
pub mod tracker;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::signal;

use crate::clock::TraceClock;
use crate::controller::Controller;
use crate::hooks::hook_table;
use crate::registry::{HookRegistry, MemoryRegistry, TracefsRegistry};
use crate::report::SessionReport;
use crate::settings::Settings;
use crate::sink::{FanoutSink, LogSink, SampleSink, TelemetrySink};
use crate::trace::ReplayStats;

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// Where hook events come from.
#[derive(Debug, Clone)]
pub enum TraceSource {
    /// A recorded ftrace text file.
    File(PathBuf),
    /// ftrace text on standard input.
    Stdin,
    /// The live tracefs `trace_pipe`.
    Live,
}

pub struct RtslEngine {
    pub settings: Settings,
    source: TraceSource,
}

impl RtslEngine {
    pub fn new(settings: Settings, source: TraceSource) -> Self {
        Self { settings, source }
    }

    /// Collect until the source is exhausted or Ctrl-C, then summarize.
    pub async fn run(self) -> Result<SessionReport> {
        let metrics = telemetry::init_metrics()?;
        let sink = self.build_sink(metrics);

        let report = match self.source.clone() {
            TraceSource::Live => {
                let registry = TracefsRegistry::discover()
                    .context("tracefs not mounted under /sys/kernel/tracing or /sys/kernel/debug/tracing")?;
                info!("Using tracefs at {}", registry.root().display());
                let pipe = registry.trace_pipe();
                self.session(registry, sink, move || {
                    let file = File::open(&pipe)
                        .with_context(|| format!("Failed to open {}", pipe.display()))?;
                    Ok(Box::new(BufReader::new(file)) as Box<dyn BufRead>)
                })
                .await?
            }
            TraceSource::File(path) => {
                self.session(MemoryRegistry::new(), sink, move || {
                    let file = File::open(&path)
                        .with_context(|| format!("Failed to open {}", path.display()))?;
                    Ok(Box::new(BufReader::new(file)) as Box<dyn BufRead>)
                })
                .await?
            }
            TraceSource::Stdin => {
                self.session(MemoryRegistry::new(), sink, || {
                    Ok(Box::new(std::io::stdin().lock()) as Box<dyn BufRead>)
                })
                .await?
            }
        };

        telemetry::shutdown_metrics();
        Ok(report)
    }

    fn build_sink(&self, metrics: bool) -> FanoutSink {
        let policy = self.settings.negative_durations();
        let mut sink = FanoutSink::new();
        if self.settings.log_samples() {
            sink = sink.with(LogSink::new(policy));
        }
        if metrics {
            sink = sink.with(TelemetrySink::new(policy));
        }
        sink
    }

    async fn session<R, F>(&self, registry: R, sink: FanoutSink, open: F) -> Result<SessionReport>
    where
        R: HookRegistry + 'static,
        F: FnOnce() -> Result<Box<dyn BufRead>> + Send + 'static,
    {
        let nr_cpus = self.settings.nr_cpus();
        let table = hook_table(self.settings.irq_source());
        let clock = Arc::new(TraceClock::new(0));
        let sink: Arc<dyn SampleSink> = Arc::new(sink);

        let controller = Arc::new(Controller::new(
            nr_cpus,
            registry,
            table,
            clock.clone(),
            sink,
        )?);

        telemetry::reset_maxima();
        controller
            .enable()
            .context("Failed to enable collection")?;

        let started = Instant::now();

        let reader = {
            let controller = controller.clone();
            let stop = shutdown_flag();
            tokio::task::spawn_blocking(move || -> Result<ReplayStats> {
                let input = open()?;
                let stats = trace::replay(input, &controller, &clock, || {
                    stop.load(Ordering::Relaxed)
                })?;
                Ok(stats)
            })
        };

        info!("Collecting on {} cores. Press Ctrl-C to exit.", nr_cpus);
        let stats = tokio::select! {
            res = reader => res.context("Reader task failed")??,
            _ = signal::ctrl_c() => {
                info!("Exiting...");
                request_shutdown();
                warn!("Interrupted: line counters are not available");
                ReplayStats::default()
            }
        };

        let cores = controller.snapshot();
        controller.disable();

        Ok(SessionReport::new(
            u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX),
            stats,
            cores,
        ))
    }
}
