//! OpenTelemetry metrics export module
//!
//! Exports latency samples produced by the analyzer to an OpenTelemetry
//! Collector. Nothing is exported unless `OTEL_EXPORTER_OTLP_ENDPOINT` is set;
//! until then every `record_*` helper is a no-op.

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use rtsl_common::Window;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 10;

/// Global metrics handle
static METRICS: OnceLock<LatencyMetrics> = OnceLock::new();

/// Global MeterProvider for graceful shutdown
static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Current maxima per (window, cpu), read by the ObservableGauge callback
static MAXIMA: OnceLock<RwLock<HashMap<(Window, u32), u64>>> = OnceLock::new();

fn maxima_map() -> &'static RwLock<HashMap<(Window, u32), u64>> {
    MAXIMA.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Latency analyzer metrics
///
/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct LatencyMetrics {
    pub window_duration_ns: Histogram<u64>,
    pub irq_execution_ns: Histogram<u64>,
    pub nmi_execution_ns: Histogram<u64>,
    pub new_max_events: Counter<u64>,
}

impl LatencyMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            window_duration_ns: meter
                .u64_histogram("window_duration_ns")
                .with_description("Duration of closed latency windows")
                .with_unit("ns")
                .build(),
            irq_execution_ns: meter
                .u64_histogram("irq_execution_ns")
                .with_description("Interrupt handler execution time")
                .with_unit("ns")
                .build(),
            nmi_execution_ns: meter
                .u64_histogram("nmi_execution_ns")
                .with_description("NMI handler execution time")
                .with_unit("ns")
                .build(),
            new_max_events: meter
                .u64_counter("new_max_events")
                .with_description("Number of times a per-core maximum grew")
                .with_unit("events")
                .build(),
        }
    }
}

/// Priority:
/// 1. OTEL_EXPORTER_OTLP_ENDPOINT environment variable
/// 2. If not set, metrics are disabled (no default fallback)
fn get_otlp_endpoint() -> Option<String> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}

/// Initialize OpenTelemetry metrics provider
///
/// Configures metrics export to OTLP Collector via gRPC.
/// Skips initialization if OTEL_EXPORTER_OTLP_ENDPOINT is not set.
/// Returns whether export is active.
pub fn init_metrics() -> Result<bool> {
    let endpoint = match get_otlp_endpoint() {
        Some(ep) => ep,
        None => {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
            return Ok(false);
        }
    };

    info!("Initializing OpenTelemetry metrics exporter");
    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "rtsl"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("rtsl");

    let _max_latency_gauge = meter
        .u64_observable_gauge("max_latency_ns")
        .with_description("Largest window observed per core since collection was enabled")
        .with_unit("ns")
        .with_callback(|observer| {
            if let Ok(maxima) = maxima_map().read() {
                for ((window, cpu), max) in maxima.iter() {
                    observer.observe(
                        *max,
                        &[
                            KeyValue::new("window", window.name()),
                            KeyValue::new("cpu", *cpu as i64),
                        ],
                    );
                }
            }
        })
        .build();

    let _ = METRICS.set(LatencyMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(true)
}

pub fn metrics() -> Option<&'static LatencyMetrics> {
    METRICS.get()
}

fn window_attrs(window: Window, cpu: u32) -> [KeyValue; 2] {
    [
        KeyValue::new("window", window.name()),
        KeyValue::new("cpu", cpu as i64),
    ]
}

pub fn record_window_sample(window: Window, cpu: u32, duration_ns: u64) {
    if let Some(m) = metrics() {
        m.window_duration_ns
            .record(duration_ns, &window_attrs(window, cpu));
    }
}

/// Record a grown maximum
/// Updates the global maxima map for the ObservableGauge callback
pub fn record_new_max(window: Window, cpu: u32, duration_ns: u64) {
    if let Ok(mut maxima) = maxima_map().write() {
        maxima.insert((window, cpu), duration_ns);
    }
    if let Some(m) = metrics() {
        m.new_max_events.add(1, &window_attrs(window, cpu));
    }
}

pub fn record_irq_execution(vector: i32, cpu: u32, duration_ns: u64) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("vector", vector as i64),
            KeyValue::new("cpu", cpu as i64),
        ];
        m.irq_execution_ns.record(duration_ns, &attrs);
    }
}

pub fn record_nmi_execution(cpu: u32, duration_ns: u64) {
    if let Some(m) = metrics() {
        m.nmi_execution_ns
            .record(duration_ns, &[KeyValue::new("cpu", cpu as i64)]);
    }
}

/// Forget all maxima, e.g. when collection is re-enabled
pub fn reset_maxima() {
    if let Ok(mut maxima) = maxima_map().write() {
        maxima.clear();
    }
}

/// Shutdown OpenTelemetry (graceful shutdown)
/// Flushes pending metrics and shuts down the MeterProvider
pub fn shutdown_metrics() {
    if let Some(provider) = METER_PROVIDER.get() {
        info!("Shutting down OpenTelemetry metrics...");
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}
