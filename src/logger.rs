use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{
    logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider,
};
use tracing::warn;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

const SERVICE_NAME: &str = "addon-agent";

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

/// Install the global subscriber.
///
/// - text log at `root/log_file`, JSON call reports (target `call`) at
///   `root/event_file`, both rolling daily
/// - a copy on stdout
/// - OTLP logs, traces and metrics when `otel_endpoint` is set
///
/// Returns the OTLP providers so the caller can flush them on exit.
pub fn init_tracing(
    root: PathBuf,
    log_file: String,
    event_file: String,
    log_level: String,
    otel_endpoint: Option<String>,
) -> Result<Option<Telemetry>> {
    let txt_appender = rolling_appender(&root, &log_file)?;
    let txt_layer = fmt::layer()
        .with_writer(txt_appender)
        .with_ansi(false)
        .with_filter(EnvFilter::new(&log_level));

    let json_appender = rolling_appender(&root, &event_file)?;
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new("call=info"));

    let stdout_layer = fmt::layer()
        .with_thread_names(true)
        .with_filter(EnvFilter::new(&log_level));

    let telemetry = match otel_endpoint.as_deref() {
        Some(endpoint) => Some(Telemetry::init(endpoint)?),
        None => None,
    };
    let otel_layer = telemetry.as_ref().map(|t| {
        let filter = EnvFilter::new(format!("{log_level},hyper=off,tonic=off,h2=off"));
        OpenTelemetryTracingBridge::new(&t.logger_provider).with_filter(filter)
    });

    Registry::default()
        .with(txt_layer)
        .with(json_layer)
        .with(stdout_layer)
        .with(otel_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(telemetry)
}

fn rolling_appender(root: &Path, file: &str) -> Result<RollingFileAppender> {
    let path = root.join(file);
    let dir = path.parent().unwrap_or(root).to_path_buf();
    let name = path
        .file_name()
        .with_context(|| format!("log path {} has no file name", path.display()))?;
    std::fs::create_dir_all(&dir).with_context(|| format!("cannot create {}", dir.display()))?;
    Ok(RollingFileAppender::new(Rotation::DAILY, dir, name))
}

/// OTLP (gRPC) exporters for logs, traces and metrics.
pub struct Telemetry {
    pub logger_provider: SdkLoggerProvider,
    pub tracer_provider: SdkTracerProvider,
    pub meter_provider: SdkMeterProvider,
}

impl Telemetry {
    pub fn init(endpoint: &str) -> Result<Self> {
        let log_exporter = LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .context("log exporter")?;
        let logger_provider = SdkLoggerProvider::builder()
            .with_batch_exporter(log_exporter)
            .with_resource(get_resource())
            .build();

        let span_exporter = SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .context("span exporter")?;
        let tracer_provider = SdkTracerProvider::builder()
            .with_batch_exporter(span_exporter)
            .with_resource(get_resource())
            .build();

        let metric_exporter = MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .context("metric exporter")?;
        let meter_provider = SdkMeterProvider::builder()
            .with_periodic_exporter(metric_exporter)
            .with_resource(get_resource())
            .build();

        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());

        Ok(Self { logger_provider, tracer_provider, meter_provider })
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.tracer_provider.shutdown() {
            warn!("tracer provider shutdown: {e}");
        }
        if let Err(e) = self.meter_provider.shutdown() {
            warn!("meter provider shutdown: {e}");
        }
        if let Err(e) = self.logger_provider.shutdown() {
            warn!("logger provider shutdown: {e}");
        }
    }
}

/// Counters and latency of routed calls, recorded on the global meter.
#[derive(Clone)]
pub struct CallMetrics {
    pub calls_started: Counter<u64>,
    pub calls_succeeded: Counter<u64>,
    pub calls_failed: Counter<u64>,
    pub call_latency_ms: Histogram<f64>,
}

impl CallMetrics {
    pub fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            calls_started: meter
                .u64_counter("calls_started")
                .with_description("Total routed calls")
                .build(),
            calls_succeeded: meter.u64_counter("calls_succeeded").build(),
            calls_failed: meter.u64_counter("calls_failed").build(),
            call_latency_ms: meter
                .f64_histogram("call_latency_ms")
                .with_description("Latency per routed call in ms")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn started(&self) {
        self.calls_started.add(1, &[]);
    }

    pub fn finished(&self, elapsed: Duration, ok: bool) {
        self.call_latency_ms.record(elapsed.as_secs_f64() * 1_000.0, &[]);
        if ok {
            self.calls_succeeded.add(1, &[]);
        } else {
            self.calls_failed.add(1, &[]);
        }
    }
}

impl Default for CallMetrics {
    fn default() -> Self {
        Self::new()
    }
}
