use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use anyhow::{Context as _, Result, anyhow};
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{KeyValue, global};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{
    logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider,
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt as tracing_fmt};

use crate::interaction::ResponseType;

const SERVICE_NAME: &str = "waflow";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_directive())
    }
}

/// Keeps the OTLP providers alive; call [`TracingGuard::shutdown`] to flush.
#[derive(Default)]
pub struct TracingGuard {
    providers: Option<OtelProviders>,
}

impl TracingGuard {
    pub fn shutdown(self) {
        if let Some(p) = self.providers {
            if let Err(e) = p.tracer_provider.shutdown() {
                warn!("tracer shutdown: {e}");
            }
            if let Err(e) = p.meter_provider.shutdown() {
                warn!("meter shutdown: {e}");
            }
            if let Err(e) = p.logger_provider.shutdown() {
                warn!("logger shutdown: {e}");
            }
        }
    }
}

/// Install the global subscriber: OTLP when an endpoint is given, rolling
/// files under `root` otherwise.
pub fn init_tracing(
    root: PathBuf,
    log_file: String,
    event_file: String,
    log_level: LogLevel,
    otel_logs_endpoint: Option<String>,
    otel_events_endpoint: Option<String>,
) -> Result<TracingGuard> {
    let level = log_level.as_directive();
    if otel_logs_endpoint.is_some() || otel_events_endpoint.is_some() {
        let logs = otel_logs_endpoint.as_deref().unwrap_or_default();
        let events = otel_events_endpoint.as_deref().unwrap_or(logs);
        let providers = OtelProviders::init(level, logs, logs, events)?;
        Ok(TracingGuard {
            providers: Some(providers),
        })
    } else {
        init_files(level, &root.join(log_file), &root.join(event_file))?;
        Ok(TracingGuard::default())
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

struct OtelProviders {
    logger_provider: SdkLoggerProvider,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl OtelProviders {
    fn init(log_level: &str, logger_endpoint: &str, tracer_endpoint: &str, meter_endpoint: &str) -> Result<Self> {
        let log_exporter = LogExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(logger_endpoint)
            .build()
            .context("log exporter")?;
        let logger_provider = SdkLoggerProvider::builder()
            .with_batch_exporter(log_exporter)
            .with_resource(get_resource())
            .build();

        let span_exporter = SpanExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(tracer_endpoint)
            .build()
            .context("span exporter")?;
        let tracer_provider = SdkTracerProvider::builder()
            .with_batch_exporter(span_exporter)
            .with_resource(get_resource())
            .build();

        let metric_exporter = MetricExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(meter_endpoint)
            .build()
            .context("metric exporter")?;
        let meter_provider = SdkMeterProvider::builder()
            .with_periodic_exporter(metric_exporter)
            .with_resource(get_resource())
            .build();

        // keep the exporters' own HTTP stack out of the exported logs
        let otel_filter = EnvFilter::new(log_level)
            .add_directive("hyper=off".parse()?)
            .add_directive("tonic=off".parse()?)
            .add_directive("h2=off".parse()?)
            .add_directive("reqwest=off".parse()?);
        let otel_logs_layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(otel_filter);

        let fmt_layer = tracing_fmt::layer()
            .with_thread_names(true)
            .with_filter(EnvFilter::new(log_level));

        Registry::default()
            .with(otel_logs_layer)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| anyhow!("tracing already initialised: {e}"))?;

        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());

        Ok(Self {
            logger_provider,
            tracer_provider,
            meter_provider,
        })
    }
}

fn split_path(path: &Path) -> Result<(&Path, &std::ffi::OsStr)> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", path.display()))?;
    let file = path
        .file_name()
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
    Ok((dir, file))
}

/// Text log for everything, plus a JSON line per `target: "request"` event.
fn init_files(log_level: &str, log_file: &Path, event_file: &Path) -> Result<()> {
    let (log_dir, log_name) = split_path(log_file)?;
    let (event_dir, event_name) = split_path(event_file)?;
    std::fs::create_dir_all(log_dir).with_context(|| format!("creating {}", log_dir.display()))?;
    std::fs::create_dir_all(event_dir)
        .with_context(|| format!("creating {}", event_dir.display()))?;

    let txt_layer = tracing_fmt::layer()
        .with_writer(RollingFileAppender::new(Rotation::DAILY, log_dir, log_name))
        .with_ansi(false)
        .with_filter(EnvFilter::new(log_level));

    let json_layer = tracing_fmt::layer()
        .json()
        .with_writer(RollingFileAppender::new(Rotation::DAILY, event_dir, event_name))
        .with_target(true)
        .with_filter(EnvFilter::new("request=info"));

    Registry::default()
        .with(txt_layer)
        .with(json_layer)
        .try_init()
        .map_err(|e| anyhow!("tracing already initialised: {e}"))
}

/// Engine counters. Backed by the global meter, so they are no-ops until a
/// provider is installed.
#[derive(Debug, Clone)]
pub struct Telemetry {
    pub turns_processed: Counter<u64>,
    pub turns_by_type: Counter<u64>,
    pub assistant_failures: Counter<u64>,
    pub assistant_timeouts: Counter<u64>,
    pub compile_failures: Counter<u64>,
    pub reloads: Counter<u64>,
    pub turn_latency_ms: Histogram<f64>,
}

impl Telemetry {
    pub fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            turns_processed: meter
                .u64_counter("turns_processed")
                .with_description("Chat turns processed")
                .build(),
            turns_by_type: meter
                .u64_counter("turns_by_type")
                .with_description("Chat turns per response type")
                .build(),
            assistant_failures: meter.u64_counter("assistant_failures").build(),
            assistant_timeouts: meter.u64_counter("assistant_timeouts").build(),
            compile_failures: meter
                .u64_counter("compile_failures")
                .with_description("Flows skipped because their script did not compile")
                .build(),
            reloads: meter.u64_counter("brain_reloads").build(),
            turn_latency_ms: meter
                .f64_histogram("turn_latency_ms")
                .with_description("Latency per chat turn in ms")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn record_turn(&self, response_type: ResponseType, latency_ms: f64) {
        self.turns_processed.add(1, &[]);
        self.turns_by_type
            .add(1, &[KeyValue::new("response_type", response_type.as_str())]);
        self.turn_latency_ms.record(latency_ms, &[]);
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}
