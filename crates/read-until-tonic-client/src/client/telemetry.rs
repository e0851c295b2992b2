//! # Telemetry Features
//!
//! The client supports optional telemetry using the `tracing` and `metrics`
//! crates, exported via OpenTelemetry to an OTLP collector or stdout.
//!
//! ## Feature matrix
//!
//! - `tracing`: Enables OpenTelemetry distributed tracing (via spans).
//! - `metrics`: Enables OpenTelemetry metrics (session counters and gauges).
//! - `otlp`: Enables the OTLP gRPC exporter.
//! - `stdout`: Enables the stdout exporter.
//!
//! ## Feature constraints
//!
//! - Exporters require at least one of `tracing` or `metrics`.
//! - `otlp` and `stdout` can be enabled at the same time.
//!
//! ## OTLP configuration
//!
//! The exporter reads the standard OpenTelemetry environment variables:
//! `OTEL_EXPORTER_OTLP_ENDPOINT` (default `http://localhost:4317`),
//! `OTEL_EXPORTER_OTLP_HEADERS` and `OTEL_EXPORTER_OTLP_TIMEOUT`.
//! `OTEL_EXPORTER_OTLP_COMPRESSION` accepts `gzip` or `zstd`.
//!
//! ## Metrics behavior
//!
//! Session counters kept by the client (chunks received, actions sent,
//! acknowledged, timed out, cache occupancy, ...) are published as observable
//! instruments read at export time. The analysis workers additionally count
//! their own decisions.
//!
//! ## Example usage
//!
//! ```bash
//! cargo run --features tracing,metrics,otlp
//! cargo run --features tracing,stdout
//! ```

#[cfg(all(feature = "otlp", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!("The 'otlp' feature requires at least one of 'tracing' or 'metrics' to be enabled.");

#[cfg(all(feature = "stdout", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "tracing")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Meter, ObservableCounter, ObservableGauge};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use read_until::MetricsSnapshot;
#[cfg(feature = "metrics")]
use std::sync::{Arc, OnceLock};

#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace as sdktrace;

const SERVICE_NAME: &str = "read-until";

pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down every provider. Errors are printed rather than
    /// logged since the subscriber may already be gone.
    pub fn shutdown(self) {
        #[cfg(feature = "tracing")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "tracing")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    // Console output is always on and independent of the `stdout` exporter.
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "tracing")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        let _ = METER.set(meter.clone());
        init_metric_handles(&meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

/// Compression requested through `OTEL_EXPORTER_OTLP_COMPRESSION`, if any.
#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "tracing")))]
fn otlp_compression() -> anyhow::Result<Option<Compression>> {
    use anyhow::Context;
    use std::str::FromStr;

    match std::env::var("OTEL_EXPORTER_OTLP_COMPRESSION") {
        Ok(raw) => Compression::from_str(&raw.to_ascii_lowercase())
            .map(Some)
            .context("invalid `OTEL_EXPORTER_OTLP_COMPRESSION`"),
        Err(_) => Ok(None),
    }
}

#[cfg(feature = "metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_protocol(Protocol::Grpc)
            .with_temporality(sdkmetrics::Temporality::Cumulative);
        let exporter = match otlp_compression()? {
            Some(compression) => exporter.with_compression(compression),
            None => exporter,
        }
        .build()
        .context("failed to build metrics exporter")?;

        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "tracing")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        let batch = sdktrace::BatchSpanProcessor::builder(SpanExporter::default())
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_protocol(Protocol::Grpc);
        let exporter = match otlp_compression()? {
            Some(compression) => exporter.with_compression(compression),
            None => exporter,
        }
        .build()
        .context("failed to build span exporter")?;

        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();

        builder.with_span_processor(batch)
    };

    Ok(builder.build())
}

// Metric handles - only compiled when the metrics feature is enabled
#[cfg(feature = "metrics")]
static METER: OnceLock<Meter> = OnceLock::new();
#[cfg(feature = "metrics")]
static UNITS_ANALYSED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static DECISIONS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REJECTED_REQUESTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static SESSION_INSTRUMENTS: OnceLock<SessionInstruments> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: &Meter) {
    let _ = UNITS_ANALYSED.set(
        meter
            .u64_counter("units_analysed")
            .with_description("Work units pulled from the cache by analysis workers")
            .build(),
    );

    let _ = DECISIONS.set(
        meter
            .u64_counter("decisions")
            .with_description("Actions requested by analysis workers, by kind")
            .build(),
    );

    let _ = REJECTED_REQUESTS.set(
        meter
            .u64_counter("rejected_requests")
            .with_description("Action requests refused by the client")
            .build(),
    );
}

/// Observable instruments backed by [`MetricsSnapshot`]. Kept alive for the
/// lifetime of the process so their callbacks stay registered.
#[cfg(feature = "metrics")]
#[allow(dead_code)]
struct SessionInstruments {
    counters: Vec<ObservableCounter<u64>>,
    gauges: Vec<ObservableGauge<u64>>,
}

/// Publishes the client's session counters. `snapshot` is called once per
/// instrument at every export.
#[cfg(feature = "metrics")]
pub fn observe_session<F>(snapshot: F)
where
    F: Fn() -> MetricsSnapshot + Send + Sync + 'static,
{
    let Some(meter) = METER.get() else {
        return;
    };
    let snapshot = Arc::new(snapshot);

    let counter = |name: &'static str, description: &'static str, read: fn(&MetricsSnapshot) -> u64| {
        let snapshot = Arc::clone(&snapshot);
        meter
            .u64_observable_counter(name)
            .with_description(description)
            .with_callback(move |observer| observer.observe(read(&snapshot()), &[]))
            .build()
    };
    let counters = vec![
        counter("chunks_received", "Chunks received from the server", |s| {
            s.chunks_received
        }),
        counter("chunks_filtered", "Chunks dropped before the cache", |s| {
            s.chunks_filtered
        }),
        counter("reconnects", "Stream reconnections", |s| s.reconnects),
        counter("cache_missed", "Items superseded before analysis", |s| {
            s.cache.missed
        }),
        counter("cache_out_of_order", "Chunks that failed to advance", |s| {
            s.cache.out_of_order
        }),
        counter("actions_sent", "Actions handed to the transport", |s| {
            s.actions.sent
        }),
        counter("actions_acknowledged", "Actions acknowledged by the server", |s| {
            s.actions.acknowledged
        }),
        counter("actions_timed_out", "Actions never acknowledged", |s| {
            s.actions.timed_out
        }),
        counter("actions_cancelled", "Actions cancelled at shutdown", |s| {
            s.actions.cancelled
        }),
        counter("samples_since_start", "Acquisition clock in samples", |s| {
            s.samples_since_start
        }),
    ];

    let gauge = |name: &'static str, description: &'static str, read: fn(&MetricsSnapshot) -> u64| {
        let snapshot = Arc::clone(&snapshot);
        meter
            .u64_observable_gauge(name)
            .with_description(description)
            .with_callback(move |observer| observer.observe(read(&snapshot()), &[]))
            .build()
    };
    let gauges = vec![
        gauge("cache_occupancy", "Occupied cache slots", |s| {
            s.cache_occupancy as u64
        }),
        gauge("actions_pending", "Queued actions not yet sent", |s| {
            s.actions.pending as u64
        }),
        gauge("actions_outstanding", "Sent actions awaiting acknowledgment", |s| {
            s.actions.outstanding as u64
        }),
    ];

    let _ = SESSION_INSTRUMENTS.set(SessionInstruments { counters, gauges });
}

#[cfg(not(feature = "metrics"))]
pub fn observe_session<F>(_snapshot: F)
where
    F: Fn() -> read_until::MetricsSnapshot + Send + Sync + 'static,
{
}

#[cfg(feature = "metrics")]
pub fn increment_units_analysed(count: u64) {
    if let Some(counter) = UNITS_ANALYSED.get() {
        counter.add(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_units_analysed(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn increment_decisions(kind: &'static str) {
    if let Some(counter) = DECISIONS.get() {
        counter.add(1, &[KeyValue::new("kind", kind)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_decisions(_kind: &'static str) {}

#[cfg(feature = "metrics")]
pub fn increment_rejected_requests() {
    if let Some(counter) = REJECTED_REQUESTS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_rejected_requests() {}
