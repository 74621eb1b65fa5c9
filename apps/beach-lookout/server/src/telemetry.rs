//! Logging, span export and the gateway's metric catalogue.

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "beach-lookout";
const OTEL_STDOUT_ENV: &str = "BEACH_LOOKOUT_OTEL_STDOUT";
/// russh logs every packet exchange at info.
const DEFAULT_FILTER: &str = "info,russh=warn";

pub const SESSIONS_OPENED: &str = "beach_lookout_sessions_opened_total";
pub const SESSIONS_CLOSED: &str = "beach_lookout_sessions_closed_total";
pub const SESSIONS_ACTIVE: &str = "beach_lookout_sessions_active";
pub const EXECUTIONS: &str = "beach_lookout_executions_total";
pub const EXECUTION_DURATION_MS: &str = "beach_lookout_execution_duration_ms";
pub const COMMANDS_DENIED: &str = "beach_lookout_commands_denied_total";
pub const COMMANDS_REJECTED_BUSY: &str = "beach_lookout_commands_rejected_busy_total";
pub const FRAMES_REJECTED: &str = "beach_lookout_frames_rejected_total";
pub const OUTBOUND_DROPPED: &str = "beach_lookout_outbound_dropped_total";
pub const WRITE_STALLS: &str = "beach_lookout_write_stalls_total";

/// From a quick `ls` up to the ten minute ceiling.
const EXECUTION_DURATION_BUCKETS_MS: &[f64] = &[
    10.0, 50.0, 100.0, 500.0, 1_000.0, 5_000.0, 30_000.0, 120_000.0, 600_000.0,
];

/// Process-wide logging, tracing and metrics. Keep it alive for the life of
/// the server; dropping it flushes the span exporter.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = prometheus_builder()?
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_metrics();

        let tracer_provider = env_truthy(OTEL_STDOUT_ENV).then(stdout_tracer_provider);
        let otel_layer = tracer_provider.as_ref().map(|provider| {
            global::set_tracer_provider(provider.clone());
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if tracer_provider.is_some() {
            info!("OpenTelemetry stdout exporter enabled ({OTEL_STDOUT_ENV}=1)");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

/// A Prometheus handle that is not installed as the global recorder. Routers
/// built outside `main` render from it.
pub fn detached_metrics_handle() -> Result<PrometheusHandle> {
    Ok(prometheus_builder()?.build_recorder().handle())
}

fn prometheus_builder() -> Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(EXECUTION_DURATION_MS.to_string()),
            EXECUTION_DURATION_BUCKETS_MS,
        )
        .context("invalid execution duration buckets")
}

fn describe_metrics() {
    describe_counter!(SESSIONS_OPENED, "WebSocket sessions accepted");
    describe_counter!(SESSIONS_CLOSED, "WebSocket sessions torn down");
    describe_gauge!(SESSIONS_ACTIVE, "Sessions currently registered");
    describe_counter!(EXECUTIONS, "Executions by terminal outcome");
    describe_histogram!(
        EXECUTION_DURATION_MS,
        Unit::Milliseconds,
        "Wall time from decode to terminal envelope"
    );
    describe_counter!(COMMANDS_DENIED, "Commands refused by the policy gate");
    describe_counter!(
        COMMANDS_REJECTED_BUSY,
        "Commands refused because another was running"
    );
    describe_counter!(FRAMES_REJECTED, "Inbound frames that were not commands");
    describe_counter!(OUTBOUND_DROPPED, "Envelopes dropped on a full session queue");
    describe_counter!(WRITE_STALLS, "Sessions closed on a stalled socket write");
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])
                .build(),
        )
        .build()
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key).is_ok_and(|val| is_truthy(&val))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
