//! Tracing/OTEL bootstrap for the worker binary (§A.1). Mirrors
//! `everruns-core::telemetry`'s `init_telemetry`/`TelemetryGuard` shape: a
//! console `fmt` layer is always installed, and an OTLP span exporter layer
//! is added on top when an endpoint is configured. The batch exporter and
//! sampler choices are the teacher's own.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
    Resource,
};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Holds the tracer provider alive for the process lifetime; shuts it down
/// (flushing any buffered spans) on drop.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to shut down tracer provider: {e:?}");
            }
        }
    }
}

/// Initialize `tracing_subscriber` with a console layer and, if
/// `otel_endpoint` is set, an OTLP span exporter layer (§A.1). Log level
/// defaults to `sagaflow=info` unless overridden by `RUST_LOG`.
pub fn init(otel_endpoint: Option<&str>) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "sagaflow=info".into());

    let (provider, otel_layer) = match otel_endpoint {
        Some(endpoint) => match build_otlp_tracer(endpoint) {
            Ok((provider, tracer)) => {
                let layer = tracing_opentelemetry::layer().with_tracer(tracer);
                (Some(provider), Some(layer))
            }
            Err(e) => {
                eprintln!("failed to initialize OTLP exporter, continuing without it: {e}");
                (None, None)
            }
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .init();

    if let Some(endpoint) = otel_endpoint {
        if provider.is_some() {
            tracing::info!(endpoint, "OpenTelemetry tracing enabled");
        }
    } else {
        tracing::debug!("OpenTelemetry tracing disabled: ENGINE_OTEL_ENDPOINT not set");
    }

    TelemetryGuard { provider }
}

fn build_otlp_tracer(
    endpoint: &str,
) -> Result<(SdkTracerProvider, opentelemetry_sdk::trace::Tracer), opentelemetry::trace::TraceError> {
    let resource = Resource::builder()
        .with_attributes(vec![KeyValue::new("service.name", "sagaflow-worker")])
        .build();

    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = provider.tracer("sagaflow");

    Ok((provider, tracer))
}
