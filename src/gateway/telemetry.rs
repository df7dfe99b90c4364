use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::{ConduitError, Result};

#[derive(Clone, Debug, Default)]
pub struct TelemetryOptions {
    pub json_logs: bool,
    /// Export spans over OTLP/HTTP. Requires `gateway-otel`.
    pub otel: bool,
    pub otel_endpoint: Option<String>,
}

/// Keeps the span exporter alive; dropping it flushes and shuts the exporter down.
#[derive(Debug, Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "gateway-otel")]
    provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "gateway-otel")]
        {
            if let Some(provider) = self.provider.take() {
                let _ = provider.shutdown();
            }
        }
    }
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

fn fmt_layer<S>(json_logs: bool) -> Box<dyn tracing_subscriber::Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    }
}

/// Installs the global subscriber: `RUST_LOG`-style filter (default `info`), plain
/// or JSON output, plus OTLP span export when requested.
pub fn init_tracing(service_name: &str, options: &TelemetryOptions) -> Result<TelemetryGuard> {
    if options.otel {
        return init_with_otel(service_name, options);
    }
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(options.json_logs))
        .try_init()
        .map_err(|err| ConduitError::Config(format!("tracing init failed: {err}")))?;
    Ok(TelemetryGuard::default())
}

#[cfg(feature = "gateway-otel")]
fn init_with_otel(service_name: &str, options: &TelemetryOptions) -> Result<TelemetryGuard> {
    use opentelemetry::global;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::SpanExporter;
    use opentelemetry_otlp::WithExportConfig as _;
    use opentelemetry_sdk::Resource;

    let mut exporter = SpanExporter::builder().with_http();
    if let Some(endpoint) = options.otel_endpoint.as_deref() {
        exporter = exporter.with_endpoint(endpoint.to_string());
    }
    let exporter = exporter
        .build()
        .map_err(|err| ConduitError::Config(format!("otlp exporter: {err}")))?;

    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder_empty()
                .with_service_name(service_name.to_string())
                .build(),
        )
        .build();
    global::set_tracer_provider(provider.clone());

    let tracer = provider.tracer(service_name.to_string());
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(options.json_logs))
        .with(otel_layer)
        .try_init()
        .map_err(|err| ConduitError::Config(format!("tracing init failed: {err}")))?;

    Ok(TelemetryGuard {
        provider: Some(provider),
    })
}

#[cfg(not(feature = "gateway-otel"))]
fn init_with_otel(_service_name: &str, _options: &TelemetryOptions) -> Result<TelemetryGuard> {
    Err(ConduitError::Config(
        "otel export requires `--features gateway-otel`".into(),
    ))
}
