use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "engagement_api=debug,tower_http=debug";

/// Keeps the tracer provider alive until shutdown flushes it.
pub struct Telemetry {
    provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn shutdown(self) {
        tracing::info!("Shutting down OpenTelemetry");
        if let Some(provider) = self.provider {
            if let Err(e) = provider.shutdown() {
                eprintln!("OpenTelemetry shutdown failed: {}", e);
            }
        }
    }
}

/// Installs the global subscriber: env filter, fmt output and, unless
/// `OTEL_SDK_DISABLED=true`, an OTLP/HTTP span exporter.
pub fn init_tracing(service_name: &'static str) -> Telemetry {
    let disabled = std::env::var("OTEL_SDK_DISABLED")
        .map(|v| v == "true")
        .unwrap_or(false);

    let provider = if disabled {
        None
    } else {
        match build_provider(service_name) {
            Ok(provider) => Some(provider),
            Err(e) => {
                eprintln!("WARNING: OpenTelemetry disabled, exporter setup failed: {}", e);
                None
            }
        }
    };

    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer(service_name)));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .init();

    Telemetry { provider }
}

fn build_provider(service_name: &'static str) -> anyhow::Result<SdkTracerProvider> {
    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4318".to_string());

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(otlp_endpoint)
        .build()?;

    let resource = Resource::builder_empty()
        .with_service_name(service_name)
        .with_attributes(vec![KeyValue::new(
            "service.version",
            env!("CARGO_PKG_VERSION"),
        )])
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build();

    opentelemetry::global::set_tracer_provider(provider.clone());
    Ok(provider)
}
