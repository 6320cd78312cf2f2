//! Logging and trace export
//!
//! Logs are JSON lines carrying the current span, so every line emitted
//! while reconciling names the ClientIntents being worked on. Spans are
//! additionally exported over OTLP when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::FIELD_MANAGER;

const LOG_FILTER: &str = "info,lattice_intents=debug,kube=info";

/// Telemetry setup failures
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// OTLP exporter could not be built
    #[error("failed to initialize tracer: {0}")]
    TracerInit(String),

    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Where spans go besides the logs
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint; `None` keeps spans local to the logs
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    /// Read the endpoint from `OTEL_EXPORTER_OTLP_ENDPOINT`
    pub fn from_env() -> Self {
        Self {
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|e| !e.trim().is_empty()),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let provider = otlp_provider(endpoint)?;
            Some(tracing_opentelemetry::layer().with_tracer(provider.tracer(FIELD_MANAGER)))
        }
        None => None,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(LOG_FILTER));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

fn operator_resource() -> Resource {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, FIELD_MANAGER),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    // Downward API, when the Deployment provides it
    if let Ok(namespace) = std::env::var("POD_NAMESPACE") {
        attributes.push(KeyValue::new("k8s.namespace.name", namespace));
    }
    Resource::new(attributes)
}

fn otlp_provider(endpoint: &str) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(operator_resource())
        .build();
    global::set_tracer_provider(provider.clone());
    Ok(provider)
}
