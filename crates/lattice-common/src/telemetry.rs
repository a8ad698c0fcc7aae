//! Logging, tracing and metrics setup for the controller and the node agent
//!
//! Logs are always JSON on stdout. Traces and metrics leave the process only
//! when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::{MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{Tracer, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors raised while installing telemetry
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built
    #[error("failed to initialize OTLP export: {0}")]
    Otlp(String),

    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    Subscriber(String),
}

/// Log filter used when `RUST_LOG` is unset
const DEFAULT_LOG_FILTER: &str =
    "info,lattice_model_cache=debug,lattice_model_agent=debug,kube=info,tower=warn,hyper=warn";

/// Who is emitting telemetry
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    /// `service.name` on every span and metric
    pub service_name: String,
    /// Node the agent serves; unset for the controller
    pub node_name: Option<String>,
    /// OTLP collector endpoint
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    /// The cache controllers
    pub fn controller() -> Self {
        Self::new("lattice-model-cache", None)
    }

    /// The download agent running on `node_name`
    pub fn agent(node_name: impl Into<String>) -> Self {
        Self::new("lattice-model-agent", Some(node_name.into()))
    }

    fn new(service_name: &str, node_name: Option<String>) -> Self {
        Self {
            service_name: service_name.to_string(),
            node_name,
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        }
    }

    fn resource(&self) -> Resource {
        let mut attributes = vec![
            KeyValue::new(SERVICE_NAME, self.service_name.clone()),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        ];
        if let Some(node) = &self.node_name {
            attributes.push(KeyValue::new("k8s.node.name", node.clone()));
        }
        if let Ok(namespace) = std::env::var("POD_NAMESPACE") {
            attributes.push(KeyValue::new("k8s.namespace.name", namespace));
        }
        Resource::new(attributes)
    }
}

/// Install the global subscriber, plus OTLP export when configured
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let tracer = init_otlp(endpoint, &config)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false),
        )
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

/// Register OTLP trace and metric pipelines and return the service tracer
fn init_otlp(endpoint: &str, config: &TelemetryConfig) -> Result<Tracer, TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let spans = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Otlp(e.to_string()))?;
    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(spans, runtime::Tokio)
        .with_resource(config.resource())
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let metrics = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Otlp(e.to_string()))?;
    let meter_provider = SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(metrics, runtime::Tokio).build())
        .with_resource(config.resource())
        .build();
    global::set_meter_provider(meter_provider);

    Ok(tracer_provider.tracer(config.service_name.clone()))
}
