//! Logging and Span Export
//!
//! Everything the bridge logs goes through `tracing` to stderr. Spans can
//! additionally be shipped over OTLP/gRPC; the exporter endpoint and
//! resource attributes come from the standard `OTEL_*` variables read by
//! the SDK itself.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Filter (default: info)
//! - `OTEL_ENABLED`: Set to "true" to export spans (default: false)

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Service name reported on exported spans.
const SERVICE_NAME: &str = "ctp-bridge";

/// Dependencies that are chatty at `info`.
const QUIET_TARGETS: &[&str] = &["zeromq=warn", "hyper=warn", "h2=warn", "tonic=warn"];

/// Flushes exported spans when dropped.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to flush exported spans: {e}");
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Export spans over OTLP.
    pub export_spans: bool,
    /// Base filter; `info` when unset.
    pub filter: Option<String>,
}

impl TelemetryConfig {
    /// Read `OTEL_ENABLED` and `RUST_LOG`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the same keys from an arbitrary source.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            export_spans: lookup("OTEL_ENABLED").is_some_and(|v| v.eq_ignore_ascii_case("true")),
            filter: lookup("RUST_LOG").filter(|v| !v.trim().is_empty()),
        }
    }
}

/// Build the log filter: the base filter with dependency noise capped.
///
/// An unparsable base falls back to `info`.
#[must_use]
pub fn env_filter(base: Option<&str>) -> EnvFilter {
    let filter = base
        .and_then(|base| EnvFilter::try_new(base).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    QUIET_TARGETS
        .iter()
        .filter_map(|directive| directive.parse::<Directive>().ok())
        .fold(filter, EnvFilter::add_directive)
}

/// Initialize from the environment. Keep the guard alive until exit.
#[must_use]
pub fn init() -> TelemetryGuard {
    init_with_config(TelemetryConfig::from_env())
}

/// Initialize with an explicit configuration.
#[must_use]
pub fn init_with_config(config: TelemetryConfig) -> TelemetryGuard {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    let (tracer_provider, export_error) = if config.export_spans {
        match span_provider() {
            Ok(provider) => (Some(provider), None),
            Err(e) => (None, Some(e)),
        }
    } else {
        (None, None)
    };
    let otel_layer = tracer_provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME)));

    tracing_subscriber::registry()
        .with(env_filter(config.filter.as_deref()))
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    if let Some(e) = export_error {
        tracing::warn!(error = %e, "Span export unavailable, logging only");
    }

    TelemetryGuard { tracer_provider }
}

fn span_provider() -> Result<SdkTracerProvider, opentelemetry_otlp::ExporterBuildError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(Resource::builder().with_service_name(SERVICE_NAME).build())
        .build())
}
