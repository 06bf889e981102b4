//! Tracing setup shared by both binaries.

use opentelemetry::trace::TraceId;
use tracing::Subscriber;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

use crate::{Error, Result};

const SERVICE_NAME: &str = "job-watcher";

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

/// Shape of the log lines written to stdout
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    /// `LOG_FORMAT=json` selects JSON lines, anything else compact text
    pub fn from_env() -> Self {
        Self::parse(std::env::var("LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }

    fn layer<S>(self) -> BoxedLayer<S>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        match self {
            LogFormat::Compact => fmt::layer().compact().boxed(),
            LogFormat::Json => fmt::layer().json().boxed(),
        }
    }
}

/// Trace id of the current span, if it is being exported
pub fn get_trace_id() -> Option<TraceId> {
    use opentelemetry::trace::TraceContextExt as _;
    use tracing_opentelemetry::OpenTelemetrySpanExt as _;

    match tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
    {
        TraceId::INVALID => None,
        valid => Some(valid),
    }
}

fn env_filter() -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| Error::Telemetry(e.to_string()))
}

#[cfg(feature = "telemetry")]
fn export_layer<S>() -> Result<BoxedLayer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::{SpanExporter, WithExportConfig};
    use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};

    let endpoint = std::env::var("OPENTELEMETRY_ENDPOINT_URL").map_err(|_| {
        Error::Telemetry("OPENTELEMETRY_ENDPOINT_URL must point at an OTLP collector".into())
    })?;
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::Telemetry(format!("OTLP span exporter: {e}")))?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(Resource::builder().with_service_name(SERVICE_NAME).build())
        .build();
    let tracer = provider.tracer(SERVICE_NAME);
    // the global provider keeps the batch exporter alive
    opentelemetry::global::set_tracer_provider(provider);

    Ok(tracing_opentelemetry::layer().with_tracer(tracer).boxed())
}

/// Install the global subscriber: `RUST_LOG` filtering (default `info`),
/// stdout logs in the `LOG_FORMAT` shape, and span export with the
/// `telemetry` feature.
pub fn init() -> Result<()> {
    let subscriber = Registry::default()
        .with(env_filter()?)
        .with(LogFormat::from_env().layer());

    #[cfg(feature = "telemetry")]
    let subscriber = subscriber.with(export_layer()?);

    subscriber
        .try_init()
        .map_err(|e| Error::Telemetry(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_defaults_to_compact() {
        assert_eq!(LogFormat::parse(None), LogFormat::Compact);
        assert_eq!(LogFormat::parse(Some("")), LogFormat::Compact);
        assert_eq!(LogFormat::parse(Some("text")), LogFormat::Compact);
    }

    #[test]
    fn json_log_format_is_case_insensitive() {
        assert_eq!(LogFormat::parse(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some(" JSON ")), LogFormat::Json);
    }

    #[test]
    fn no_trace_id_without_an_exporter() {
        assert_eq!(get_trace_id(), None);

        let span = tracing::info_span!("reconcile", job = "dev-namespace/dev-job-42");
        let _entered = span.enter();
        assert_eq!(get_trace_id(), None);
    }

    #[cfg(feature = "telemetry")]
    #[test]
    #[ignore = "requires an OTLP collector at OPENTELEMETRY_ENDPOINT_URL"]
    fn spans_carry_a_trace_id_once_exported() {
        super::init().unwrap();

        #[tracing::instrument(name = "reconcile")]
        fn in_reconcile() -> Option<TraceId> {
            get_trace_id()
        }
        assert!(in_reconcile().is_some());
    }
}
