//! Telemetry initialization: structured logging plus optional OpenTelemetry export.
//!
//! Log output is human-readable by default; set `log_format: json` for one JSON object per line.
//! Verbosity follows `RUST_LOG` (default `info`).
//!
//! OTLP export is **disabled by default** and must be explicitly enabled via the
//! `enable_otel_export` configuration flag. When enabled, the exporter reads the standard
//! OpenTelemetry environment variables:
//!
//! - `OTEL_EXPORTER_OTLP_ENDPOINT` - The OTLP endpoint URL
//! - `OTEL_EXPORTER_OTLP_PROTOCOL` - Protocol (http/protobuf, http/json)
//! - `OTEL_EXPORTER_OTLP_HEADERS` - Headers as comma-separated key=value pairs, `%20` decodes to a space
//! - `OTEL_SERVICE_NAME` - Service name for resource identification
//!
//! Log lines never contain full secrets. Tokens, session IDs and passwords pass through
//! [`crate::redact`] first.

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::LogFormat;

/// Kept so [`shutdown_telemetry`] can flush pending spans; tracing-opentelemetry only holds the tracer.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn output_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Fmt => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .flatten_event(true)
            .boxed(),
    }
}

/// Initialize tracing with the configured output format and optional OTLP export.
pub fn init_telemetry(format: LogFormat, enable_otel_export: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mut layers: Vec<BoxedLayer> = vec![output_layer(format)];
    let otel_status = if enable_otel_export {
        match create_otlp_tracer() {
            Ok(tracer) => {
                layers.push(tracing_opentelemetry::layer().with_tracer(tracer).boxed());
                "enabled".to_string()
            }
            // Fall back to local logging only
            Err(e) => format!("unavailable: {e}"),
        }
    } else {
        "disabled".to_string()
    };

    tracing_subscriber::registry().with(layers).with(env_filter).try_init()?;
    info!(log_format = ?format, otlp = %otel_status, "Telemetry initialized");
    Ok(())
}

fn parse_otlp_headers(raw: &str) -> HashMap<String, String> {
    raw.replace("%20", " ")
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// Create an OpenTelemetry tracer with an OTLP HTTP exporter
fn create_otlp_tracer() -> anyhow::Result<opentelemetry_sdk::trace::Tracer> {
    let service_name = std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "pulsegate".to_string());
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_else(|_| "http://localhost:4318".to_string());
    let headers = std::env::var("OTEL_EXPORTER_OTLP_HEADERS")
        .map(|raw| parse_otlp_headers(&raw))
        .unwrap_or_default();

    let protocol = match std::env::var("OTEL_EXPORTER_OTLP_PROTOCOL").as_deref().unwrap_or("http/protobuf") {
        "http/json" => Protocol::HttpJson,
        _ => Protocol::HttpBinary,
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(&endpoint)
        .with_protocol(protocol)
        .with_headers(headers)
        .build()?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder()
                .with_attribute(KeyValue::new("service.name", service_name.clone()))
                .build(),
        )
        .build();

    let tracer = tracer_provider.tracer(service_name);
    let _ = TRACER_PROVIDER.set(tracer_provider);
    Ok(tracer)
}

/// Shutdown the global tracer provider gracefully, flushing pending spans
pub fn shutdown_telemetry() {
    if let Some(provider) = TRACER_PROVIDER.get()
        && let Err(e) = provider.shutdown()
    {
        tracing::error!("Failed to shutdown tracer provider: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_otlp_headers() {
        let headers = parse_otlp_headers("Authorization=Basic%20abc, x-team = pulse,broken");
        assert_eq!(headers.get("Authorization").map(String::as_str), Some("Basic abc"));
        assert_eq!(headers.get("x-team").map(String::as_str), Some("pulse"));
        assert_eq!(headers.len(), 2);
    }
}
