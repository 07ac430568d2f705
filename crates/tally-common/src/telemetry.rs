use std::collections::HashMap;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Where spans go in addition to the local fmt layer.
#[derive(Debug, Clone, Default)]
pub struct OtlpExport {
    /// Base URL of an OTLP/HTTP collector; the exporter appends `/v1/traces`.
    pub endpoint: Option<String>,
    pub token: Option<String>,
}

/// Install the global subscriber for `service_name`.
///
/// `RUST_LOG` drives the filter (default `info`). When `export.endpoint` is set
/// an OTLP span exporter is layered on top; the returned provider must be kept
/// alive and passed to [`shutdown_tracing`] before exit so batches are flushed.
pub fn init_tracing(service_name: &str, export: &OtlpExport) -> Option<TracerProvider> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    let provider = export
        .endpoint
        .as_deref()
        .and_then(|endpoint| build_provider(service_name, endpoint, export.token.as_deref()));

    match &provider {
        Some(provider) => {
            let otel_layer = tracing_opentelemetry::layer()
                .with_tracer(provider.tracer(service_name.to_string()));
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .with(otel_layer)
                .init();
            tracing::info!(service_name, "OTLP span export enabled");
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .init();
        }
    }

    provider
}

fn build_provider(
    service_name: &str,
    endpoint: &str,
    token: Option<&str>,
) -> Option<TracerProvider> {
    let mut headers = HashMap::new();
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
    }

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .with_headers(headers)
        .build()
    {
        Ok(exporter) => exporter,
        Err(err) => {
            // The subscriber is not installed yet.
            eprintln!("failed to create OTLP exporter: {err}, logging to stdout only");
            return None;
        }
    };

    Some(
        TracerProvider::builder()
            .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
            .with_resource(Resource::new([KeyValue::new(
                "service.name",
                service_name.to_string(),
            )]))
            .build(),
    )
}

pub fn shutdown_tracing(provider: Option<TracerProvider>) {
    if let Some(provider) = provider {
        if let Err(err) = provider.shutdown() {
            eprintln!("failed to flush OTLP spans: {err}");
        }
    }
}
