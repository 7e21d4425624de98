//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! use authflow_observe::tracing_setup::{TracingConfig, init_tracing, shutdown_tracing};
//!
//! init_tracing(&TracingConfig::default()).unwrap();
//! // ... run the engine ...
//! shutdown_tracing();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

pub type TracingError = Box<dyn std::error::Error + Send + Sync>;

/// Subscriber options, usually read from the `[tracing]` table of the host's
/// config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub default_directive: String,
    /// One JSON object per event instead of human-readable lines.
    pub json: bool,
    /// Bridge spans to OpenTelemetry with the stdout exporter.
    pub otel: bool,
    pub service_name: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_directive: "info,sqlx=warn".to_string(),
            json: false,
            otel: false,
            service_name: "authflow".to_string(),
        }
    }
}

/// `RUST_LOG` wins when present; otherwise the configured directive.
fn build_filter(rust_log: Option<String>, default_directive: &str) -> Result<EnvFilter, TracingError> {
    let directive = match rust_log {
        Some(value) if !value.trim().is_empty() => value,
        _ => default_directive.to_string(),
    };
    Ok(EnvFilter::try_new(directive)?)
}

/// Initialize the global tracing subscriber.
///
/// - Installs a `fmt` layer with targets and span close timing, as text or JSON.
/// - When `config.otel` is set, additionally bridges spans to OpenTelemetry
///   with a stdout exporter.
///
/// # Errors
///
/// Returns an error if the filter directive is invalid or a global subscriber
/// is already installed.
pub fn init_tracing(config: &TracingConfig) -> Result<(), TracingError> {
    let env_filter = build_filter(std::env::var("RUST_LOG").ok(), &config.default_directive)?;

    let text_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
    });
    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_span_events(FmtSpan::CLOSE)
    });

    let otel_layer = if config.otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer(config.service_name.clone());

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .with(otel_layer)
        .try_init()?;
    Ok(())
}

/// Flush pending spans and shut down the OpenTelemetry tracer provider.
///
/// No-op when OTel was not enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TracingConfig::default();
        assert!(!config.json);
        assert!(!config.otel);
        assert_eq!(config.service_name, "authflow");
        assert!(config.default_directive.contains("sqlx=warn"));
    }

    #[test]
    fn test_filter_prefers_rust_log() {
        let filter = build_filter(Some("authflow_core=trace".to_string()), "warn").unwrap();
        assert!(filter.to_string().contains("authflow_core=trace"));

        let filter = build_filter(Some("  ".to_string()), "warn").unwrap();
        assert_eq!(filter.to_string(), "warn");

        let filter = build_filter(None, "authflow_infra=debug").unwrap();
        assert!(filter.to_string().contains("authflow_infra=debug"));
    }

    #[test]
    fn test_invalid_directive_is_an_error() {
        assert!(build_filter(None, "authflow_core=loudest").is_err());
    }

    #[test]
    fn test_second_init_fails() {
        let config = TracingConfig::default();
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
        shutdown_tracing();
    }
}
