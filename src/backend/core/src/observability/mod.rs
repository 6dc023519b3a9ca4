//! Observability: Distributed Tracing, Metrics, and Logging.

use opentelemetry_otlp::WithExportConfig;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Initialize the observability stack.
///
/// `RUST_LOG` overrides the configured log level when set.
pub fn init(service_name: &str, config: &ObservabilityConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Set up OpenTelemetry tracing if endpoint is provided
    let telemetry_layer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(
                    opentelemetry_sdk::trace::config()
                        .with_resource(opentelemetry_sdk::Resource::new(vec![
                            opentelemetry::KeyValue::new("service.name", service_name.to_string()),
                        ])),
                )
                .install_batch(opentelemetry_sdk::runtime::Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let json_layer = config
        .json_logging
        .then(|| tracing_subscriber::fmt::layer().json());
    let pretty_layer = (!config.json_logging).then(|| tracing_subscriber::fmt::layer());

    tracing_subscriber::registry()
        .with(telemetry_layer)
        .with(filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()?;

    Ok(())
}

/// Shutdown OpenTelemetry.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Serve Prometheus metrics on `0.0.0.0:{port}` and register descriptions.
pub fn install_prometheus(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    metrics::register_metrics();
    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}

/// Metrics registry and helpers.
pub mod metrics {
    use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    /// Register all metric descriptions.
    pub fn register_metrics() {
        // Dispatcher
        describe_counter!(
            "ingest_dispatch_total",
            "Dispatch requests by outcome (created, already_active, denied)"
        );
        describe_counter!(
            "ingest_dlq_requeued_total",
            "Jobs moved from the dead letter queue back to the queue"
        );
        describe_counter!(
            "ingest_jobs_cancelled_total",
            "Jobs cancelled, by source (operator, platform)"
        );

        // Runner
        describe_counter!("ingest_jobs_claimed_total", "Jobs claimed by runners");
        describe_counter!(
            "ingest_job_outcomes_total",
            "Finished job attempts by outcome"
        );
        describe_counter!(
            "ingest_job_failures_total",
            "Failed job attempts by error category"
        );
        describe_counter!("ingest_job_panics_total", "Job tasks that panicked");
        describe_counter!(
            "ingest_jobs_recovered_total",
            "Stale running jobs failed by recovery"
        );
        describe_gauge!("ingest_jobs_in_flight", "Jobs currently executing");
        describe_histogram!(
            "ingest_job_duration_seconds",
            Unit::Seconds,
            "Duration of a job attempt"
        );

        // Rate limiting
        describe_counter!(
            "ingest_rate_limit_checks_total",
            "Rate limit checks by scope, backend and result"
        );
        describe_counter!(
            "ingest_rate_limit_waits_total",
            "Calls that waited for a rate limit token"
        );
        describe_counter!(
            "ingest_rate_limit_rejections_total",
            "Calls rejected after waiting max_wait for a token"
        );

        // Errors
        describe_counter!(
            "ingest_errors_total",
            "Errors by code, category and retryable"
        );
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_register_metrics_without_recorder() {
        // Descriptions are dropped silently when no recorder is installed.
        super::metrics::register_metrics();
    }
}
