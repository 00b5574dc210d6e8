use opentelemetry_sdk::trace::Tracer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the process-wide subscriber: env filter, JSON output, and the
/// OpenTelemetry bridge when a tracer is supplied.
///
/// `RUST_LOG` wins over `log_level`. A second call leaves the first
/// subscriber in place.
pub fn init_tracing(log_level: &str, tracer: Option<Tracer>) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let telemetry = tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(telemetry)
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true),
        )
        .try_init();

    if let Err(e) = result {
        eprintln!("Failed to install tracing subscriber: {}", e);
    }
}
