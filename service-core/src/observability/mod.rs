pub mod logging;
pub mod telemetry;
pub mod trace_context;

pub use logging::init_tracing;
pub use telemetry::{
    ShutdownOutcome, Telemetry, TelemetryError, TelemetryState, install_error_handler,
};
pub use trace_context::{TRACEPARENT_HEADER, extract_parent_context, inject_trace_context};

use crate::config::{ServiceConfig, TracingConfig};

/// Starts telemetry (if configured) and installs logging.
///
/// Exporter construction failures are logged once the subscriber exists and
/// the service continues with telemetry disabled.
pub fn init_observability(config: &ServiceConfig) -> Telemetry {
    let (telemetry, init_error) = start_telemetry(&config.tracing, Telemetry::start);

    init_tracing(&config.log_level, telemetry.tracer());

    match (init_error, telemetry.endpoint()) {
        (Some(e), _) => tracing::error!(
            error = %e,
            endpoint = config.tracing.endpoint.as_deref().unwrap_or_default(),
            "Telemetry initialization failed, continuing without trace export"
        ),
        (None, Some(endpoint)) => tracing::info!(
            endpoint = %endpoint,
            service_name = %config.tracing.service_name,
            "Telemetry exporter running"
        ),
        (None, None) => tracing::debug!("Telemetry disabled: OTEL_EXPORTER_OTLP_ENDPOINT not set"),
    }

    telemetry
}

/// Runs `start`, falling back to a disabled instance when it fails. The error
/// is handed back for logging.
fn start_telemetry<F>(config: &TracingConfig, start: F) -> (Telemetry, Option<TelemetryError>)
where
    F: FnOnce(&TracingConfig) -> Result<Telemetry, TelemetryError>,
{
    match start(config) {
        Ok(telemetry) => (telemetry, None),
        Err(e) => (Telemetry::disabled(), Some(e)),
    }
}
