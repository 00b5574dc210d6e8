use backend::{build_router, SERVICE};
use service_core::config::ServiceConfig;
use service_core::error::AppError;
use service_core::observability::init_observability;
use service_core::{server, shutdown};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = ServiceConfig::load(&SERVICE).map_err(|e| {
        eprintln!("Failed to read configuration: {}", e);
        e
    })?;

    let telemetry = init_observability(&config);

    tracing::info!(
        service = SERVICE.id,
        version = SERVICE.version,
        port = config.port,
        cors_origin = %config.cors.origin,
        "Starting backend service"
    );

    let app = build_router(&config);
    let listener = server::bind(config.port).await?;
    let (shutdown_token, _signals) = shutdown::spawn_signal_listener();

    let served = server::serve(listener, app, shutdown_token).await;

    telemetry.shutdown().await;
    served?;

    tracing::info!("Service shutdown complete");
    Ok(())
}
