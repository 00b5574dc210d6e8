use axum::Router;
use service_core::config::{ServiceConfig, ServiceDescriptor};
use service_core::health::{HealthProvider, health_check};
use service_core::middleware::cors::CorsPolicy;
use service_core::server::{self, AppState, RouteTable};

pub const SERVICE: ServiceDescriptor = ServiceDescriptor {
    id: "yet-another-path-planner-api-gateway",
    version: env!("CARGO_PKG_VERSION"),
    default_port: 3002,
    default_telemetry_name: "yapp-api-gateway",
};

pub fn routes() -> RouteTable {
    RouteTable::new().get("/health", health_check)
}

pub fn build_router(config: &ServiceConfig) -> Router {
    server::build_router(
        routes(),
        AppState::new(HealthProvider::for_service(&SERVICE)),
        &CorsPolicy::from_config(&config.cors),
    )
}
