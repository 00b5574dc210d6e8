//! HTTP front door shared by the services.
//!
//! Each service declares an explicit [`RouteTable`]; [`build_router`] wires it
//! behind the CORS gate, request ids and the trace layer.

use std::net::SocketAddr;

use axum::{
    Router,
    handler::Handler,
    http::{Method, Uri},
    middleware::from_fn,
    routing::{MethodRouter, get},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::AppError;
use crate::health::HealthProvider;
use crate::middleware::cors::CorsPolicy;
use crate::middleware::tracing::{make_request_span, request_id_middleware};

/// State shared by every handler. Read-only.
#[derive(Debug, Clone)]
pub struct AppState {
    pub health: HealthProvider,
}

impl AppState {
    pub fn new(health: HealthProvider) -> Self {
        Self { health }
    }
}

struct RouteEntry {
    method: Method,
    path: &'static str,
    handler: MethodRouter<AppState>,
}

/// Ordered (method, path) -> handler table.
#[derive(Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<H, T>(mut self, path: &'static str, handler: H) -> Self
    where
        H: Handler<T, AppState>,
        T: 'static,
    {
        self.entries.push(RouteEntry {
            method: Method::GET,
            path,
            handler: get(handler),
        });
        self
    }

    pub fn routes(&self) -> impl Iterator<Item = (&Method, &'static str)> + '_ {
        self.entries.iter().map(|entry| (&entry.method, entry.path))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn build_router(routes: RouteTable, state: AppState, cors: &CorsPolicy) -> Router {
    let mut router = Router::new();
    for entry in routes.entries {
        tracing::debug!(method = %entry.method, path = entry.path, "Registering route");
        router = router.route(entry.path, entry.handler);
    }

    router
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(make_request_span))
        .layer(from_fn(request_id_middleware))
        .layer(cors.layer())
}

async fn not_found(method: Method, uri: Uri) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Cannot {} {}", method, uri.path()))
}

pub async fn bind(port: u16) -> Result<TcpListener, AppError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
        e
    })?;
    tracing::info!(address = %addr, "Listening");
    Ok(listener)
}

/// Serves until `shutdown` is cancelled, then drains open connections.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| {
            tracing::error!("Server error: {}", e);
            AppError::Io(e)
        })
}
