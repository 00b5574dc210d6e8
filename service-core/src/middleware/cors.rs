//! Cross-origin policy gate.
//!
//! The gate only decorates responses and never rejects a request. A configured
//! origin is sent verbatim as `Access-Control-Allow-Origin` whatever `Origin`
//! the request carries, so a browser on another origin withholds the
//! response. Preflight `OPTIONS` requests are answered directly with an
//! empty `200`.

use axum::http::{HeaderValue, Method};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};

use crate::config::{CorsConfig, DEFAULT_CORS_ORIGIN};

const WILDCARD: &str = "*";

const ALLOWED_METHODS: [Method; 6] = [
    Method::GET,
    Method::HEAD,
    Method::PUT,
    Method::PATCH,
    Method::POST,
    Method::DELETE,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigin {
    Any,
    Exact(HeaderValue),
}

#[derive(Debug, Clone)]
pub struct CorsPolicy {
    origin: AllowedOrigin,
    credentials: bool,
}

impl CorsPolicy {
    pub fn from_config(config: &CorsConfig) -> Self {
        let origin = match config.origin.trim() {
            WILDCARD => AllowedOrigin::Any,
            origin => AllowedOrigin::Exact(origin.parse::<HeaderValue>().unwrap_or_else(|e| {
                tracing::error!(
                    "Invalid CORS origin '{}': {}. Using fallback {}.",
                    origin,
                    e,
                    DEFAULT_CORS_ORIGIN
                );
                HeaderValue::from_static(DEFAULT_CORS_ORIGIN)
            })),
        };

        Self {
            origin,
            credentials: config.credentials,
        }
    }

    pub fn origin(&self) -> &AllowedOrigin {
        &self.origin
    }

    pub fn credentials(&self) -> bool {
        self.credentials
    }

    pub fn layer(&self) -> CorsLayer {
        let allow_origin = match (&self.origin, self.credentials) {
            (AllowedOrigin::Exact(origin), _) => AllowOrigin::exact(origin.clone()),
            // Credentialed responses may not carry a literal `*`.
            (AllowedOrigin::Any, true) => AllowOrigin::mirror_request(),
            (AllowedOrigin::Any, false) => AllowOrigin::any(),
        };

        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_credentials(self.credentials)
            .allow_methods(ALLOWED_METHODS)
            .allow_headers(AllowHeaders::mirror_request())
    }
}
