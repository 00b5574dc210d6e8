use crate::error::AppError;
use config::{Config as Cfg, Environment, Map};
use serde::Deserialize;
use std::ffi::OsString;
use std::time::Duration;

/// Origin allowed by the CORS gate when neither `CORS_ORIGIN` nor
/// `FRONTEND_URL` is set.
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:3000";

pub const DEFAULT_LOG_LEVEL: &str = "info";

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(5000);

/// Compile-time identity of a service binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Identifier reported in health responses.
    pub id: &'static str,
    /// Build version, normally `env!("CARGO_PKG_VERSION")` of the service crate.
    pub version: &'static str,
    pub default_port: u16,
    /// Telemetry `service.name` used when `OTEL_SERVICE_NAME` is unset.
    pub default_telemetry_name: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub port: u16,
    pub log_level: String,
    pub cors: CorsConfig,
    pub tracing: TracingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsConfig {
    /// A single origin, or `*`.
    pub origin: String,
    pub credentials: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// True exactly when `endpoint` is set.
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub service_name: String,
    pub shutdown_timeout: Duration,
}

impl TracingConfig {
    pub fn disabled(service_name: impl Into<String>) -> Self {
        Self::from_endpoint(None, service_name)
    }

    pub fn from_endpoint(endpoint: Option<String>, service_name: impl Into<String>) -> Self {
        Self {
            enabled: endpoint.is_some(),
            endpoint,
            service_name: service_name.into(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Every variable the services read. Anything else in the environment is
/// never looked at.
pub const RECOGNIZED_VARS: [&str; 7] = [
    "PORT",
    "CORS_ORIGIN",
    "FRONTEND_URL",
    "OTEL_EXPORTER_OTLP_ENDPOINT",
    "OTEL_SERVICE_NAME",
    "OTEL_SHUTDOWN_TIMEOUT_MS",
    "LOG_LEVEL",
];

/// Raw view of the recognized environment variables. Keys arrive lowercased.
#[derive(Debug, Default, Deserialize)]
struct EnvSettings {
    port: Option<u16>,
    cors_origin: Option<String>,
    frontend_url: Option<String>,
    otel_exporter_otlp_endpoint: Option<String>,
    otel_service_name: Option<String>,
    otel_shutdown_timeout_ms: Option<u64>,
    log_level: Option<String>,
}

impl ServiceConfig {
    /// Reads `.env` and the process environment.
    pub fn load(descriptor: &ServiceDescriptor) -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        Self::from_vars(descriptor, recognized_vars(std::env::vars_os()))
    }

    /// Resolves the configuration from an explicit variable map instead of the
    /// process environment.
    pub fn from_vars<I, K, V>(descriptor: &ServiceDescriptor, vars: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let source: Map<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        Self::from_environment(descriptor, Environment::default().source(Some(source)))
    }

    fn from_environment(
        descriptor: &ServiceDescriptor,
        environment: Environment,
    ) -> Result<Self, AppError> {
        let settings: EnvSettings = Cfg::builder()
            .add_source(environment.ignore_empty(true))
            .build()?
            .try_deserialize()?;

        let config = Self::resolve(descriptor, settings);
        config.validate()?;
        Ok(config)
    }

    fn resolve(descriptor: &ServiceDescriptor, settings: EnvSettings) -> Self {
        let origin = settings
            .cors_origin
            .or(settings.frontend_url)
            .unwrap_or_else(|| DEFAULT_CORS_ORIGIN.to_string());

        let service_name = settings
            .otel_service_name
            .unwrap_or_else(|| descriptor.default_telemetry_name.to_string());

        let mut tracing =
            TracingConfig::from_endpoint(settings.otel_exporter_otlp_endpoint, service_name);
        if let Some(ms) = settings.otel_shutdown_timeout_ms {
            tracing.shutdown_timeout = Duration::from_millis(ms);
        }

        Self {
            port: settings.port.unwrap_or(descriptor.default_port),
            log_level: settings
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            cors: CorsConfig {
                origin,
                credentials: true,
            },
            tracing,
        }
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.tracing.shutdown_timeout.is_zero() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "OTEL_SHUTDOWN_TIMEOUT_MS must be positive"
            )));
        }

        Ok(())
    }
}

/// Keeps the recognized variables. Entries that are not valid UTF-8 are
/// dropped, so unrelated junk in the environment cannot stop startup.
pub fn recognized_vars<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| {
            let key = key.into_string().ok()?;
            if !RECOGNIZED_VARS.contains(&key.as_str()) {
                return None;
            }
            match value.into_string() {
                Ok(value) => Some((key, value)),
                Err(_) => {
                    tracing::warn!(variable = %key, "Ignoring non UTF-8 environment value");
                    None
                }
            }
        })
        .collect()
}
