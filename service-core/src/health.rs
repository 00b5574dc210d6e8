//! Liveness reporting shared by every service.
//!
//! The report is built fresh for each request from two process-start constants
//! (service id and version) and the wall clock. There is no degraded variant:
//! if the handler runs, the service is reachable.

use axum::{Json, extract::State};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ServiceDescriptor;
use crate::server::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    /// ISO-8601 UTC instant with millisecond precision, e.g. `2024-01-01T00:00:00.000Z`.
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthProvider {
    service: &'static str,
    version: &'static str,
}

impl HealthProvider {
    pub fn new(service: &'static str, version: &'static str) -> Self {
        Self { service, version }
    }

    pub fn for_service(descriptor: &ServiceDescriptor) -> Self {
        Self::new(descriptor.id, descriptor.version)
    }

    pub fn get_health(&self) -> HealthReport {
        self.report_at(Utc::now())
    }

    pub fn report_at(&self, now: DateTime<Utc>) -> HealthReport {
        HealthReport {
            status: HealthStatus::Ok,
            service: self.service.to_string(),
            version: self.version.to_string(),
            timestamp: format_timestamp(now),
        }
    }
}

/// Canonical timestamp form. Re-parsing the output and formatting it again
/// yields the same string.
pub fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.health.get_health())
}
