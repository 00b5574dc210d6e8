//! service-core: Shared infrastructure for the path planner services.
pub mod config;
pub mod error;
pub mod health;
pub mod middleware;
pub mod observability;
pub mod server;
pub mod shutdown;

pub use axum;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tracing;
