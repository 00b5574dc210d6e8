//! Test helpers for backend integration tests.

#![allow(dead_code)]

use backend::{build_router, SERVICE};
use service_core::config::ServiceConfig;
use service_core::error::AppError;
use service_core::server;
use service_core::shutdown::CancellationToken;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Backend router served on an ephemeral local port.
pub struct TestApp {
    pub address: String,
    shutdown: CancellationToken,
    server: JoinHandle<Result<(), AppError>>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(Vec::<(String, String)>::new()).await
    }

    pub async fn spawn_with<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let config = ServiceConfig::from_vars(&SERVICE, vars).expect("Failed to build config");
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind random port");
        let port = listener.local_addr().unwrap().port();

        let shutdown = CancellationToken::new();
        let server = tokio::spawn(server::serve(
            listener,
            build_router(&config),
            shutdown.clone(),
        ));

        Self {
            address: format!("http://127.0.0.1:{}", port),
            shutdown,
            server,
        }
    }

    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::new()
    }

    pub async fn cleanup(self) {
        self.shutdown.cancel();
        let _ = self.server.await;
    }
}

/// Reserves a free local port for a child process to bind.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("Failed to reserve a port")
}
