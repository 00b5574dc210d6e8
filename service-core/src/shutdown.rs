//! Termination signal handling.
//!
//! The first `SIGINT`/`SIGTERM` cancels the shutdown token. The handlers stay
//! installed afterwards, so repeated signals are absorbed here instead of
//! killing the process mid-flush.

use tokio::task::JoinHandle;

pub use tokio_util::sync::CancellationToken;

/// Records a received signal. Returns true when this signal started the
/// shutdown, false when one was already in progress.
pub fn on_signal(token: &CancellationToken, signal: &str) -> bool {
    if token.is_cancelled() {
        tracing::info!(signal, "Shutdown already in progress, ignoring signal");
        return false;
    }

    tracing::info!(signal, "Received {}, starting graceful shutdown", signal);
    token.cancel();
    true
}

/// Spawns the signal listener and returns the token it cancels.
pub fn spawn_signal_listener() -> (CancellationToken, JoinHandle<()>) {
    let token = CancellationToken::new();
    let handle = tokio::spawn(listen(token.clone()));
    (token, handle)
}

/// Handlers are registered before this returns, so a signal that arrives
/// while the server is starting is not lost.
#[cfg(unix)]
fn listen(token: CancellationToken) -> impl Future<Output = ()> + Send + 'static {
    use tokio::signal::unix::{SignalKind, signal};

    let streams = signal(SignalKind::terminate())
        .and_then(|terminate| Ok((terminate, signal(SignalKind::interrupt())?)));

    async move {
        let (mut terminate, mut interrupt) = match streams {
            Ok(streams) => streams,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handlers");
                return;
            }
        };

        loop {
            let name = tokio::select! {
                received = terminate.recv() => received.map(|_| "SIGTERM"),
                received = interrupt.recv() => received.map(|_| "SIGINT"),
            };

            match name {
                Some(name) => {
                    on_signal(&token, name);
                }
                None => return,
            }
        }
    }
}

#[cfg(not(unix))]
async fn listen(token: CancellationToken) {
    loop {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            return;
        }
        on_signal(&token, "SIGINT");
    }
}
