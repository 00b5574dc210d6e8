//! Trace exporter lifecycle.
//!
//! A [`Telemetry`] value owns the exporter pipeline for the lifetime of the
//! process. It is built once at startup and shut down once after the server
//! has drained:
//!
//! ```text
//! Disabled (no endpoint)            Starting -> Running -> ShuttingDown -> Stopped
//! ```
//!
//! Nothing in here may fail the service. Construction errors are returned to
//! the bootstrap, which logs them and carries on with a disabled instance;
//! flush errors and timeouts are logged and reported as a [`ShutdownOutcome`].

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, runtime, trace as sdktrace};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::{DEFAULT_SHUTDOWN_TIMEOUT, TracingConfig};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize trace exporter: {0}")]
    Init(String),

    #[error("failed to flush trace exporter: {0}")]
    Flush(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryState {
    Disabled,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// Result of a [`Telemetry::shutdown`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Telemetry was never running; nothing to release.
    NotRunning,
    /// Another call already owns the shutdown.
    AlreadyStopping,
    Flushed,
    FlushFailed,
    TimedOut,
}

/// A running export pipeline that can be flushed and released exactly once.
///
/// `shutdown` may block; it always runs on a dedicated thread.
pub trait ExportPipeline: Send + 'static {
    fn shutdown(self: Box<Self>) -> Result<(), TelemetryError>;
}

impl ExportPipeline for sdktrace::TracerProvider {
    fn shutdown(self: Box<Self>) -> Result<(), TelemetryError> {
        let failures: Vec<String> = self
            .force_flush()
            .into_iter()
            .filter_map(Result::err)
            .map(|e| e.to_string())
            .collect();

        // Dropping the last handle shuts the span processors down.
        drop(self);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TelemetryError::Flush(failures.join("; ")))
        }
    }
}

/// What a pipeline builder hands back: the pipeline to own and, optionally, a
/// tracer for the `tracing` bridge.
pub struct InstalledPipeline {
    pub pipeline: Box<dyn ExportPipeline>,
    pub tracer: Option<sdktrace::Tracer>,
}

struct Lifecycle {
    state: TelemetryState,
    pipeline: Option<Box<dyn ExportPipeline>>,
}

pub struct Telemetry {
    lifecycle: Mutex<Lifecycle>,
    tracer: Option<sdktrace::Tracer>,
    endpoint: Option<String>,
    shutdown_timeout: Duration,
}

impl Telemetry {
    /// An instance with no exporter and no shutdown work.
    pub fn disabled() -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle {
                state: TelemetryState::Disabled,
                pipeline: None,
            }),
            tracer: None,
            endpoint: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Starts the OTLP/gRPC exporter when an endpoint is configured.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: &TracingConfig) -> Result<Self, TelemetryError> {
        Self::start_with(config, build_otlp_pipeline)
    }

    /// Like [`Telemetry::start`], with a caller-supplied pipeline builder. The
    /// builder is not invoked when telemetry is disabled.
    pub fn start_with<F>(config: &TracingConfig, build: F) -> Result<Self, TelemetryError>
    where
        F: FnOnce(&str, &str) -> Result<InstalledPipeline, TelemetryError>,
    {
        let endpoint = match (&config.endpoint, config.enabled) {
            (Some(endpoint), true) => endpoint,
            _ => return Ok(Self::disabled()),
        };

        let mut telemetry = Self {
            lifecycle: Mutex::new(Lifecycle {
                state: TelemetryState::Starting,
                pipeline: None,
            }),
            tracer: None,
            endpoint: Some(endpoint.clone()),
            shutdown_timeout: config.shutdown_timeout,
        };

        let installed = build(endpoint, &config.service_name)?;

        telemetry.tracer = installed.tracer;
        let lifecycle = telemetry
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        lifecycle.pipeline = Some(installed.pipeline);
        lifecycle.state = TelemetryState::Running;

        Ok(telemetry)
    }

    pub fn state(&self) -> TelemetryState {
        self.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == TelemetryState::Running
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Tracer for the `tracing-opentelemetry` layer, when running.
    pub fn tracer(&self) -> Option<sdktrace::Tracer> {
        self.tracer.clone()
    }

    /// Flushes buffered spans and releases the exporter.
    ///
    /// Only the first call on a running instance does any work; the flush is
    /// abandoned after the configured timeout. Never fails.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        let pipeline = {
            let mut lifecycle = self.lock();
            match lifecycle.state {
                TelemetryState::Disabled => return ShutdownOutcome::NotRunning,
                TelemetryState::Starting
                | TelemetryState::ShuttingDown
                | TelemetryState::Stopped => return ShutdownOutcome::AlreadyStopping,
                TelemetryState::Running => {}
            }
            lifecycle.state = TelemetryState::ShuttingDown;
            lifecycle.pipeline.take()
        };

        let outcome = match pipeline {
            Some(pipeline) => self.flush(pipeline).await,
            None => ShutdownOutcome::Flushed,
        };

        self.lock().state = TelemetryState::Stopped;
        tracing::info!(outcome = ?outcome, "Telemetry shutdown complete");
        outcome
    }

    async fn flush(&self, pipeline: Box<dyn ExportPipeline>) -> ShutdownOutcome {
        // Detached, not `spawn_blocking`: an abandoned flush must not hold up
        // runtime shutdown.
        let (tx, rx) = oneshot::channel();
        let spawned = std::thread::Builder::new()
            .name("telemetry-flush".to_string())
            .spawn(move || {
                let _ = tx.send(pipeline.shutdown());
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to spawn telemetry flush thread");
            return ShutdownOutcome::FlushFailed;
        }

        match tokio::time::timeout(self.shutdown_timeout, rx).await {
            Ok(Ok(Ok(()))) => ShutdownOutcome::Flushed,
            Ok(Ok(Err(e))) => {
                tracing::error!(error = %e, "Telemetry flush failed");
                ShutdownOutcome::FlushFailed
            }
            Ok(Err(_)) => {
                tracing::error!("Telemetry flush thread exited without a result");
                ShutdownOutcome::FlushFailed
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "Telemetry flush timed out, abandoning buffered spans"
                );
                ShutdownOutcome::TimedOut
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("state", &self.state())
            .field("endpoint", &self.endpoint)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

/// Routes errors raised inside the OpenTelemetry SDK (failed batch exports,
/// dropped spans) into `tracing`, so they reach the JSON log instead of
/// plain stderr.
pub fn install_error_handler() {
    if let Err(e) = opentelemetry::global::set_error_handler(report_export_error) {
        tracing::warn!(error = %e, "Failed to install telemetry error handler");
    }
}

fn report_export_error(err: opentelemetry::global::Error) {
    tracing::warn!(error = %err, "Telemetry export error");
}

fn build_otlp_pipeline(
    endpoint: &str,
    service_name: &str,
) -> Result<InstalledPipeline, TelemetryError> {
    install_error_handler();

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| TelemetryError::Init(e.to_string()))?;

    let provider = sdktrace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(sdktrace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
        ])))
        .build();

    let tracer = provider.tracer(service_name.to_string());

    Ok(InstalledPipeline {
        pipeline: Box::new(provider),
        tracer: Some(tracer),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Counters {
        builds: Arc<AtomicUsize>,
        flushes: Arc<AtomicUsize>,
    }

    struct FakePipeline {
        flushes: Arc<AtomicUsize>,
        result: Result<(), String>,
        delay: Duration,
    }

    impl ExportPipeline for FakePipeline {
        fn shutdown(self: Box<Self>) -> Result<(), TelemetryError> {
            let this = *self;
            this.flushes.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(this.delay);
            this.result.map_err(TelemetryError::Flush)
        }
    }

    fn enabled_config() -> TracingConfig {
        let mut config = TracingConfig::from_endpoint(
            Some("http://collector:4317".to_string()),
            "test-service",
        );
        config.shutdown_timeout = Duration::from_millis(200);
        config
    }

    fn start_fake(
        config: &TracingConfig,
        counters: &Counters,
        result: Result<(), String>,
        delay: Duration,
    ) -> Result<Telemetry, TelemetryError> {
        let counters = counters.clone();
        Telemetry::start_with(config, move |endpoint, service_name| {
            assert_eq!(endpoint, "http://collector:4317");
            assert_eq!(service_name, "test-service");
            counters.builds.fetch_add(1, Ordering::SeqCst);
            Ok(InstalledPipeline {
                pipeline: Box::new(FakePipeline {
                    flushes: counters.flushes.clone(),
                    result,
                    delay,
                }),
                tracer: None,
            })
        })
    }

    #[tokio::test]
    async fn disabled_without_endpoint_has_no_side_effects() {
        let counters = Counters::default();
        let telemetry = start_fake(
            &TracingConfig::disabled("test-service"),
            &counters,
            Ok(()),
            Duration::ZERO,
        )
        .unwrap();

        assert_eq!(telemetry.state(), TelemetryState::Disabled);
        assert!(telemetry.tracer().is_none());
        assert_eq!(telemetry.shutdown().await, ShutdownOutcome::NotRunning);
        assert_eq!(telemetry.state(), TelemetryState::Disabled);
        assert_eq!(counters.builds.load(Ordering::SeqCst), 0);
        assert_eq!(counters.flushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn endpoint_starts_pipeline_once() {
        let counters = Counters::default();
        let telemetry = start_fake(&enabled_config(), &counters, Ok(()), Duration::ZERO).unwrap();

        assert_eq!(telemetry.state(), TelemetryState::Running);
        assert!(telemetry.is_running());
        assert_eq!(telemetry.endpoint(), Some("http://collector:4317"));
        assert_eq!(counters.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_shutdown_flushes_once() {
        let counters = Counters::default();
        let telemetry = start_fake(&enabled_config(), &counters, Ok(()), Duration::ZERO).unwrap();

        assert_eq!(telemetry.shutdown().await, ShutdownOutcome::Flushed);
        assert_eq!(telemetry.state(), TelemetryState::Stopped);
        assert_eq!(telemetry.shutdown().await, ShutdownOutcome::AlreadyStopping);
        assert_eq!(counters.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_shutdowns_flush_once() {
        let counters = Counters::default();
        let telemetry = start_fake(
            &enabled_config(),
            &counters,
            Ok(()),
            Duration::from_millis(20),
        )
        .unwrap();

        let (a, b) = tokio::join!(telemetry.shutdown(), telemetry.shutdown());
        let mut outcomes = [a, b];
        outcomes.sort_by_key(|o| *o == ShutdownOutcome::Flushed);
        assert_eq!(
            outcomes,
            [ShutdownOutcome::AlreadyStopping, ShutdownOutcome::Flushed]
        );
        assert_eq!(counters.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(telemetry.state(), TelemetryState::Stopped);
    }

    #[tokio::test]
    async fn init_failure_is_returned_not_raised() {
        let result = Telemetry::start_with(&enabled_config(), |_, _| {
            Err(TelemetryError::Init("collector unreachable".to_string()))
        });

        let err = result.unwrap_err();
        assert!(matches!(err, TelemetryError::Init(_)));
        assert!(err.to_string().contains("collector unreachable"));
    }

    #[tokio::test]
    async fn flush_failure_still_stops() {
        let counters = Counters::default();
        let telemetry = start_fake(
            &enabled_config(),
            &counters,
            Err("export rejected".to_string()),
            Duration::ZERO,
        )
        .unwrap();

        assert_eq!(telemetry.shutdown().await, ShutdownOutcome::FlushFailed);
        assert_eq!(telemetry.state(), TelemetryState::Stopped);
    }

    #[tokio::test]
    async fn slow_flush_is_abandoned_after_timeout() {
        let counters = Counters::default();
        let mut config = enabled_config();
        config.shutdown_timeout = Duration::from_millis(20);
        let telemetry = start_fake(&config, &counters, Ok(()), Duration::from_millis(300)).unwrap();

        let started = std::time::Instant::now();
        assert_eq!(telemetry.shutdown().await, ShutdownOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(telemetry.state(), TelemetryState::Stopped);
    }

    #[tokio::test]
    async fn sdk_provider_without_exporters_flushes_cleanly() {
        let telemetry = Telemetry::start_with(&enabled_config(), |_, service_name| {
            let provider = sdktrace::TracerProvider::builder().build();
            let tracer = provider.tracer(service_name.to_string());
            Ok(InstalledPipeline {
                pipeline: Box::new(provider),
                tracer: Some(tracer),
            })
        })
        .unwrap();

        assert!(telemetry.tracer().is_some());
        assert_eq!(telemetry.shutdown().await, ShutdownOutcome::Flushed);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn sdk_errors_are_logged_through_tracing() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            install_error_handler();
            opentelemetry::global::handle_error(opentelemetry::global::Error::Other(
                "batch export rejected".to_string(),
            ));
        });

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Telemetry export error"));
        assert!(output.contains("batch export rejected"));
        assert!(output.contains("WARN"));
    }
}
