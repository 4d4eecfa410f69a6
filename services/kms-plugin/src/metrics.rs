//! Prometheus metrics for the KMS plugin.
//!
//! Every RPC is observed once in the `kms_request` histogram, labelled by
//! operation, status and a stable error category.

use std::net::SocketAddr;
use std::time::Instant;

use axum::Router;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use once_cell::sync::Lazy;
use prometheus::{Encoder, HistogramVec, IntCounter, TextEncoder, register_histogram_vec, register_int_counter};
use tracing::{info, warn};

use crate::config::ConfigError;
use crate::error::{ErrorCategory, KmsError};

/// Operation label of encrypt calls.
pub const ENCRYPT_OPERATION: &str = "encrypt";

/// Operation label of decrypt calls.
pub const DECRYPT_OPERATION: &str = "decrypt";

/// Operation label of v2 status calls.
pub const STATUS_OPERATION: &str = "status";

/// Status label of successful calls.
pub const STATUS_SUCCESS: &str = "success";

/// Status label of failed calls.
pub const STATUS_ERROR: &str = "error";

/// Error label of calls dropped before they finished.
pub const ERROR_CANCELLED: &str = "cancelled";

/// Request latency histogram.
pub static KMS_REQUEST: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "kms_request",
        "Distribution of how long it took for an operation",
        &["operation_type", "status", "error_message"],
        vec![0.1, 0.2, 0.3, 0.4, 0.5, 1.0, 1.5, 2.0, 2.5, 3.0, 5.0, 10.0, 15.0, 30.0]
    )
    .expect("Failed to register kms_request metric")
});

/// Decryptions that needed a retired seed.
pub static STALE_DECRYPTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "kms_stale_decrypt_total",
        "Number of local envelope decryptions served by a retired seed"
    )
    .expect("Failed to register kms_stale_decrypt_total metric")
});

/// Metrics exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsBackend {
    /// Pull based `/metrics` endpoint
    Prometheus,
}

impl MetricsBackend {
    /// Case-insensitive lookup.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnsupportedMetricsBackend`] for anything but prometheus.
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "prometheus" => Ok(Self::Prometheus),
            _ => Err(ConfigError::UnsupportedMetricsBackend(name.to_string())),
        }
    }
}

/// Cheap handle recording into the process-wide collectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsReporter;

impl StatsReporter {
    /// New handle.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Observe one finished request.
    pub fn report_request(&self, operation: &str, status: &str, seconds: f64, error: &str) {
        KMS_REQUEST
            .with_label_values(&[operation, status, error])
            .observe(seconds);
    }

    /// Count a decryption that only a retired seed could open.
    pub fn report_stale_decrypt(&self) {
        STALE_DECRYPTS.inc();
    }

    /// Start timing `operation`; the returned guard reports on drop.
    #[must_use]
    pub fn start(&self, operation: &'static str) -> RequestGuard {
        RequestGuard {
            reporter: *self,
            operation,
            start: Instant::now(),
            outcome: None,
        }
    }
}

/// Times one request and reports it exactly once, when dropped.
///
/// A guard dropped without [`RequestGuard::finish`] (for example because the
/// RPC future was cancelled) is reported as an error.
#[derive(Debug)]
pub struct RequestGuard {
    reporter: StatsReporter,
    operation: &'static str,
    start: Instant,
    outcome: Option<Result<(), ErrorCategory>>,
}

impl RequestGuard {
    /// Record the outcome and report.
    pub fn finish<T>(mut self, result: &Result<T, KmsError>) {
        self.outcome = Some(result.as_ref().map(|_| ()).map_err(KmsError::category));
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let seconds = self.start.elapsed().as_secs_f64();
        let (status, error) = match self.outcome {
            Some(Ok(())) => (STATUS_SUCCESS, ""),
            Some(Err(category)) => (STATUS_ERROR, category.as_str()),
            None => (STATUS_ERROR, ERROR_CANCELLED),
        };
        self.reporter
            .report_request(self.operation, status, seconds, error);
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

/// Router serving `/metrics`.
pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serve the exporter until `shutdown` resolves.
///
/// # Errors
///
/// Fails when the address cannot be bound.
pub async fn serve_metrics<F>(addr: SocketAddr, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    // Make sure the collectors exist before the first scrape.
    Lazy::force(&KMS_REQUEST);
    Lazy::force(&STALE_DECRYPTS);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "metrics exporter listening");
    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(shutdown)
        .await
}
