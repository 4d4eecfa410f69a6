//! HTTP health check.
//!
//! Each probe dials the plugin's own gRPC socket and runs the same calls the
//! API server makes: version/status, then an encrypt/decrypt round trip of
//! a fixed plaintext on every enabled API version.
//!
//! Status codes: `200 ok` on success, `503` when the server cannot be
//! reached or does not answer in time, `500` when it answers wrongly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint as TonicEndpoint, Uri};
use tracing::{info, warn};

use crate::backend::{HEALTH_CHECK_PLAINTEXT, HEALTHZ_OK, same_key_id};
use crate::proto::v1beta1::key_management_service_client::KeyManagementServiceClient as V1Client;
use crate::proto::v1beta1::{
    DecryptRequest as V1DecryptRequest, EncryptRequest as V1EncryptRequest, VersionRequest,
};
use crate::proto::v2::key_management_service_client::KeyManagementServiceClient as V2Client;
use crate::proto::v2::{DecryptRequest, EncryptRequest, StatusRequest};
use crate::utils::Endpoint;
use crate::version::{BUILD_VERSION, KMS_V1_API_VERSION, KMS_V2_API_VERSION, RUNTIME_NAME};

/// Why a probe failed.
#[derive(Error, Debug)]
pub enum HealthError {
    /// Server unreachable, RPC transport failure or deadline exceeded
    #[error("{0}")]
    Unavailable(String),

    /// Server answered with a wrong value or failed a crypto operation
    #[error("{0}")]
    Failed(String),
}

impl HealthError {
    /// HTTP status of the probe response.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Round-trip prober of the local gRPC server.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    endpoint: Endpoint,
    timeout: Duration,
    check_v1: bool,
}

impl HealthChecker {
    /// Prober of the server on `endpoint`; `check_v1` also exercises the
    /// legacy API.
    #[must_use]
    pub fn new(endpoint: Endpoint, timeout: Duration, check_v1: bool) -> Self {
        Self {
            endpoint,
            timeout,
            check_v1,
        }
    }

    /// Run one probe under the configured timeout.
    ///
    /// # Errors
    ///
    /// See [`HealthError`].
    pub async fn check(&self) -> Result<(), HealthError> {
        tokio::time::timeout(self.timeout, self.run())
            .await
            .map_err(|_| HealthError::Unavailable(format!("health check timed out after {:?}", self.timeout)))?
    }

    async fn run(&self) -> Result<(), HealthError> {
        let channel = self.connect().await?;
        if self.check_v1 {
            self.check_v1(channel.clone()).await?;
        }
        self.check_v2(channel).await
    }

    async fn connect(&self) -> Result<Channel, HealthError> {
        let unavailable = |e: tonic::transport::Error| {
            HealthError::Unavailable(format!("failed to connect to {}: {e}", self.endpoint))
        };
        match &self.endpoint {
            Endpoint::Unix(path) => {
                let path = path.clone();
                // The URI is ignored by the connector below.
                TonicEndpoint::from_static("http://[::]:50051")
                    .timeout(self.timeout)
                    .connect_with_connector(tower::service_fn(move |_: Uri| {
                        let path = path.clone();
                        async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
                    }))
                    .await
                    .map_err(unavailable)
            }
            Endpoint::Tcp(addr) => TonicEndpoint::from_shared(format!("http://{addr}"))
                .map_err(unavailable)?
                .timeout(self.timeout)
                .connect()
                .await
                .map_err(unavailable),
        }
    }

    async fn check_v1(&self, channel: Channel) -> Result<(), HealthError> {
        let mut client = V1Client::new(channel);

        let version = client
            .version(VersionRequest {
                version: KMS_V1_API_VERSION.to_string(),
            })
            .await
            .map_err(|s| HealthError::Unavailable(format!("failed to get version: {}", s.message())))?
            .into_inner();
        if version.version != KMS_V1_API_VERSION
            || version.runtime_name != RUNTIME_NAME
            || version.runtime_version != BUILD_VERSION
        {
            return Err(HealthError::Failed(format!(
                "unexpected version response: version {:?}, runtime name {:?}, runtime version {:?}",
                version.version, version.runtime_name, version.runtime_version
            )));
        }

        let cipher = client
            .encrypt(V1EncryptRequest {
                version: KMS_V1_API_VERSION.to_string(),
                plain: HEALTH_CHECK_PLAINTEXT.to_vec(),
            })
            .await
            .map_err(|s| HealthError::Failed(format!("failed to encrypt: {}", s.message())))?
            .into_inner()
            .cipher;
        let plain = client
            .decrypt(V1DecryptRequest {
                version: KMS_V1_API_VERSION.to_string(),
                cipher,
            })
            .await
            .map_err(|s| HealthError::Failed(format!("failed to decrypt: {}", s.message())))?
            .into_inner()
            .plain;
        if plain != HEALTH_CHECK_PLAINTEXT {
            return Err(HealthError::Failed(
                "v1 decrypted text does not match the health check plaintext".to_string(),
            ));
        }
        Ok(())
    }

    async fn check_v2(&self, channel: Channel) -> Result<(), HealthError> {
        let mut client = V2Client::new(channel);

        let status = client
            .status(StatusRequest {})
            .await
            .map_err(|s| HealthError::Unavailable(format!("failed to get status: {}", s.message())))?
            .into_inner();
        if status.version != KMS_V2_API_VERSION || status.healthz != HEALTHZ_OK {
            return Err(HealthError::Failed(format!(
                "unexpected status response: version {:?}, healthz {:?}",
                status.version, status.healthz
            )));
        }

        let uid = uuid::Uuid::new_v4().to_string();
        let encrypted = client
            .encrypt(EncryptRequest {
                plaintext: HEALTH_CHECK_PLAINTEXT.to_vec(),
                uid: uid.clone(),
            })
            .await
            .map_err(|s| HealthError::Failed(format!("failed to encrypt: {}", s.message())))?
            .into_inner();
        if !same_key_id(&encrypted.key_id, &status.key_id) {
            return Err(HealthError::Failed(format!(
                "key id {} from encrypt does not match key id {} from status",
                encrypted.key_id, status.key_id
            )));
        }

        let plaintext = client
            .decrypt(DecryptRequest {
                ciphertext: encrypted.ciphertext,
                uid,
                key_id: encrypted.key_id,
                annotations: encrypted.annotations,
            })
            .await
            .map_err(|s| HealthError::Failed(format!("failed to decrypt: {}", s.message())))?
            .into_inner()
            .plaintext;
        if plaintext != HEALTH_CHECK_PLAINTEXT {
            return Err(HealthError::Failed(
                "v2 decrypted text does not match the health check plaintext".to_string(),
            ));
        }
        Ok(())
    }
}

async fn probe(State(checker): State<Arc<HealthChecker>>) -> (StatusCode, String) {
    match checker.check().await {
        Ok(()) => (StatusCode::OK, HEALTHZ_OK.to_string()),
        Err(e) => {
            warn!(error = %e, "health check failed");
            (e.status_code(), e.to_string())
        }
    }
}

/// Router running a full probe on `path`.
pub fn router(path: &str, checker: HealthChecker) -> Router {
    Router::new()
        .route(path, get(probe))
        .with_state(Arc::new(checker))
}

/// Router that always answers `200 ok` on `path`.
pub fn always_healthy_router(path: &str) -> Router {
    Router::new().route(path, get(|| async { HEALTHZ_OK }))
}

/// Serve `router` on `addr` until `shutdown` resolves.
///
/// # Errors
///
/// Fails when the address cannot be bound.
pub async fn serve<F>(addr: SocketAddr, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "health check server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
