//! KMS v1beta1 server (legacy).
//!
//! One static key, RSA1_5, no annotations. Kept for API servers that have
//! not moved to v2.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, error, instrument};

use crate::error::KmsError;
use crate::keyvault::{Annotations, EncryptionAlgorithm, KeyVaultClient};
use crate::metrics::{DECRYPT_OPERATION, ENCRYPT_OPERATION, StatsReporter};
use crate::proto::v1beta1::key_management_service_server::KeyManagementService;
use crate::proto::v1beta1::{
    DecryptRequest, DecryptResponse, EncryptRequest, EncryptResponse, VersionRequest,
    VersionResponse,
};
use crate::version::{BUILD_VERSION, KMS_V1_API_VERSION, RUNTIME_NAME};

/// Algorithm of every v1 ciphertext.
pub const V1_ALGORITHM: EncryptionAlgorithm = EncryptionAlgorithm::Rsa15;

/// v1beta1 `KeyManagementService`.
#[derive(Debug, Clone)]
pub struct KeyManagementServiceV1 {
    client: Arc<KeyVaultClient>,
    reporter: StatsReporter,
}

impl KeyManagementServiceV1 {
    /// Server over `client`.
    #[must_use]
    pub fn new(client: Arc<KeyVaultClient>, reporter: StatsReporter) -> Self {
        Self { client, reporter }
    }
}

#[tonic::async_trait]
impl KeyManagementService for KeyManagementServiceV1 {
    async fn version(
        &self,
        _request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        Ok(Response::new(VersionResponse {
            version: KMS_V1_API_VERSION.to_string(),
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version: BUILD_VERSION.to_string(),
        }))
    }

    #[instrument(skip_all)]
    async fn encrypt(
        &self,
        request: Request<EncryptRequest>,
    ) -> Result<Response<EncryptResponse>, Status> {
        let guard = self.reporter.start(ENCRYPT_OPERATION);
        let request = request.into_inner();

        let result = self
            .client
            .encrypt(&request.plain, V1_ALGORITHM)
            .await
            .map_err(KmsError::from);
        guard.finish(&result);

        match result {
            Ok(encrypted) => {
                debug!("encrypt request complete");
                Ok(Response::new(EncryptResponse {
                    cipher: encrypted.ciphertext,
                }))
            }
            Err(e) => {
                error!(error = %e, "failed to encrypt");
                Err(e.into())
            }
        }
    }

    #[instrument(skip_all)]
    async fn decrypt(
        &self,
        request: Request<DecryptRequest>,
    ) -> Result<Response<DecryptResponse>, Status> {
        let guard = self.reporter.start(DECRYPT_OPERATION);
        let request = request.into_inner();

        let result = self
            .client
            .decrypt(
                &request.cipher,
                V1_ALGORITHM,
                KMS_V1_API_VERSION,
                &Annotations::new(),
                "",
            )
            .await
            .map_err(KmsError::from);
        guard.finish(&result);

        match result {
            Ok(plain) => {
                debug!("decrypt request complete");
                Ok(Response::new(DecryptResponse { plain }))
            }
            Err(e) => {
                error!(error = %e, "failed to decrypt");
                Err(e.into())
            }
        }
    }
}
