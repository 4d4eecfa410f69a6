//! KMS v2 server.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, error, info, instrument};

use crate::backend::{DecryptInput, EncryptionBackend};
use crate::metrics::{DECRYPT_OPERATION, ENCRYPT_OPERATION, STATUS_OPERATION, StatsReporter};
use crate::proto::v2::key_management_service_server::KeyManagementService;
use crate::proto::v2::{
    DecryptRequest, DecryptResponse, EncryptRequest, EncryptResponse, StatusRequest,
    StatusResponse,
};
use crate::version::KMS_V2_API_VERSION;

/// v2 `KeyManagementService` over any [`EncryptionBackend`].
#[derive(Clone)]
pub struct KeyManagementServiceV2 {
    backend: Arc<dyn EncryptionBackend>,
    reporter: StatsReporter,
}

impl std::fmt::Debug for KeyManagementServiceV2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManagementServiceV2")
            .field("key_id", &self.backend.key_id())
            .finish_non_exhaustive()
    }
}

impl KeyManagementServiceV2 {
    /// Server over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn EncryptionBackend>, reporter: StatsReporter) -> Self {
        Self { backend, reporter }
    }
}

#[tonic::async_trait]
impl KeyManagementService for KeyManagementServiceV2 {
    #[instrument(skip_all)]
    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let guard = self.reporter.start(STATUS_OPERATION);
        let result = self.backend.status().await;
        guard.finish(&result);

        match result {
            Ok(report) => Ok(Response::new(StatusResponse {
                version: KMS_V2_API_VERSION.to_string(),
                healthz: report.healthz.to_string(),
                key_id: report.key_id,
            })),
            Err(e) => {
                error!(error = %e, "status self-check failed");
                Err(e.into())
            }
        }
    }

    #[instrument(skip_all, fields(uid))]
    async fn encrypt(
        &self,
        request: Request<EncryptRequest>,
    ) -> Result<Response<EncryptResponse>, Status> {
        let guard = self.reporter.start(ENCRYPT_OPERATION);
        let request = request.into_inner();
        tracing::Span::current().record("uid", request.uid.as_str());
        info!("encrypt request started");

        let result = self.backend.encrypt(&request.plaintext, &request.uid).await;
        guard.finish(&result);

        match result {
            Ok(encrypted) => {
                debug!(key_id = %encrypted.key_id, "encrypt request complete");
                Ok(Response::new(EncryptResponse {
                    ciphertext: encrypted.ciphertext,
                    key_id: encrypted.key_id,
                    annotations: encrypted.annotations,
                }))
            }
            Err(e) => {
                error!(error = %e, "failed to encrypt");
                Err(e.into())
            }
        }
    }

    #[instrument(skip_all, fields(uid))]
    async fn decrypt(
        &self,
        request: Request<DecryptRequest>,
    ) -> Result<Response<DecryptResponse>, Status> {
        let guard = self.reporter.start(DECRYPT_OPERATION);
        let request = request.into_inner();
        tracing::Span::current().record("uid", request.uid.as_str());
        info!("decrypt request started");

        let result = self
            .backend
            .decrypt(DecryptInput {
                ciphertext: &request.ciphertext,
                key_id: &request.key_id,
                annotations: &request.annotations,
                uid: &request.uid,
            })
            .await;
        guard.finish(&result);

        match result {
            Ok(plaintext) => {
                debug!("decrypt request complete");
                Ok(Response::new(DecryptResponse { plaintext }))
            }
            Err(e) => {
                error!(error = %e, key_id = %request.key_id, "failed to decrypt");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LocalEnvelope, RemoteKeyVault};
    use crate::envelope::EnvelopeTransformer;
    use crate::keyvault::annotations::{ALGORITHM_ANNOTATION_KEY, VERSION_ANNOTATION_KEY};
    use crate::keyvault::{KeyReference, KeyVaultClient, MockKeyVault};
    use tonic::Code;

    fn remote_server() -> (KeyManagementServiceV2, Arc<MockKeyVault>) {
        let vault = Arc::new(MockKeyVault::new("https://testkv.vault.azure.net/"));
        let client = KeyVaultClient::with_transport(
            KeyReference {
                vault_url: "https://testkv.vault.azure.net/".to_string(),
                key_name: "kek".to_string(),
                key_version: "v1".to_string(),
            },
            vault.clone(),
        )
        .unwrap();
        let backend = RemoteKeyVault::new(Arc::new(client));
        (
            KeyManagementServiceV2::new(Arc::new(backend), StatsReporter::new()),
            vault,
        )
    }

    async fn encrypt(server: &KeyManagementServiceV2, plaintext: &[u8]) -> EncryptResponse {
        server
            .encrypt(Request::new(EncryptRequest {
                plaintext: plaintext.to_vec(),
                uid: "uid-1".to_string(),
            }))
            .await
            .unwrap()
            .into_inner()
    }

    fn decrypt_request(encrypted: &EncryptResponse) -> DecryptRequest {
        DecryptRequest {
            ciphertext: encrypted.ciphertext.clone(),
            uid: "uid-2".to_string(),
            key_id: encrypted.key_id.clone(),
            annotations: encrypted.annotations.clone(),
        }
    }

    #[tokio::test]
    async fn test_status() {
        let (server, vault) = remote_server();
        let status = server
            .status(Request::new(StatusRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(status.version, "v2beta1");
        assert_eq!(status.healthz, "ok");
        assert_eq!(status.key_id.len(), 64);

        vault.set_fail_decrypt(true);
        assert!(server.status(Request::new(StatusRequest {})).await.is_err());
    }

    #[tokio::test]
    async fn test_secret_roundtrip() {
        let (server, _) = remote_server();
        let encrypted = encrypt(&server, b"secret").await;
        assert_eq!(encrypted.annotations[ALGORITHM_ANNOTATION_KEY], b"RSA-OAEP-256");
        assert_eq!(encrypted.annotations[VERSION_ANNOTATION_KEY], b"1");

        let plaintext = server
            .decrypt(Request::new(decrypt_request(&encrypted)))
            .await
            .unwrap()
            .into_inner()
            .plaintext;
        assert_eq!(plaintext, b"secret");
    }

    #[tokio::test]
    async fn test_decrypt_rejections_name_the_check() {
        let (server, vault) = remote_server();
        let encrypted = encrypt(&server, b"secret").await;

        let mut request = decrypt_request(&encrypted);
        request.annotations.clear();
        let status = server.decrypt(Request::new(request)).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("annotations cannot be empty"));

        let mut request = decrypt_request(&encrypted);
        request.key_id = "foreign".to_string();
        let status = server.decrypt(Request::new(request)).await.unwrap_err();
        assert!(status.message().contains("key id foreign does not match"));

        let mut request = decrypt_request(&encrypted);
        request
            .annotations
            .insert(ALGORITHM_ANNOTATION_KEY.to_string(), b"RSA1_5".to_vec());
        let status = server.decrypt(Request::new(request)).await.unwrap_err();
        assert!(status.message().contains("algorithm RSA1_5 does not match"));

        let mut request = decrypt_request(&encrypted);
        request
            .annotations
            .insert(VERSION_ANNOTATION_KEY.to_string(), b"2".to_vec());
        let status = server.decrypt(Request::new(request)).await.unwrap_err();
        assert!(status.message().contains("version 2 does not match"));

        assert_eq!(vault.decrypt_calls(), 0);
    }

    #[tokio::test]
    async fn test_local_envelope_server() {
        let backend = LocalEnvelope::new(
            EnvelopeTransformer::new(vec![3u8; 32]).unwrap(),
            StatsReporter::new(),
        );
        let server = KeyManagementServiceV2::new(Arc::new(backend), StatsReporter::new());

        let status = server
            .status(Request::new(StatusRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(status.key_id, "1");

        let encrypted = encrypt(&server, b"secret").await;
        assert_eq!(encrypted.key_id, "1");
        let plaintext = server
            .decrypt(Request::new(decrypt_request(&encrypted)))
            .await
            .unwrap()
            .into_inner()
            .plaintext;
        assert_eq!(plaintext, b"secret");
    }
}
