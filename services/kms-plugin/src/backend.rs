//! Encryption backends behind the KMS v2 server.
//!
//! The server only sees [`EncryptionBackend`]; configuration decides whether
//! that is a Key Vault key ([`RemoteKeyVault`]) or the local transformer
//! ([`LocalEnvelope`]).

use std::sync::Arc;

use async_trait::async_trait;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::envelope::EnvelopeTransformer;
use crate::error::KmsError;
use crate::keyvault::annotations::{self, AUTHENTICATED_DATA_ANNOTATION_KEY, STATIC_KEY_ID};
use crate::keyvault::{Annotations, EncryptResult, EncryptionAlgorithm, KeyVaultClient};
use crate::metrics::StatsReporter;
use crate::version::KMS_V2_API_VERSION;

/// Plaintext used by the self-test.
pub const HEALTH_CHECK_PLAINTEXT: &[u8] = b"healthcheck";

/// Value of `healthz` in a healthy status.
pub const HEALTHZ_OK: &str = "ok";

/// Fields of a decrypt request.
#[derive(Debug, Clone, Copy)]
pub struct DecryptInput<'a> {
    /// Wrapped data
    pub ciphertext: &'a [u8],
    /// Key id returned at encrypt time
    pub key_id: &'a str,
    /// Annotations returned at encrypt time
    pub annotations: &'a Annotations,
    /// Request id, for logs
    pub uid: &'a str,
}

/// Answer of a successful status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Key id new ciphertexts are bound to
    pub key_id: String,
    /// Always [`HEALTHZ_OK`]
    pub healthz: &'static str,
}

/// Envelope encryption capability used by the v2 server.
#[async_trait]
pub trait EncryptionBackend: Send + Sync {
    /// Key id reported for new ciphertexts.
    fn key_id(&self) -> &str;

    /// Wrap `plaintext`.
    async fn encrypt(&self, plaintext: &[u8], uid: &str) -> Result<EncryptResult, KmsError>;

    /// Check the request metadata, then unwrap.
    async fn decrypt(&self, input: DecryptInput<'_>) -> Result<Vec<u8>, KmsError>;

    /// Prove the backend works.
    async fn status(&self) -> Result<StatusReport, KmsError>;
}

/// Key Vault key with RSA-OAEP-256.
#[derive(Debug, Clone)]
pub struct RemoteKeyVault {
    client: Arc<KeyVaultClient>,
}

impl RemoteKeyVault {
    /// Algorithm used for every v2 ciphertext.
    pub const ALGORITHM: EncryptionAlgorithm = EncryptionAlgorithm::RsaOaep256;

    /// Backend over `client`.
    #[must_use]
    pub fn new(client: Arc<KeyVaultClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EncryptionBackend for RemoteKeyVault {
    fn key_id(&self) -> &str {
        self.client.key_id_hash()
    }

    async fn encrypt(&self, plaintext: &[u8], _uid: &str) -> Result<EncryptResult, KmsError> {
        Ok(self.client.encrypt(plaintext, Self::ALGORITHM).await?)
    }

    async fn decrypt(&self, input: DecryptInput<'_>) -> Result<Vec<u8>, KmsError> {
        Ok(self
            .client
            .decrypt(
                input.ciphertext,
                Self::ALGORITHM,
                KMS_V2_API_VERSION,
                input.annotations,
                input.key_id,
            )
            .await?)
    }

    async fn status(&self) -> Result<StatusReport, KmsError> {
        let encrypted = self.encrypt(HEALTH_CHECK_PLAINTEXT, "").await?;
        let decrypted = self
            .decrypt(DecryptInput {
                ciphertext: &encrypted.ciphertext,
                key_id: &encrypted.key_id,
                annotations: &encrypted.annotations,
                uid: "",
            })
            .await?;

        if decrypted != HEALTH_CHECK_PLAINTEXT {
            return Err(KmsError::SelfCheck(
                "decrypted health check plaintext does not match".to_string(),
            ));
        }
        Ok(StatusReport {
            key_id: encrypted.key_id,
            healthz: HEALTHZ_OK,
        })
    }
}

/// Local HKDF/AES-GCM transformer keyed by the cluster seed.
#[derive(Debug)]
pub struct LocalEnvelope {
    transformer: EnvelopeTransformer,
    reporter: StatsReporter,
}

impl LocalEnvelope {
    /// Backend over `transformer`.
    #[must_use]
    pub fn new(transformer: EnvelopeTransformer, reporter: StatsReporter) -> Self {
        Self {
            transformer,
            reporter,
        }
    }
}

#[async_trait]
impl EncryptionBackend for LocalEnvelope {
    fn key_id(&self) -> &str {
        STATIC_KEY_ID
    }

    async fn encrypt(&self, plaintext: &[u8], uid: &str) -> Result<EncryptResult, KmsError> {
        if uid.is_empty() {
            return Err(KmsError::InvalidRequest(
                "uid is required as authenticated data".to_string(),
            ));
        }
        let ciphertext = self
            .transformer
            .transform_to_storage(plaintext, uid.as_bytes())?;
        Ok(EncryptResult {
            ciphertext,
            key_id: STATIC_KEY_ID.to_string(),
            annotations: annotations::wrapped_annotations(uid.as_bytes()),
        })
    }

    async fn decrypt(&self, input: DecryptInput<'_>) -> Result<Vec<u8>, KmsError> {
        annotations::validate_wrapped(input.annotations, input.key_id)?;
        let authenticated_data = input
            .annotations
            .get(AUTHENTICATED_DATA_ANNOTATION_KEY)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let unwrapped = self
            .transformer
            .transform_from_storage(input.ciphertext, authenticated_data)?;
        if unwrapped.stale {
            warn!(uid = input.uid, "ciphertext was decrypted with a retired seed and should be rewritten");
            self.reporter.report_stale_decrypt();
        } else {
            debug!(uid = input.uid, "decrypted with current seed");
        }
        Ok(unwrapped.plaintext)
    }

    async fn status(&self) -> Result<StatusReport, KmsError> {
        Ok(StatusReport {
            key_id: STATIC_KEY_ID.to_string(),
            healthz: HEALTHZ_OK,
        })
    }
}

/// Constant time key id comparison for callers outside the annotation checks.
#[must_use]
pub fn same_key_id(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyvault::annotations::{ALGORITHM_ANNOTATION_KEY, VERSION_ANNOTATION_KEY};
    use crate::keyvault::{KeyReference, KeyVaultError, MockKeyVault};

    fn remote() -> (RemoteKeyVault, Arc<MockKeyVault>) {
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
        (RemoteKeyVault::new(Arc::new(client)), vault)
    }

    fn local() -> LocalEnvelope {
        LocalEnvelope::new(
            EnvelopeTransformer::new(vec![9u8; 32]).unwrap(),
            StatsReporter::new(),
        )
    }

    #[tokio::test]
    async fn test_remote_status() {
        let (backend, vault) = remote();
        let report = backend.status().await.unwrap();
        assert_eq!(report.key_id, backend.key_id());
        assert_eq!(report.healthz, HEALTHZ_OK);

        vault.set_corrupt_decrypt(true);
        assert!(matches!(backend.status().await, Err(KmsError::SelfCheck(_))));

        vault.set_corrupt_decrypt(false);
        vault.set_fail_encrypt(true);
        assert!(matches!(
            backend.status().await,
            Err(KmsError::KeyVault(KeyVaultError::Remote { .. }))
        ));
    }

    #[tokio::test]
    async fn test_remote_rejects_tampered_annotations() {
        let (backend, _) = remote();
        let encrypted = backend.encrypt(b"secret", "uid").await.unwrap();

        for (key, value) in [
            (ALGORITHM_ANNOTATION_KEY, b"RSA1_5".as_slice()),
            (VERSION_ANNOTATION_KEY, b"2".as_slice()),
        ] {
            let mut tampered = encrypted.annotations.clone();
            tampered.insert(key.to_string(), value.to_vec());
            let err = backend
                .decrypt(DecryptInput {
                    ciphertext: &encrypted.ciphertext,
                    key_id: &encrypted.key_id,
                    annotations: &tampered,
                    uid: "uid",
                })
                .await
                .unwrap_err();
            assert_eq!(err.category().as_str(), "invalid_annotations");
        }
    }

    #[tokio::test]
    async fn test_local_roundtrip_uses_persisted_uid() {
        let backend = local();
        let encrypted = backend.encrypt(b"secret", "encrypt-uid").await.unwrap();
        assert_eq!(encrypted.key_id, STATIC_KEY_ID);
        assert_eq!(
            encrypted.annotations[AUTHENTICATED_DATA_ANNOTATION_KEY],
            b"encrypt-uid"
        );

        let plaintext = backend
            .decrypt(DecryptInput {
                ciphertext: &encrypted.ciphertext,
                key_id: STATIC_KEY_ID,
                annotations: &encrypted.annotations,
                uid: "a-different-decrypt-uid",
            })
            .await
            .unwrap();
        assert_eq!(plaintext, b"secret");
        assert_eq!(backend.status().await.unwrap().key_id, STATIC_KEY_ID);
    }

    #[tokio::test]
    async fn test_local_rejects_empty_uid_and_foreign_key() {
        let backend = local();
        assert!(matches!(
            backend.encrypt(b"secret", "").await,
            Err(KmsError::InvalidRequest(_))
        ));

        let encrypted = backend.encrypt(b"secret", "uid").await.unwrap();
        let err = backend
            .decrypt(DecryptInput {
                ciphertext: &encrypted.ciphertext,
                key_id: "2",
                annotations: &encrypted.annotations,
                uid: "uid",
            })
            .await
            .unwrap_err();
        assert_eq!(err.category().as_str(), "invalid_annotations");
    }

    #[test]
    fn test_same_key_id() {
        assert!(same_key_id("abc", "abc"));
        assert!(!same_key_id("abc", "abd"));
        assert!(!same_key_id("abc", "ab"));
    }
}
