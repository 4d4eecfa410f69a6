//! Azure Key Vault backed crypto client.
//!
//! [`KeyVaultClient`] wraps one pinned key version. Every ciphertext it
//! produces is bound to that key through the key id hash and the v2
//! annotations; anything produced by another key is refused.

pub mod annotations;
pub mod cloud;
pub mod error;
pub mod mock;
pub mod transport;

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

pub use annotations::{AnnotationError, Annotations};
pub use cloud::AzureCloud;
pub use error::KeyVaultError;
pub use mock::MockKeyVault;
pub use transport::{
    CreateKeyParameters, HttpKeyVaultTransport, KeyBundle, KeyOperationResult, KeyVaultTransport,
};

use crate::auth::CredentialResolver;
use crate::config::{AzureConfig, ProxyTarget};
use crate::utils::sanitize_string;
use crate::version::KMS_V2_API_VERSION;

/// Key wrapping algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionAlgorithm {
    /// RSAES-PKCS1-v1_5, used by the v1 API
    Rsa15,
    /// RSAES-OAEP with SHA-256, used by the v2 API
    RsaOaep256,
}

impl EncryptionAlgorithm {
    /// Key Vault algorithm name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rsa15 => "RSA1_5",
            Self::RsaOaep256 => "RSA-OAEP-256",
        }
    }
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The pinned vault/key/version triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyReference {
    /// Canonical vault URL, `https://{name}.{suffix}/`
    pub vault_url: String,
    /// Key name
    pub key_name: String,
    /// Key version
    pub key_version: String,
}

/// Output of a successful encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptResult {
    /// Wrapped data
    pub ciphertext: Vec<u8>,
    /// Key id hash of the key that wrapped it
    pub key_id: String,
    /// Integrity annotations
    pub annotations: Annotations,
}

/// Lower-case hex SHA-256 of `{vault_url}keys/{key_name}/{key_version}`.
///
/// # Errors
///
/// Fails when any part is empty or the vault URL does not parse.
pub fn key_id_hash(vault_url: &str, key_name: &str, key_version: &str) -> Result<String, KeyVaultError> {
    if vault_url.is_empty() || key_name.is_empty() || key_version.is_empty() {
        return Err(KeyVaultError::MissingKeyReference);
    }
    let invalid = |reason: String| KeyVaultError::InvalidUrl {
        url: vault_url.to_string(),
        reason,
    };
    let base = url::Url::parse(vault_url).map_err(|e| invalid(e.to_string()))?;
    let key_url = base
        .join(&format!("keys/{key_name}/{key_version}"))
        .map_err(|e| invalid(e.to_string()))?;
    Ok(hash_key_id(key_url.as_str()))
}

fn hash_key_id(kid: &str) -> String {
    hex::encode(Sha256::digest(kid.as_bytes()))
}

/// Options the client is built from.
#[derive(Debug, Clone, Default)]
pub struct KeyVaultOptions {
    /// Vault name (not URL)
    pub vault_name: String,
    /// Key name
    pub key_name: String,
    /// Key version
    pub key_version: String,
    /// Target a managed HSM instead of a vault
    pub managed_hsm: bool,
    /// Proxy to route through
    pub proxy: Option<ProxyTarget>,
}

/// An authenticated transport to one vault.
pub struct VaultConnection {
    /// Canonical (non-proxied) vault URL
    pub vault_url: String,
    /// Transport for key operations
    pub transport: Arc<dyn KeyVaultTransport>,
}

impl fmt::Debug for VaultConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultConnection")
            .field("vault_url", &self.vault_url)
            .finish_non_exhaustive()
    }
}

impl VaultConnection {
    /// Resolve the vault URL and credential and build the HTTP transport.
    ///
    /// # Errors
    ///
    /// Invalid vault name, unknown cloud, HSM outside the public cloud, or
    /// no usable credential.
    pub fn open(
        azure: &AzureConfig,
        vault_name: &str,
        managed_hsm: bool,
        proxy: Option<&ProxyTarget>,
    ) -> Result<Self, KeyVaultError> {
        let cloud = AzureCloud::from_name(&azure.cloud)?;
        let vault_url = cloud::vault_url(vault_name, managed_hsm, cloud)?;

        let aad_endpoint = cloud::aad_endpoint(cloud, proxy);
        let resolver = CredentialResolver::new(aad_endpoint, proxy.is_some())?;
        let credential = resolver.resolve(azure, cloud.keyvault_resource(managed_hsm))?;
        info!(
            vault_url = %vault_url,
            cloud = %cloud,
            credential = credential.kind().as_str(),
            proxy = proxy.is_some(),
            "connecting to key vault"
        );

        let base_url = match proxy {
            Some(proxy) => cloud::proxied_url(&vault_url, proxy),
            None => vault_url.clone(),
        };
        let transport = HttpKeyVaultTransport::new(base_url, Arc::new(credential), proxy.is_some())?;
        Ok(Self {
            vault_url,
            transport: Arc::new(transport),
        })
    }
}

/// Crypto client bound to one key version.
pub struct KeyVaultClient {
    key: KeyReference,
    key_id_hash: String,
    transport: Arc<dyn KeyVaultTransport>,
}

impl fmt::Debug for KeyVaultClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyVaultClient")
            .field("key", &self.key)
            .field("key_id_hash", &self.key_id_hash)
            .finish_non_exhaustive()
    }
}

impl KeyVaultClient {
    /// Build a client for the configured key.
    ///
    /// Names are sanitized first; vault name, key name and version are all
    /// required.
    ///
    /// # Errors
    ///
    /// See [`VaultConnection::open`] and [`key_id_hash`].
    pub fn new(azure: &AzureConfig, options: &KeyVaultOptions) -> Result<Self, KeyVaultError> {
        let vault_name = sanitize_string(&options.vault_name);
        let key_name = sanitize_string(&options.key_name);
        let key_version = sanitize_string(&options.key_version);
        if vault_name.is_empty() || key_name.is_empty() || key_version.is_empty() {
            return Err(KeyVaultError::MissingKeyReference);
        }

        let connection = VaultConnection::open(azure, &vault_name, options.managed_hsm, options.proxy.as_ref())?;
        Self::with_transport(
            KeyReference {
                vault_url: connection.vault_url,
                key_name,
                key_version,
            },
            connection.transport,
        )
    }

    /// Build a client over an existing transport.
    ///
    /// # Errors
    ///
    /// Fails when the key reference is incomplete or its URL is invalid.
    pub fn with_transport(
        key: KeyReference,
        transport: Arc<dyn KeyVaultTransport>,
    ) -> Result<Self, KeyVaultError> {
        let key_id_hash = key_id_hash(&key.vault_url, &key.key_name, &key.key_version)?;
        debug!(key_name = %key.key_name, key_version = %key.key_version, key_id_hash = %key_id_hash, "pinned key");
        Ok(Self {
            key,
            key_id_hash,
            transport,
        })
    }

    /// Pinned key.
    #[must_use]
    pub fn key(&self) -> &KeyReference {
        &self.key
    }

    /// Hash reported as the key id of every ciphertext.
    #[must_use]
    pub fn key_id_hash(&self) -> &str {
        &self.key_id_hash
    }

    /// Wrap `plaintext` with the pinned key.
    ///
    /// # Errors
    ///
    /// Remote failures, or [`KeyVaultError::KeyIdMismatch`] when the vault
    /// answered with a different key version.
    #[instrument(skip_all, fields(key_name = %self.key.key_name, algorithm = %algorithm))]
    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        algorithm: EncryptionAlgorithm,
    ) -> Result<EncryptResult, KeyVaultError> {
        let value = URL_SAFE_NO_PAD.encode(plaintext);
        let result = self
            .transport
            .encrypt(&self.key.key_name, &self.key.key_version, algorithm, value.as_bytes())
            .await?;

        if hash_key_id(&result.kid) != self.key_id_hash {
            return Err(KeyVaultError::KeyIdMismatch {
                expected: self.key_id_hash.clone(),
                actual: result.kid,
            });
        }

        Ok(EncryptResult {
            ciphertext: result.result,
            key_id: self.key_id_hash.clone(),
            annotations: annotations::remote_annotations(algorithm),
        })
    }

    /// Unwrap `ciphertext`. For the v2 API the request metadata is checked
    /// before the vault is called.
    ///
    /// # Errors
    ///
    /// Annotation violations, remote failures, or an undecodable result.
    #[instrument(skip_all, fields(key_name = %self.key.key_name, algorithm = %algorithm, api_version))]
    pub async fn decrypt(
        &self,
        ciphertext: &[u8],
        algorithm: EncryptionAlgorithm,
        api_version: &str,
        annotations: &Annotations,
        key_id: &str,
    ) -> Result<Vec<u8>, KeyVaultError> {
        if api_version == KMS_V2_API_VERSION {
            annotations::validate_remote(annotations, key_id, &self.key_id_hash, algorithm)?;
        }

        let result = self
            .transport
            .decrypt(&self.key.key_name, &self.key.key_version, algorithm, ciphertext)
            .await?;

        URL_SAFE_NO_PAD
            .decode(&result.result)
            .map_err(|e| KeyVaultError::Decode(format!("decrypted value is not base64url: {e}")))
    }
}
