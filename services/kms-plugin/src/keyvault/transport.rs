//! Key Vault data plane REST transport.
//!
//! Only the handful of key operations the plugin needs: encrypt, decrypt,
//! get and create. Binary values travel as unpadded base64url in JSON; this
//! module owns that layer so callers deal in bytes. No retries happen here.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use kms_common::{HttpConfig, build_http_client};
use reqwest::{Method, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::EncryptionAlgorithm;
use super::error::KeyVaultError;
use crate::auth::{Credential, PROXY_TARGET_HEADER, TARGET_KEY_VAULT};
use crate::version::user_agent;

/// Data plane API version.
pub const API_VERSION: &str = "7.4";

/// Result of an encrypt or decrypt call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOperationResult {
    /// Full key identifier of the key version that did the work
    pub kid: String,
    /// Operation output
    pub result: Vec<u8>,
}

/// Public part of a key as returned by get/create.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyBundle {
    /// JSON web key
    pub key: JsonWebKey,
    /// Key attributes
    #[serde(default)]
    pub attributes: KeyAttributes,
}

/// Subset of a JSON web key.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonWebKey {
    /// `https://{vault}/keys/{name}/{version}`
    pub kid: String,
    /// Key type
    #[serde(default)]
    pub kty: String,
    /// Permitted operations
    #[serde(default)]
    pub key_ops: Vec<String>,
}

/// Subset of the key attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyAttributes {
    /// Whether the key can be used
    #[serde(default)]
    pub enabled: bool,
}

impl KeyBundle {
    /// Version segment of the key id.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.key
            .kid
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|v| !v.is_empty())
    }
}

/// Body of a create-key request.
#[derive(Debug, Clone, Serialize)]
pub struct CreateKeyParameters {
    /// Key type
    pub kty: String,
    /// RSA modulus size
    pub key_size: u32,
    /// Permitted operations
    pub key_ops: Vec<String>,
    /// Initial attributes
    pub attributes: KeyAttributes,
}

impl Default for CreateKeyParameters {
    fn default() -> Self {
        Self {
            kty: "RSA".to_string(),
            key_size: 2048,
            key_ops: vec!["encrypt".to_string(), "decrypt".to_string()],
            attributes: KeyAttributes { enabled: true },
        }
    }
}

/// Key operations used by the plugin.
#[async_trait]
pub trait KeyVaultTransport: Send + Sync {
    /// Encrypt `value` with a key version.
    async fn encrypt(
        &self,
        key_name: &str,
        key_version: &str,
        algorithm: EncryptionAlgorithm,
        value: &[u8],
    ) -> Result<KeyOperationResult, KeyVaultError>;

    /// Decrypt `value` with a key version.
    async fn decrypt(
        &self,
        key_name: &str,
        key_version: &str,
        algorithm: EncryptionAlgorithm,
        value: &[u8],
    ) -> Result<KeyOperationResult, KeyVaultError>;

    /// Fetch a key; `None` version means latest, `Ok(None)` means not found.
    async fn get_key(
        &self,
        key_name: &str,
        key_version: Option<&str>,
    ) -> Result<Option<KeyBundle>, KeyVaultError>;

    /// Create a new key (or a new version of it).
    async fn create_key(
        &self,
        key_name: &str,
        parameters: &CreateKeyParameters,
    ) -> Result<KeyBundle, KeyVaultError>;
}

#[derive(Serialize)]
struct KeyOperationsParameters<'a> {
    alg: &'a str,
    value: String,
}

#[derive(Deserialize)]
struct KeyOperationResponse {
    #[serde(default)]
    kid: String,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// `reqwest` implementation of [`KeyVaultTransport`].
pub struct HttpKeyVaultTransport {
    http: reqwest::Client,
    base_url: String,
    credential: Arc<Credential>,
}

impl std::fmt::Debug for HttpKeyVaultTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpKeyVaultTransport")
            .field("base_url", &self.base_url)
            .field("credential", &self.credential)
            .finish_non_exhaustive()
    }
}

impl HttpKeyVaultTransport {
    /// Transport for the vault at `base_url` (already proxied when in proxy
    /// mode).
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        credential: Arc<Credential>,
        proxy_mode: bool,
    ) -> Result<Self, KeyVaultError> {
        let mut config = HttpConfig::default().with_user_agent(user_agent());
        if proxy_mode {
            config = config.with_header(PROXY_TARGET_HEADER, TARGET_KEY_VAULT);
        }
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self {
            http: build_http_client(&config)?,
            base_url,
            credential,
        })
    }

    /// Root URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<Option<T>, KeyVaultError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        let authorization = self.credential.authorization().await?;

        let mut request = self
            .http
            .request(method, &url)
            .query(&[("api-version", API_VERSION)])
            .header(reqwest::header::AUTHORIZATION, authorization.expose_secret());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(path, status = status.as_u16(), "keyvault response");

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_success() {
            return Ok(Some(response.json().await?));
        }

        if status == StatusCode::UNAUTHORIZED {
            // Next call fetches a fresh token.
            self.credential.invalidate().await;
        }
        let text = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorEnvelope>(&text) {
            Ok(envelope) => (envelope.error.code, envelope.error.message),
            Err(_) => (String::new(), text),
        };
        warn!(path, status = status.as_u16(), code = %code, "keyvault request failed");
        Err(KeyVaultError::Remote {
            status: status.as_u16(),
            code,
            message,
        })
    }

    async fn key_operation(
        &self,
        operation: &str,
        key_name: &str,
        key_version: &str,
        algorithm: EncryptionAlgorithm,
        value: &[u8],
    ) -> Result<KeyOperationResult, KeyVaultError> {
        let path = format!("keys/{key_name}/{key_version}/{operation}");
        let body = KeyOperationsParameters {
            alg: algorithm.as_str(),
            value: URL_SAFE_NO_PAD.encode(value),
        };
        let response: KeyOperationResponse = self
            .send(Method::POST, &path, Some(&body))
            .await?
            .ok_or_else(|| KeyVaultError::Remote {
                status: StatusCode::NOT_FOUND.as_u16(),
                code: "KeyNotFound".to_string(),
                message: format!("key {key_name}/{key_version} not found"),
            })?;

        let result = URL_SAFE_NO_PAD
            .decode(response.value.trim_end_matches('='))
            .map_err(|e| KeyVaultError::Decode(format!("{operation} result: {e}")))?;
        Ok(KeyOperationResult {
            kid: response.kid,
            result,
        })
    }
}

#[async_trait]
impl KeyVaultTransport for HttpKeyVaultTransport {
    #[instrument(skip(self, value), fields(vault = %self.base_url))]
    async fn encrypt(
        &self,
        key_name: &str,
        key_version: &str,
        algorithm: EncryptionAlgorithm,
        value: &[u8],
    ) -> Result<KeyOperationResult, KeyVaultError> {
        self.key_operation("encrypt", key_name, key_version, algorithm, value)
            .await
    }

    #[instrument(skip(self, value), fields(vault = %self.base_url))]
    async fn decrypt(
        &self,
        key_name: &str,
        key_version: &str,
        algorithm: EncryptionAlgorithm,
        value: &[u8],
    ) -> Result<KeyOperationResult, KeyVaultError> {
        self.key_operation("decrypt", key_name, key_version, algorithm, value)
            .await
    }

    async fn get_key(
        &self,
        key_name: &str,
        key_version: Option<&str>,
    ) -> Result<Option<KeyBundle>, KeyVaultError> {
        let path = match key_version {
            Some(version) => format!("keys/{key_name}/{version}"),
            None => format!("keys/{key_name}"),
        };
        self.send::<(), KeyBundle>(Method::GET, &path, None).await
    }

    async fn create_key(
        &self,
        key_name: &str,
        parameters: &CreateKeyParameters,
    ) -> Result<KeyBundle, KeyVaultError> {
        let path = format!("keys/{key_name}/create");
        match self.send(Method::POST, &path, Some(parameters)).await {
            Ok(Some(bundle)) => Ok(bundle),
            Ok(None) => Err(KeyVaultError::Remote {
                status: StatusCode::NOT_FOUND.as_u16(),
                code: "NotFound".to_string(),
                message: format!("vault rejected creation of key {key_name}"),
            }),
            Err(KeyVaultError::Remote { status: 409, .. }) => Err(KeyVaultError::Conflict {
                key_name: key_name.to_string(),
            }),
            Err(e) => Err(e),
        }
    }
}
