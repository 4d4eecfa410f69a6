//! Credential resolution for the Key Vault data plane.
//!
//! [`CredentialResolver::resolve`] picks exactly one strategy from the
//! Azure config, first match wins:
//! 1. managed identity (user-assigned when an identity id is set)
//! 2. client id + client secret
//! 3. PKCS#12 client certificate + password
//! 4. externally managed dataplane identity file
//!
//! Tokens are cached by [`Credential`] until shortly before they expire.

mod client_certificate;
mod client_secret;
mod dataplane;
mod managed_identity;

pub use client_certificate::{ClientCertificate, ClientCertificateCredential};
pub use client_secret::ClientSecretCredential;
pub use dataplane::{DataplaneIdentity, DataplaneIdentityCredential};
pub use managed_identity::ManagedIdentityCredential;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kms_common::{HttpConfig, PlatformError, build_http_client};
use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::AzureConfig;
use crate::version::user_agent;

/// Header read by the egress proxy to pick a destination.
pub const PROXY_TARGET_HEADER: &str = "x-azure-proxy-target";

/// Proxy destination for identity provider calls.
pub const TARGET_AZURE_ACTIVE_DIRECTORY: &str = "AzureActiveDirectory";

/// Proxy destination for Key Vault calls.
pub const TARGET_KEY_VAULT: &str = "KeyVault";

/// Instance metadata token endpoint.
pub const DEFAULT_IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

const REFRESH_MARGIN: Duration = Duration::from_secs(300);
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

static REDACT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\S{4})(\S|\s)*(\S{4})$").expect("redaction pattern is valid"));

/// Authentication errors.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum AuthError {
    /// Config carries no usable credential
    #[error("no credentials provided for accessing keyvault")]
    NoCredentials,

    /// A credential file could not be read
    #[error("failed to read {path}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// PKCS#12 container could not be decoded
    #[error("failed to decode the client certificate: {0}")]
    Certificate(String),

    /// PKCS#12 container holds a non-RSA key
    #[error("PKCS#12 certificate must contain a RSA private key")]
    NotRsaKey,

    /// Dataplane identity descriptor is malformed
    #[error("invalid identity descriptor {path}: {reason}")]
    InvalidIdentity {
        /// Descriptor path
        path: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// A value required by the selected strategy is missing
    #[error("missing {0} for the selected credential")]
    MissingField(&'static str),

    /// Token endpoint answered with an error
    #[error("token request to {endpoint} failed with {status}: {body}")]
    TokenRequest {
        /// Token endpoint
        endpoint: String,
        /// HTTP status
        status: u16,
        /// Error body (truncated)
        body: String,
    },

    /// Token endpoint could not be reached or answered garbage
    #[error("token request to {endpoint} failed: {reason}")]
    Transport {
        /// Token endpoint
        endpoint: String,
        /// Failure description
        reason: String,
    },

    /// Client assertion could not be signed
    #[error("failed to sign client assertion: {0}")]
    Assertion(String),

    /// HTTP client setup failed
    #[error(transparent)]
    Http(#[from] PlatformError),
}

/// Keep only the first and last four characters of a credential-like value.
///
/// Values shorter than eight characters are fully masked.
#[must_use]
pub fn redact(sensitive: &str) -> String {
    if REDACT.is_match(sensitive) {
        REDACT
            .replace(sensitive, "${1}##### REDACTED #####${3}")
            .into_owned()
    } else {
        "##### REDACTED #####".to_string()
    }
}

/// A bearer token and when it stops being valid.
#[derive(Debug)]
pub struct AccessToken {
    /// Raw token
    pub token: SecretString,
    /// Expiry instant
    pub expires_at: Instant,
}

impl AccessToken {
    /// Token valid for `lifetime` from now.
    #[must_use]
    pub fn new(token: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_at: Instant::now() + lifetime,
        }
    }
}

/// Fetches fresh tokens for one strategy.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Request a new token from the identity provider.
    async fn fetch_token(&self) -> Result<AccessToken, AuthError>;
}

/// Strategy chosen by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// VM managed identity
    ManagedIdentity {
        /// `true` for a user-assigned identity
        user_assigned: bool,
    },
    /// Service principal with client secret
    ClientSecret,
    /// Service principal with certificate
    ClientCertificate,
    /// Externally managed identity descriptor
    DataplaneIdentity,
}

impl CredentialKind {
    /// Label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ManagedIdentity { user_assigned: true } => "user_assigned_managed_identity",
            Self::ManagedIdentity { user_assigned: false } => "system_assigned_managed_identity",
            Self::ClientSecret => "client_secret",
            Self::ClientCertificate => "client_certificate",
            Self::DataplaneIdentity => "dataplane_identity",
        }
    }
}

/// A resolved credential with token caching.
pub struct Credential {
    kind: CredentialKind,
    source: Box<dyn TokenSource>,
    cached: RwLock<Option<AccessToken>>,
    refresh_margin: Duration,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential").field("kind", &self.kind).finish_non_exhaustive()
    }
}

impl Credential {
    /// Wrap a token source.
    #[must_use]
    pub fn new(kind: CredentialKind, source: Box<dyn TokenSource>) -> Self {
        Self {
            kind,
            source,
            cached: RwLock::new(None),
            refresh_margin: REFRESH_MARGIN,
        }
    }

    /// Override how long before expiry a token is refreshed.
    #[must_use]
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Strategy behind this credential.
    #[must_use]
    pub const fn kind(&self) -> CredentialKind {
        self.kind
    }

    /// `Bearer <token>` header value, refreshing the token when needed.
    ///
    /// # Errors
    ///
    /// Propagates token acquisition failures.
    pub async fn authorization(&self) -> Result<SecretString, AuthError> {
        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref().filter(|t| self.is_fresh(t)) {
                return Ok(bearer(token));
            }
        }

        let mut cached = self.cached.write().await;
        if let Some(token) = cached.as_ref().filter(|t| self.is_fresh(t)) {
            return Ok(bearer(token));
        }
        let token = self.source.fetch_token().await?;
        debug!(
            credential = self.kind.as_str(),
            expires_in_secs = token.expires_at.saturating_duration_since(Instant::now()).as_secs(),
            "acquired access token"
        );
        let header = bearer(&token);
        *cached = Some(token);
        Ok(header)
    }

    /// Drop the cached token.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    fn is_fresh(&self, token: &AccessToken) -> bool {
        token.expires_at.saturating_duration_since(Instant::now()) > self.refresh_margin
    }
}

fn bearer(token: &AccessToken) -> SecretString {
    SecretString::from(format!("Bearer {}", token.token.expose_secret()))
}

/// Builds the credential described by an [`AzureConfig`].
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    http: reqwest::Client,
    aad_endpoint: String,
    imds_endpoint: String,
    proxy_mode: bool,
}

impl CredentialResolver {
    /// Resolver talking to `aad_endpoint` (authority root, e.g.
    /// `https://login.microsoftonline.com/`). In proxy mode every token
    /// request carries `x-azure-proxy-target: AzureActiveDirectory`.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn new(aad_endpoint: impl Into<String>, proxy_mode: bool) -> Result<Self, AuthError> {
        let mut http_config = HttpConfig::default().with_user_agent(user_agent());
        if proxy_mode {
            http_config = http_config.with_header(PROXY_TARGET_HEADER, TARGET_AZURE_ACTIVE_DIRECTORY);
        }
        let mut aad_endpoint = aad_endpoint.into();
        if !aad_endpoint.ends_with('/') {
            aad_endpoint.push('/');
        }
        Ok(Self {
            http: build_http_client(&http_config)?,
            aad_endpoint,
            imds_endpoint: DEFAULT_IMDS_ENDPOINT.to_string(),
            proxy_mode,
        })
    }

    /// Override the instance metadata endpoint.
    #[must_use]
    pub fn with_imds_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.imds_endpoint = endpoint.into();
        self
    }

    /// Select and build the credential for `resource` (token audience).
    ///
    /// # Errors
    ///
    /// [`AuthError::NoCredentials`] when no strategy applies, or the
    /// strategy's own setup error (unreadable certificate, non-RSA key, ...).
    pub fn resolve(&self, config: &AzureConfig, resource: &str) -> Result<Credential, AuthError> {
        let resource = resource.trim_end_matches('/');

        if config.use_managed_identity_extension {
            let user_assigned = !config.user_assigned_identity_id.is_empty();
            if user_assigned {
                info!(
                    client_id = %redact(&config.user_assigned_identity_id),
                    "using user-assigned managed identity to retrieve access token"
                );
            } else {
                info!("using system-assigned managed identity to retrieve access token");
            }
            let source = ManagedIdentityCredential::new(
                self.http.clone(),
                &self.imds_endpoint,
                resource,
                user_assigned.then(|| config.user_assigned_identity_id.clone()),
            );
            return Ok(Credential::new(
                CredentialKind::ManagedIdentity { user_assigned },
                Box::new(source),
            ));
        }

        if let Some(secret) = config.client_secret.as_ref().filter(|_| !config.client_id.is_empty()) {
            info!(
                client_id = %redact(&config.client_id),
                client_secret = %redact(secret.expose_secret()),
                "using client_id+client_secret to retrieve access token"
            );
            let source = ClientSecretCredential::new(
                self.http.clone(),
                self.token_endpoint(&config.tenant_id)?,
                config.client_id.clone(),
                SecretString::from(secret.expose_secret().to_string()),
                scope(resource),
            );
            return Ok(Credential::new(CredentialKind::ClientSecret, Box::new(source)));
        }

        if let Some(password) = config
            .client_cert_password
            .as_ref()
            .filter(|_| !config.client_cert_path.is_empty())
        {
            info!("using jwt client_assertion (client_cert+client_private_key) to retrieve access token");
            let path = PathBuf::from(&config.client_cert_path);
            let der = std::fs::read(&path).map_err(|source| AuthError::ReadFile {
                path: path.clone(),
                source,
            })?;
            let certificate = ClientCertificate::from_pkcs12(&der, password.expose_secret())?;
            let source = ClientCertificateCredential::new(
                self.http.clone(),
                self.token_endpoint(&config.tenant_id)?,
                config.client_id.clone(),
                Arc::new(certificate),
                scope(resource),
            );
            return Ok(Credential::new(CredentialKind::ClientCertificate, Box::new(source)));
        }

        if !config.msi_dataplane_identity_path.is_empty() {
            info!("using MSI dataplane identity to retrieve access token");
            let path = PathBuf::from(&config.msi_dataplane_identity_path);
            // Fail at startup on an unusable descriptor rather than on the first RPC.
            DataplaneIdentity::load(&path)?;
            let source = DataplaneIdentityCredential::new(
                self.http.clone(),
                path,
                self.proxy_mode.then(|| self.aad_endpoint.clone()),
                self.aad_endpoint.clone(),
                scope(resource),
            );
            return Ok(Credential::new(CredentialKind::DataplaneIdentity, Box::new(source)));
        }

        Err(AuthError::NoCredentials)
    }

    fn token_endpoint(&self, tenant_id: &str) -> Result<String, AuthError> {
        token_endpoint(&self.aad_endpoint, tenant_id)
    }
}

fn token_endpoint(authority: &str, tenant_id: &str) -> Result<String, AuthError> {
    if tenant_id.trim().is_empty() {
        return Err(AuthError::MissingField("tenantId"));
    }
    let authority = authority.trim_end_matches('/');
    Ok(format!("{authority}/{}/oauth2/v2.0/token", tenant_id.trim()))
}

fn scope(resource: &str) -> String {
    format!("{resource}/.default")
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Seconds {
    Number(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<Seconds>,
}

/// Send a token request and turn the response into an [`AccessToken`].
async fn request_token(
    request: reqwest::RequestBuilder,
    endpoint: &str,
) -> Result<AccessToken, AuthError> {
    let transport = |e: reqwest::Error| AuthError::Transport {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    };

    let response = request.send().await.map_err(transport)?;
    let status = response.status();
    if !status.is_success() {
        let mut body = response.text().await.unwrap_or_default();
        body.truncate(512);
        return Err(AuthError::TokenRequest {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    let parsed: TokenResponse = response.json().await.map_err(transport)?;
    let lifetime = match parsed.expires_in {
        Some(Seconds::Number(secs)) => Duration::from_secs(secs),
        Some(Seconds::Text(text)) => text
            .trim()
            .parse()
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME),
        None => DEFAULT_TOKEN_LIFETIME,
    };
    Ok(AccessToken::new(parsed.access_token, lifetime))
}
