//! Externally managed identity descriptor.
//!
//! An agent outside the plugin keeps a JSON file up to date with a
//! certificate credential. The file is re-read on every token refresh so
//! rotations are picked up without a restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tracing::debug;

use super::{
    AccessToken, AuthError, ClientCertificate, ClientCertificateCredential, TokenSource,
    token_endpoint,
};

/// One identity of the descriptor file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataplaneIdentity {
    /// Application (client) id
    #[serde(default)]
    pub client_id: String,
    /// Tenant id
    #[serde(default)]
    pub tenant_id: String,
    /// Base64 PKCS#12 container without password
    #[serde(default)]
    pub client_secret: String,
    /// Authority to request tokens from
    #[serde(default)]
    pub authentication_endpoint: String,
    /// Certificate expiry as written by the agent
    #[serde(default)]
    pub not_after: String,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    #[serde(flatten)]
    identity: DataplaneIdentity,
    #[serde(default)]
    explicit_identities: Vec<DataplaneIdentity>,
}

impl DataplaneIdentity {
    /// Load the descriptor, preferring the top-level identity over the
    /// first explicit one.
    ///
    /// # Errors
    ///
    /// Fails when the file is unreadable, not JSON, or carries no complete
    /// identity.
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        let raw = std::fs::read(path).map_err(|source| AuthError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let invalid = |reason: String| AuthError::InvalidIdentity {
            path: path.to_path_buf(),
            reason,
        };

        let descriptor: Descriptor =
            serde_json::from_slice(&raw).map_err(|e| invalid(e.to_string()))?;
        let identity = if descriptor.identity.client_id.is_empty() {
            descriptor
                .explicit_identities
                .into_iter()
                .next()
                .ok_or_else(|| invalid("no identity in descriptor".to_string()))?
        } else {
            descriptor.identity
        };

        for (field, value) in [
            ("client_id", &identity.client_id),
            ("tenant_id", &identity.tenant_id),
            ("client_secret", &identity.client_secret),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(format!("{field} is empty")));
            }
        }
        Ok(identity)
    }

    /// Decode the embedded certificate.
    ///
    /// # Errors
    ///
    /// Fails when the secret is not base64 or not a usable PKCS#12 container.
    pub fn certificate(&self) -> Result<ClientCertificate, AuthError> {
        let der = STANDARD
            .decode(self.client_secret.trim())
            .map_err(|e| AuthError::Certificate(format!("client_secret is not base64: {e}")))?;
        ClientCertificate::from_pkcs12(&der, "")
    }
}

/// Certificate credential backed by the descriptor file.
#[derive(Debug)]
pub struct DataplaneIdentityCredential {
    http: reqwest::Client,
    path: PathBuf,
    authority_override: Option<String>,
    default_authority: String,
    scope: String,
}

impl DataplaneIdentityCredential {
    /// Credential reading `path` on each refresh. `authority_override` wins
    /// over the descriptor's endpoint (proxy mode); `default_authority` is
    /// used when the descriptor has none.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        path: PathBuf,
        authority_override: Option<String>,
        default_authority: String,
        scope: String,
    ) -> Self {
        Self {
            http,
            path,
            authority_override,
            default_authority,
            scope,
        }
    }

    fn authority<'a>(&'a self, identity: &'a DataplaneIdentity) -> &'a str {
        if let Some(authority) = &self.authority_override {
            return authority;
        }
        if identity.authentication_endpoint.trim().is_empty() {
            &self.default_authority
        } else {
            identity.authentication_endpoint.trim()
        }
    }
}

#[async_trait]
impl TokenSource for DataplaneIdentityCredential {
    async fn fetch_token(&self) -> Result<AccessToken, AuthError> {
        let identity = DataplaneIdentity::load(&self.path)?;
        debug!(not_after = %identity.not_after, "loaded dataplane identity");

        let inner = ClientCertificateCredential::new(
            self.http.clone(),
            token_endpoint(self.authority(&identity), &identity.tenant_id)?,
            identity.client_id.clone(),
            Arc::new(identity.certificate()?),
            self.scope.clone(),
        );
        inner.fetch_token().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::client_certificate::tests::rsa_pkcs12;
    use secrecy::ExposeSecret;
    use std::io::Write;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn descriptor_file(body: &serde_json::Value) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{body}").unwrap();
        file
    }

    #[test]
    fn test_load_prefers_top_level_identity() {
        let file = descriptor_file(&serde_json::json!({
            "client_id": "top",
            "tenant_id": "tenant",
            "client_secret": "c2VjcmV0",
            "explicit_identities": [
                {"client_id": "explicit", "tenant_id": "tenant", "client_secret": "c2VjcmV0"}
            ]
        }));
        assert_eq!(DataplaneIdentity::load(file.path()).unwrap().client_id, "top");

        let file = descriptor_file(&serde_json::json!({
            "explicit_identities": [
                {"client_id": "explicit", "tenant_id": "tenant", "client_secret": "c2VjcmV0"}
            ]
        }));
        assert_eq!(
            DataplaneIdentity::load(file.path()).unwrap().client_id,
            "explicit"
        );
    }

    #[test]
    fn test_load_rejects_incomplete_descriptor() {
        let file = descriptor_file(&serde_json::json!({"client_id": "c", "tenant_id": "t"}));
        assert!(matches!(
            DataplaneIdentity::load(file.path()),
            Err(AuthError::InvalidIdentity { .. })
        ));
        let file = descriptor_file(&serde_json::json!({}));
        assert!(matches!(
            DataplaneIdentity::load(file.path()),
            Err(AuthError::InvalidIdentity { .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_token_with_descriptor_certificate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant/oauth2/v2.0/token"))
            .and(body_string_contains("client_assertion="))
            .and(body_string_contains("client_id=dataplane-client"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "dataplane-token",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let file = descriptor_file(&serde_json::json!({
            "client_id": "dataplane-client",
            "tenant_id": "tenant",
            "client_secret": STANDARD.encode(rsa_pkcs12("")),
            "authentication_endpoint": format!("{}/", server.uri()),
        }));
        let credential = DataplaneIdentityCredential::new(
            reqwest::Client::new(),
            file.path().to_path_buf(),
            None,
            "https://login.microsoftonline.com/".to_string(),
            "https://vault.azure.net/.default".to_string(),
        );
        let token = credential.fetch_token().await.unwrap();
        assert_eq!(token.token.expose_secret(), "dataplane-token");
    }
}
