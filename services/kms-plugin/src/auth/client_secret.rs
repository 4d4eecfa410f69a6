//! Service principal with a client secret (OAuth2 client credentials).

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::{AccessToken, AuthError, TokenSource, request_token};

/// Client credentials grant with a shared secret.
#[derive(Debug)]
pub struct ClientSecretCredential {
    http: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    client_secret: SecretString,
    scope: String,
}

impl ClientSecretCredential {
    /// Credential posting to `token_endpoint`.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        token_endpoint: String,
        client_id: String,
        client_secret: SecretString,
        scope: String,
    ) -> Self {
        Self {
            http,
            token_endpoint,
            client_id,
            client_secret,
            scope,
        }
    }
}

#[async_trait]
impl TokenSource for ClientSecretCredential {
    async fn fetch_token(&self) -> Result<AccessToken, AuthError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("scope", self.scope.as_str()),
        ];
        let request = self.http.post(&self.token_endpoint).form(&form);
        request_token(request, &self.token_endpoint).await
    }
}
