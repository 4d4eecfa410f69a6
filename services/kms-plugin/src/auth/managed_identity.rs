//! Managed identity tokens from the instance metadata service.

use async_trait::async_trait;

use super::{AccessToken, AuthError, TokenSource, request_token};

const IMDS_API_VERSION: &str = "2018-02-01";

/// System- or user-assigned managed identity.
#[derive(Debug, Clone)]
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    endpoint: String,
    resource: String,
    client_id: Option<String>,
}

impl ManagedIdentityCredential {
    /// Identity on `endpoint`; `client_id` selects a user-assigned identity.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        endpoint: &str,
        resource: &str,
        client_id: Option<String>,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.to_string(),
            resource: resource.to_string(),
            client_id,
        }
    }
}

#[async_trait]
impl TokenSource for ManagedIdentityCredential {
    async fn fetch_token(&self) -> Result<AccessToken, AuthError> {
        let mut query = vec![
            ("api-version", IMDS_API_VERSION),
            ("resource", self.resource.as_str()),
        ];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.as_str()));
        }

        let request = self
            .http
            .get(&self.endpoint)
            .header("Metadata", "true")
            .query(&query);
        request_token(request, &self.endpoint).await
    }
}
