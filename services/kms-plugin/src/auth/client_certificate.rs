//! Service principal with a PKCS#12 client certificate.
//!
//! The token request carries a short-lived RS256 JWT assertion signed with
//! the certificate's private key; the certificate is identified by its
//! SHA-1 and SHA-256 thumbprints in the JWT header.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::RsaPrivateKey;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, PrivateKeyInfo};
use serde::Serialize;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use super::{AccessToken, AuthError, TokenSource, request_token};

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 600;

/// Signing material extracted from a PKCS#12 container.
pub struct ClientCertificate {
    key: EncodingKey,
    thumbprint_sha1: String,
    thumbprint_sha256: String,
}

impl std::fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("x5t", &self.thumbprint_sha1)
            .finish_non_exhaustive()
    }
}

impl ClientCertificate {
    /// Decode a DER PKCS#12 container protected by `password`.
    ///
    /// # Errors
    ///
    /// [`AuthError::Certificate`] when the container cannot be opened or has
    /// no key or certificate, [`AuthError::NotRsaKey`] when the key is not RSA.
    pub fn from_pkcs12(der: &[u8], password: &str) -> Result<Self, AuthError> {
        let pfx = p12::PFX::parse(der)
            .map_err(|e| AuthError::Certificate(format!("invalid PKCS#12 data: {e:?}")))?;
        if !pfx.verify_mac(password) {
            return Err(AuthError::Certificate(
                "PKCS#12 integrity check failed, wrong password?".to_string(),
            ));
        }

        let key_der = pfx
            .key_bags(password)
            .map_err(|e| AuthError::Certificate(format!("failed to decrypt private key: {e:?}")))?
            .into_iter()
            .next()
            .ok_or_else(|| AuthError::Certificate("no private key in PKCS#12 data".to_string()))?;
        let cert_der = pfx
            .cert_x509_bags(password)
            .map_err(|e| AuthError::Certificate(format!("failed to decrypt certificate: {e:?}")))?
            .into_iter()
            .next()
            .ok_or_else(|| AuthError::Certificate("no certificate in PKCS#12 data".to_string()))?;

        let info = PrivateKeyInfo::try_from(key_der.as_slice())
            .map_err(|e| AuthError::Certificate(format!("invalid private key: {e}")))?;
        if info.algorithm.oid != rsa::pkcs1::ALGORITHM_OID {
            return Err(AuthError::NotRsaKey);
        }

        let private_key = RsaPrivateKey::from_pkcs8_der(&key_der)
            .map_err(|e| AuthError::Certificate(format!("invalid RSA key: {e}")))?;
        let pkcs1 = private_key
            .to_pkcs1_der()
            .map_err(|e| AuthError::Certificate(format!("failed to encode RSA key: {e}")))?;

        Ok(Self {
            key: EncodingKey::from_rsa_der(pkcs1.as_bytes()),
            thumbprint_sha1: URL_SAFE_NO_PAD.encode(Sha1::digest(&cert_der)),
            thumbprint_sha256: URL_SAFE_NO_PAD.encode(Sha256::digest(&cert_der)),
        })
    }

    /// Signed client assertion for `audience` (the token endpoint).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Assertion`] when signing fails.
    pub fn assertion(&self, client_id: &str, audience: &str) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            aud: audience,
            iss: client_id,
            sub: client_id,
            jti: uuid::Uuid::new_v4().to_string(),
            nbf: now,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.x5t = Some(self.thumbprint_sha1.clone());
        header.x5t_s256 = Some(self.thumbprint_sha256.clone());

        jsonwebtoken::encode(&header, &claims, &self.key)
            .map_err(|e| AuthError::Assertion(e.to_string()))
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    aud: &'a str,
    iss: &'a str,
    sub: &'a str,
    jti: String,
    nbf: i64,
    iat: i64,
    exp: i64,
}

/// Client credentials grant with a signed JWT assertion.
#[derive(Debug)]
pub struct ClientCertificateCredential {
    http: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    certificate: Arc<ClientCertificate>,
    scope: String,
}

impl ClientCertificateCredential {
    /// Credential posting to `token_endpoint`.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        token_endpoint: String,
        client_id: String,
        certificate: Arc<ClientCertificate>,
        scope: String,
    ) -> Self {
        Self {
            http,
            token_endpoint,
            client_id,
            certificate,
            scope,
        }
    }
}

#[async_trait]
impl TokenSource for ClientCertificateCredential {
    async fn fetch_token(&self) -> Result<AccessToken, AuthError> {
        let assertion = self
            .certificate
            .assertion(&self.client_id, &self.token_endpoint)?;
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("scope", self.scope.as_str()),
            ("client_assertion_type", CLIENT_ASSERTION_TYPE),
            ("client_assertion", assertion.as_str()),
        ];
        let request = self.http.post(&self.token_endpoint).form(&form);
        request_token(request, &self.token_endpoint).await
    }
}
