//! Key Vault client errors.

use thiserror::Error;

use super::annotations::AnnotationError;
use crate::auth::AuthError;

/// Errors raised while building or using the Key Vault client.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum KeyVaultError {
    /// Vault name violates the naming rules
    #[error("invalid vault name: {name:?}, {reason}")]
    InvalidVaultName {
        /// Name as configured (after sanitizing)
        name: String,
        /// Which rule was broken
        reason: String,
    },

    /// Vault name, key name or key version is empty
    #[error("key vault name, key name and key version are required")]
    MissingKeyReference,

    /// Managed HSM requested in a cloud without HSM endpoints
    #[error("no HSM endpoint in cloud {cloud}")]
    HsmUnavailable {
        /// Cloud name
        cloud: String,
    },

    /// Cloud name not recognized
    #[error("unknown cloud {cloud}")]
    UnknownCloud {
        /// Cloud name as configured
        cloud: String,
    },

    /// A URL could not be parsed or built
    #[error("invalid vault url {url}: {reason}")]
    InvalidUrl {
        /// Offending URL
        url: String,
        /// Parse failure
        reason: String,
    },

    /// Token acquisition failed
    #[error("failed to get keyvault token: {0}")]
    Credential(#[from] AuthError),

    /// Request never produced an HTTP response
    #[error("keyvault request failed: {0}")]
    Transport(String),

    /// Key Vault answered with an error status
    #[error("keyvault returned {status}: {code}: {message}")]
    Remote {
        /// HTTP status
        status: u16,
        /// Key Vault error code
        code: String,
        /// Key Vault error message
        message: String,
    },

    /// Key creation conflicts with an in-progress creation
    #[error("key {key_name} is already being created")]
    Conflict {
        /// Key being created
        key_name: String,
    },

    /// Response body could not be decoded
    #[error("failed to decode keyvault response: {0}")]
    Decode(String),

    /// The vault used a different key than the pinned one
    #[error("key id initialized does not match with the key id from encryption result, expected: {expected}, got: {actual}")]
    KeyIdMismatch {
        /// Pinned key id hash
        expected: String,
        /// Key id returned by the vault
        actual: String,
    },

    /// Decrypt request metadata does not match this server
    #[error(transparent)]
    Annotations(#[from] AnnotationError),

    /// Transient failures from shared helpers (polling, HTTP client setup)
    #[error(transparent)]
    Platform(#[from] kms_common::PlatformError),
}

impl KeyVaultError {
    /// Create an invalid vault name error.
    #[must_use]
    pub fn invalid_vault_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidVaultName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether the remote side may succeed if asked again later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Conflict { .. } => true,
            Self::Remote { status, .. } => *status == 429 || *status >= 500,
            Self::Platform(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for KeyVaultError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(KeyVaultError::Transport("reset".to_string()).is_transient());
        assert!(
            KeyVaultError::Remote {
                status: 503,
                code: "ServiceUnavailable".to_string(),
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            !KeyVaultError::Remote {
                status: 403,
                code: "Forbidden".to_string(),
                message: String::new()
            }
            .is_transient()
        );
        assert!(!KeyVaultError::MissingKeyReference.is_transient());
    }

    #[test]
    fn test_display() {
        let err = KeyVaultError::invalid_vault_name("a_b", "must match [-a-zA-Z0-9]{3,24}");
        assert_eq!(
            err.to_string(),
            "invalid vault name: \"a_b\", must match [-a-zA-Z0-9]{3,24}"
        );
    }
}
