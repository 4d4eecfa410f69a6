//! Plugin-wide error type.
//!
//! Every layer has its own error enum; [`KmsError`] gathers them at the RPC
//! boundary where they become a gRPC status and a metric label.

use thiserror::Error;
use tonic::{Code, Status};

use crate::auth::AuthError;
use crate::envelope::EnvelopeError;
use crate::keyvault::{AnnotationError, KeyVaultError};

/// Errors surfaced by the KMS servers.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum KmsError {
    /// Key Vault client failure
    #[error(transparent)]
    KeyVault(#[from] KeyVaultError),

    /// Local envelope failure
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Request rejected before reaching the backend
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Encrypt/decrypt self-test did not round trip
    #[error("self-check failed: {0}")]
    SelfCheck(String),
}

impl From<AuthError> for KmsError {
    fn from(err: AuthError) -> Self {
        Self::KeyVault(KeyVaultError::Credential(err))
    }
}

impl From<AnnotationError> for KmsError {
    fn from(err: AnnotationError) -> Self {
        Self::KeyVault(KeyVaultError::Annotations(err))
    }
}

/// Stable error classes, used as metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Configuration
    Config,
    /// Vault name rules
    InvalidVaultName,
    /// Managed HSM requested outside the public cloud
    HsmUnavailable,
    /// Token acquisition
    Credential,
    /// Network failure talking to the vault
    Transport,
    /// Error status from the vault
    Remote,
    /// Vault used a key other than the pinned one
    KeyIdMismatch,
    /// Decrypt request metadata mismatch
    InvalidAnnotations,
    /// Undecodable vault response
    Decode,
    /// Local envelope failure
    Envelope,
    /// Bad request fields
    InvalidRequest,
    /// Self-test mismatch
    SelfCheck,
}

impl ErrorCategory {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::InvalidVaultName => "invalid_vault_name",
            Self::HsmUnavailable => "hsm_unavailable",
            Self::Credential => "credential",
            Self::Transport => "keyvault_transport",
            Self::Remote => "keyvault_remote",
            Self::KeyIdMismatch => "key_id_mismatch",
            Self::InvalidAnnotations => "invalid_annotations",
            Self::Decode => "decode",
            Self::Envelope => "envelope",
            Self::InvalidRequest => "invalid_request",
            Self::SelfCheck => "self_check",
        }
    }
}

impl KmsError {
    /// Stable class of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::KeyVault(e) => match e {
                KeyVaultError::InvalidVaultName { .. } => ErrorCategory::InvalidVaultName,
                KeyVaultError::HsmUnavailable { .. } => ErrorCategory::HsmUnavailable,
                KeyVaultError::UnknownCloud { .. }
                | KeyVaultError::InvalidUrl { .. }
                | KeyVaultError::MissingKeyReference => ErrorCategory::Config,
                KeyVaultError::Credential(_) => ErrorCategory::Credential,
                KeyVaultError::Transport(_) | KeyVaultError::Platform(_) => ErrorCategory::Transport,
                KeyVaultError::Remote { .. } | KeyVaultError::Conflict { .. } => ErrorCategory::Remote,
                KeyVaultError::KeyIdMismatch { .. } => ErrorCategory::KeyIdMismatch,
                KeyVaultError::Annotations(_) => ErrorCategory::InvalidAnnotations,
                KeyVaultError::Decode(_) => ErrorCategory::Decode,
            },
            Self::Envelope(_) => ErrorCategory::Envelope,
            Self::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            Self::SelfCheck(_) => ErrorCategory::SelfCheck,
        }
    }

    /// gRPC code for this error.
    #[must_use]
    pub fn grpc_code(&self) -> Code {
        match self {
            Self::KeyVault(KeyVaultError::Annotations(_))
            | Self::InvalidRequest(_)
            | Self::Envelope(EnvelopeError::Decrypt | EnvelopeError::CiphertextTooShort { .. }) => {
                Code::InvalidArgument
            }
            Self::KeyVault(KeyVaultError::Credential(_)) => Code::Unauthenticated,
            Self::KeyVault(KeyVaultError::Remote { status: 401 | 403, .. }) => Code::PermissionDenied,
            Self::KeyVault(KeyVaultError::Remote { status: 404, .. }) => Code::NotFound,
            Self::KeyVault(e) if e.is_transient() => Code::Unavailable,
            Self::SelfCheck(_) => Code::Unavailable,
            Self::KeyVault(KeyVaultError::KeyIdMismatch { .. }) => Code::FailedPrecondition,
            _ => Code::Internal,
        }
    }

    /// Convert to a gRPC status carrying the error text.
    #[must_use]
    pub fn to_status(&self) -> Status {
        Status::new(self.grpc_code(), self.to_string())
    }
}

impl From<KmsError> for Status {
    fn from(err: KmsError) -> Self {
        err.to_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotation_errors_are_invalid_argument() {
        let err = KmsError::from(AnnotationError::Empty);
        assert_eq!(err.category(), ErrorCategory::InvalidAnnotations);
        let status = err.to_status();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(
            status.message(),
            "invalid annotations, annotations cannot be empty"
        );
    }

    #[test]
    fn test_remote_status_mapping() {
        let remote = |status| {
            KmsError::from(KeyVaultError::Remote {
                status,
                code: String::new(),
                message: "denied".to_string(),
            })
        };
        assert_eq!(remote(403).grpc_code(), Code::PermissionDenied);
        assert_eq!(remote(404).grpc_code(), Code::NotFound);
        assert_eq!(remote(503).grpc_code(), Code::Unavailable);
        assert_eq!(remote(400).grpc_code(), Code::Internal);
        assert_eq!(remote(400).category().as_str(), "keyvault_remote");
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            KmsError::from(AuthError::NoCredentials).category(),
            ErrorCategory::Credential
        );
        assert_eq!(
            KmsError::from(KeyVaultError::KeyIdMismatch {
                expected: "a".to_string(),
                actual: "b".to_string()
            })
            .category()
            .as_str(),
            "key_id_mismatch"
        );
        assert_eq!(
            KmsError::from(KeyVaultError::MissingKeyReference).category(),
            ErrorCategory::Config
        );
        assert_eq!(
            KmsError::from(EnvelopeError::Decrypt).grpc_code(),
            Code::InvalidArgument
        );
    }
}
