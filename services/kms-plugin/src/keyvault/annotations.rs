//! Integrity annotations attached to KMS v2 ciphertexts.
//!
//! Annotations are produced once at encrypt time and must come back
//! unchanged at decrypt time. A mismatch in key id, algorithm or schema
//! version means the ciphertext was not produced by this configuration
//! and is rejected before any decryption is attempted.

use std::collections::HashMap;

use subtle::ConstantTimeEq;
use thiserror::Error;

use super::EncryptionAlgorithm;

/// Annotation carrying the encryption response schema version.
pub const VERSION_ANNOTATION_KEY: &str = "version.azure.akv.io";

/// Annotation carrying the encryption algorithm.
pub const ALGORITHM_ANNOTATION_KEY: &str = "algorithm.azure.akv.io";

/// Annotation carrying the associated data of the local envelope backend.
pub const AUTHENTICATED_DATA_ANNOTATION_KEY: &str = "authenticated-data.azure.akv.io";

/// Schema version written by the Key Vault backend.
pub const ENCRYPTION_RESPONSE_VERSION: &str = "1";

/// Schema version written by the local envelope backend.
pub const WRAPPED_ENCRYPTION_RESPONSE_VERSION: &str = "2";

/// Key id reported by the local envelope backend.
pub const STATIC_KEY_ID: &str = "1";

/// Annotation map as carried by the v2 protocol.
pub type Annotations = HashMap<String, Vec<u8>>;

/// Why a decrypt request was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnnotationError {
    /// No annotations at all
    #[error("invalid annotations, annotations cannot be empty")]
    Empty,

    /// Request key id differs from the pinned key
    #[error("key id {actual} does not match expected key id {expected} used for encryption")]
    KeyIdMismatch {
        /// Key id in the request
        actual: String,
        /// Key id of this server
        expected: String,
    },

    /// Algorithm annotation differs from the server's algorithm
    #[error("algorithm {actual} does not match expected algorithm {expected} used for encryption")]
    AlgorithmMismatch {
        /// Algorithm in the annotations
        actual: String,
        /// Algorithm of this server
        expected: String,
    },

    /// Version annotation differs from the server's schema version
    #[error("version {actual} does not match expected version {expected} used for encryption")]
    VersionMismatch {
        /// Version in the annotations
        actual: String,
        /// Version of this server
        expected: String,
    },

    /// Local envelope ciphertext without its associated data
    #[error("missing authenticated data annotation value")]
    MissingAuthenticatedData,
}

fn lossy(annotations: &Annotations, key: &str) -> String {
    annotations
        .get(key)
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .unwrap_or_default()
}

fn key_id_matches(actual: &str, expected: &str) -> bool {
    actual.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Annotations for a Key Vault ciphertext.
#[must_use]
pub fn remote_annotations(algorithm: EncryptionAlgorithm) -> Annotations {
    HashMap::from([
        (
            VERSION_ANNOTATION_KEY.to_string(),
            ENCRYPTION_RESPONSE_VERSION.as_bytes().to_vec(),
        ),
        (
            ALGORITHM_ANNOTATION_KEY.to_string(),
            algorithm.as_str().as_bytes().to_vec(),
        ),
    ])
}

/// Checks a Key Vault decrypt request, in order: non-empty, key id,
/// algorithm, version.
///
/// # Errors
///
/// Returns the first failing check.
pub fn validate_remote(
    annotations: &Annotations,
    key_id: &str,
    expected_key_id: &str,
    algorithm: EncryptionAlgorithm,
) -> Result<(), AnnotationError> {
    if annotations.is_empty() {
        return Err(AnnotationError::Empty);
    }

    if !key_id_matches(key_id, expected_key_id) {
        return Err(AnnotationError::KeyIdMismatch {
            actual: key_id.to_string(),
            expected: expected_key_id.to_string(),
        });
    }

    let actual = lossy(annotations, ALGORITHM_ANNOTATION_KEY);
    if actual != algorithm.as_str() {
        return Err(AnnotationError::AlgorithmMismatch {
            actual,
            expected: algorithm.as_str().to_string(),
        });
    }

    let actual = lossy(annotations, VERSION_ANNOTATION_KEY);
    if actual != ENCRYPTION_RESPONSE_VERSION {
        return Err(AnnotationError::VersionMismatch {
            actual,
            expected: ENCRYPTION_RESPONSE_VERSION.to_string(),
        });
    }

    Ok(())
}

/// Annotations for a local envelope ciphertext.
#[must_use]
pub fn wrapped_annotations(authenticated_data: &[u8]) -> Annotations {
    HashMap::from([
        (
            AUTHENTICATED_DATA_ANNOTATION_KEY.to_string(),
            authenticated_data.to_vec(),
        ),
        (
            VERSION_ANNOTATION_KEY.to_string(),
            WRAPPED_ENCRYPTION_RESPONSE_VERSION.as_bytes().to_vec(),
        ),
    ])
}

/// Checks a local envelope decrypt request, in order: key id, non-empty,
/// associated data present, version.
///
/// # Errors
///
/// Returns the first failing check.
pub fn validate_wrapped(annotations: &Annotations, key_id: &str) -> Result<(), AnnotationError> {
    if !key_id_matches(key_id, STATIC_KEY_ID) {
        return Err(AnnotationError::KeyIdMismatch {
            actual: key_id.to_string(),
            expected: STATIC_KEY_ID.to_string(),
        });
    }

    if annotations.is_empty() {
        return Err(AnnotationError::Empty);
    }

    if annotations
        .get(AUTHENTICATED_DATA_ANNOTATION_KEY)
        .is_none_or(Vec::is_empty)
    {
        return Err(AnnotationError::MissingAuthenticatedData);
    }

    let actual = lossy(annotations, VERSION_ANNOTATION_KEY);
    if actual != WRAPPED_ENCRYPTION_RESPONSE_VERSION {
        return Err(AnnotationError::VersionMismatch {
            actual,
            expected: WRAPPED_ENCRYPTION_RESPONSE_VERSION.to_string(),
        });
    }

    Ok(())
}
