//! Local envelope transformer.
//!
//! Authenticated encryption without a key vault: every ciphertext gets its
//! own AES-256-GCM key derived with HKDF-SHA256 from the cluster seed and a
//! random 32-byte info value.
//!
//! Ciphertext layout: `info (32) || nonce (12) || sealed data + tag`.
//!
//! A seed file may list retired seeds after the current one. Data that only
//! a retired seed can open is returned but flagged stale so the caller can
//! re-encrypt it.

use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

/// Minimum seed length in bytes.
pub const MIN_SEED_LEN: usize = 32;

/// HKDF info length in bytes.
pub const INFO_LEN: usize = 32;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;

/// Local envelope errors.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Seed file could not be read
    #[error("failed to read seed file {path}: {source}")]
    ReadSeeds {
        /// Seed file
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// A seed line is not valid base64
    #[error("seed on line {line} is not valid base64: {reason}")]
    InvalidSeed {
        /// 1-based line number
        line: usize,
        /// Decode failure
        reason: String,
    },

    /// No seed configured
    #[error("no seed configured")]
    NoSeed,

    /// Seed shorter than [`MIN_SEED_LEN`]
    #[error("seed must be at least {MIN_SEED_LEN} bytes, got {len}")]
    SeedTooShort {
        /// Actual length
        len: usize,
    },

    /// Ciphertext cannot contain the header and tag
    #[error("ciphertext too short: {len} bytes")]
    CiphertextTooShort {
        /// Actual length
        len: usize,
    },

    /// Sealing failed
    #[error("failed to encrypt data")]
    Encrypt,

    /// No seed authenticates the ciphertext with this associated data
    #[error("failed to decrypt data: authentication failed")]
    Decrypt,
}

/// Plaintext recovered from storage.
#[derive(Debug, PartialEq, Eq)]
pub struct Unwrapped {
    /// Recovered data
    pub plaintext: Vec<u8>,
    /// Opened with a retired seed
    pub stale: bool,
}

/// HKDF extended-nonce AES-256-GCM transformer.
pub struct EnvelopeTransformer {
    current: Zeroizing<Vec<u8>>,
    retired: Vec<Zeroizing<Vec<u8>>>,
}

impl std::fmt::Debug for EnvelopeTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeTransformer")
            .field("retired_seeds", &self.retired.len())
            .finish_non_exhaustive()
    }
}

impl EnvelopeTransformer {
    /// Transformer over a single seed.
    ///
    /// # Errors
    ///
    /// Fails when the seed is shorter than [`MIN_SEED_LEN`].
    pub fn new(seed: Vec<u8>) -> Result<Self, EnvelopeError> {
        Self::with_retired(seed, Vec::new())
    }

    /// Transformer encrypting with `current` and still able to read data
    /// sealed with any of `retired`.
    ///
    /// # Errors
    ///
    /// Fails when any seed is shorter than [`MIN_SEED_LEN`].
    pub fn with_retired(current: Vec<u8>, retired: Vec<Vec<u8>>) -> Result<Self, EnvelopeError> {
        let check = |seed: Vec<u8>| {
            let seed = Zeroizing::new(seed);
            if seed.len() < MIN_SEED_LEN {
                return Err(EnvelopeError::SeedTooShort { len: seed.len() });
            }
            Ok(seed)
        };
        Ok(Self {
            current: check(current)?,
            retired: retired.into_iter().map(check).collect::<Result<_, _>>()?,
        })
    }

    /// Load seeds from a file: one base64 seed per line, current first.
    ///
    /// # Errors
    ///
    /// Unreadable file, bad base64, no seed or a short seed.
    pub fn from_seed_file(path: &Path) -> Result<Self, EnvelopeError> {
        let mut seeds = load_seeds(path)?.into_iter();
        let current = seeds.next().ok_or(EnvelopeError::NoSeed)?;
        let transformer = Self::with_retired(current, seeds.collect())?;
        debug!(
            path = %path.display(),
            retired = transformer.retired.len(),
            "loaded envelope seeds"
        );
        Ok(transformer)
    }

    /// Seal `plaintext` bound to `data_context`.
    ///
    /// # Errors
    ///
    /// Only fails if the AEAD refuses the input.
    pub fn transform_to_storage(&self, plaintext: &[u8], data_context: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let mut info = [0u8; INFO_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut info);
        rng.fill_bytes(&mut nonce);

        let cipher = derive_cipher(&self.current, &info)?;
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: data_context,
                },
            )
            .map_err(|_| EnvelopeError::Encrypt)?;

        let mut out = Vec::with_capacity(INFO_LEN + NONCE_LEN + sealed.len());
        out.extend_from_slice(&info);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open `ciphertext` with the same `data_context` it was sealed with.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::Decrypt`] when no seed authenticates the data.
    pub fn transform_from_storage(&self, ciphertext: &[u8], data_context: &[u8]) -> Result<Unwrapped, EnvelopeError> {
        if ciphertext.len() < INFO_LEN + NONCE_LEN + TAG_LEN {
            return Err(EnvelopeError::CiphertextTooShort {
                len: ciphertext.len(),
            });
        }
        let (info, rest) = ciphertext.split_at(INFO_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);

        let seeds = std::iter::once((&self.current, false)).chain(self.retired.iter().map(|s| (s, true)));
        for (seed, stale) in seeds {
            let cipher = derive_cipher(seed, info)?;
            if let Ok(plaintext) = cipher.decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: data_context,
                },
            ) {
                return Ok(Unwrapped { plaintext, stale });
            }
        }
        Err(EnvelopeError::Decrypt)
    }
}

fn derive_cipher(seed: &[u8], info: &[u8]) -> Result<Aes256Gcm, EnvelopeError> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    Hkdf::<Sha256>::new(None, seed)
        .expand(info, &mut key[..])
        .map_err(|_| EnvelopeError::Encrypt)?;
    Aes256Gcm::new_from_slice(&key[..]).map_err(|_| EnvelopeError::Encrypt)
}

/// Read base64 seeds, one per non-empty line.
///
/// # Errors
///
/// Unreadable file or a line that is not base64.
pub fn load_seeds(path: &Path) -> Result<Vec<Vec<u8>>, EnvelopeError> {
    let raw = Zeroizing::new(std::fs::read_to_string(path).map_err(|source| EnvelopeError::ReadSeeds {
        path: path.to_path_buf(),
        source,
    })?);

    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            STANDARD
                .decode(line.trim())
                .map_err(|e| EnvelopeError::InvalidSeed {
                    line: idx + 1,
                    reason: e.to_string(),
                })
        })
        .collect()
}
