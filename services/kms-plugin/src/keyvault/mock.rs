//! In-memory key vault for tests and local experiments.
//!
//! Wrapping is a reversible byte transform, not real cryptography. Faults can
//! be injected to exercise the error paths of the servers and the health
//! check.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::EncryptionAlgorithm;
use super::error::KeyVaultError;
use super::transport::{
    CreateKeyParameters, JsonWebKey, KeyAttributes, KeyBundle, KeyOperationResult, KeyVaultTransport,
};

const WRAP_PREFIX: &[u8] = b"mock-wrapped:";

/// Fake vault holding keys by name.
#[derive(Debug)]
pub struct MockKeyVault {
    vault_url: String,
    keys: RwLock<HashMap<String, Vec<String>>>,
    kid_override: RwLock<Option<String>>,
    fail_encrypt: AtomicBool,
    fail_decrypt: AtomicBool,
    corrupt_decrypt: AtomicBool,
    create_conflicts: AtomicU32,
    delay_ms: AtomicU64,
    encrypt_calls: AtomicU32,
    decrypt_calls: AtomicU32,
    create_calls: AtomicU32,
}

impl MockKeyVault {
    /// Empty vault at `vault_url` (used to build key ids).
    #[must_use]
    pub fn new(vault_url: impl Into<String>) -> Self {
        let mut vault_url = vault_url.into();
        if !vault_url.ends_with('/') {
            vault_url.push('/');
        }
        Self {
            vault_url,
            keys: RwLock::new(HashMap::new()),
            kid_override: RwLock::new(None),
            fail_encrypt: AtomicBool::new(false),
            fail_decrypt: AtomicBool::new(false),
            corrupt_decrypt: AtomicBool::new(false),
            create_conflicts: AtomicU32::new(0),
            delay_ms: AtomicU64::new(0),
            encrypt_calls: AtomicU32::new(0),
            decrypt_calls: AtomicU32::new(0),
            create_calls: AtomicU32::new(0),
        }
    }

    /// Pre-populate a key version.
    #[must_use]
    pub fn with_key(self, key_name: &str, key_version: &str) -> Self {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key_name.to_string())
            .or_default()
            .push(key_version.to_string());
        self
    }

    /// Report this key id from encrypt instead of the requested key.
    pub fn set_kid_override(&self, kid: Option<String>) {
        *self.kid_override.write().unwrap_or_else(PoisonError::into_inner) = kid;
    }

    /// Make encrypt calls fail.
    pub fn set_fail_encrypt(&self, fail: bool) {
        self.fail_encrypt.store(fail, Ordering::SeqCst);
    }

    /// Make decrypt calls fail.
    pub fn set_fail_decrypt(&self, fail: bool) {
        self.fail_decrypt.store(fail, Ordering::SeqCst);
    }

    /// Make decrypt return a different plaintext than was encrypted.
    pub fn set_corrupt_decrypt(&self, corrupt: bool) {
        self.corrupt_decrypt.store(corrupt, Ordering::SeqCst);
    }

    /// Answer the next `count` create calls with a conflict.
    pub fn set_create_conflicts(&self, count: u32) {
        self.create_conflicts.store(count, Ordering::SeqCst);
    }

    /// Hold every encrypt and decrypt call for `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of encrypt calls seen.
    #[must_use]
    pub fn encrypt_calls(&self) -> u32 {
        self.encrypt_calls.load(Ordering::SeqCst)
    }

    /// Number of decrypt calls seen.
    #[must_use]
    pub fn decrypt_calls(&self) -> u32 {
        self.decrypt_calls.load(Ordering::SeqCst)
    }

    /// Number of create calls seen.
    #[must_use]
    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    fn kid(&self, key_name: &str, key_version: &str) -> String {
        format!("{}keys/{key_name}/{key_version}", self.vault_url)
    }

    fn bundle(&self, key_name: &str, key_version: &str) -> KeyBundle {
        KeyBundle {
            key: JsonWebKey {
                kid: self.kid(key_name, key_version),
                kty: "RSA".to_string(),
                key_ops: vec!["encrypt".to_string(), "decrypt".to_string()],
            },
            attributes: KeyAttributes { enabled: true },
        }
    }

    async fn wait(&self) {
        let millis = self.delay_ms.load(Ordering::SeqCst);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }

    fn injected(operation: &str) -> KeyVaultError {
        KeyVaultError::Remote {
            status: 500,
            code: "InjectedFault".to_string(),
            message: format!("injected {operation} failure"),
        }
    }
}

#[async_trait]
impl KeyVaultTransport for MockKeyVault {
    async fn encrypt(
        &self,
        key_name: &str,
        key_version: &str,
        _algorithm: EncryptionAlgorithm,
        value: &[u8],
    ) -> Result<KeyOperationResult, KeyVaultError> {
        self.encrypt_calls.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        if self.fail_encrypt.load(Ordering::SeqCst) {
            return Err(Self::injected("encrypt"));
        }

        let kid = self
            .kid_override
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| self.kid(key_name, key_version));
        let mut result = WRAP_PREFIX.to_vec();
        result.extend(value.iter().rev());
        Ok(KeyOperationResult { kid, result })
    }

    async fn decrypt(
        &self,
        key_name: &str,
        key_version: &str,
        _algorithm: EncryptionAlgorithm,
        value: &[u8],
    ) -> Result<KeyOperationResult, KeyVaultError> {
        self.decrypt_calls.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        if self.fail_decrypt.load(Ordering::SeqCst) {
            return Err(Self::injected("decrypt"));
        }

        let wrapped = value.strip_prefix(WRAP_PREFIX).ok_or_else(|| KeyVaultError::Remote {
            status: 400,
            code: "BadParameter".to_string(),
            message: "ciphertext was not produced by this vault".to_string(),
        })?;
        let mut result: Vec<u8> = wrapped.iter().rev().copied().collect();
        if self.corrupt_decrypt.load(Ordering::SeqCst) {
            // Still valid base64url, just not what was encrypted.
            result.extend_from_slice(b"AAAA");
        }
        Ok(KeyOperationResult {
            kid: self.kid(key_name, key_version),
            result,
        })
    }

    async fn get_key(
        &self,
        key_name: &str,
        key_version: Option<&str>,
    ) -> Result<Option<KeyBundle>, KeyVaultError> {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let Some(versions) = keys.get(key_name) else {
            return Ok(None);
        };
        let version = match key_version {
            Some(wanted) => versions.iter().find(|v| v.as_str() == wanted),
            None => versions.last(),
        };
        Ok(version.map(|v| self.bundle(key_name, v)))
    }

    async fn create_key(
        &self,
        key_name: &str,
        _parameters: &CreateKeyParameters,
    ) -> Result<KeyBundle, KeyVaultError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.create_conflicts.load(Ordering::SeqCst);
        if pending > 0 {
            self.create_conflicts.store(pending - 1, Ordering::SeqCst);
            return Err(KeyVaultError::Conflict {
                key_name: key_name.to_string(),
            });
        }

        let version = uuid::Uuid::new_v4().simple().to_string();
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key_name.to_string())
            .or_default()
            .push(version.clone());
        Ok(self.bundle(key_name, &version))
    }
}
