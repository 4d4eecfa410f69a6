//! Key provisioning for clusters that configure a key name but no version.
//!
//! The latest version of the key is used when the key exists. Otherwise one
//! process creates it while holding a lease (a lock file next to the cloud
//! provider config) and every other process polls until the key shows up.
//! The resolved version is written back to `providerKeyVersion` so later
//! restarts pin the same version.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kms_common::{PollConfig, PollPolicy};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ConfigError;
use crate::keyvault::{CreateKeyParameters, KeyBundle, KeyVaultError, KeyVaultTransport};

/// Field of the provider config the version is persisted in.
pub const KEY_VERSION_FIELD: &str = "providerKeyVersion";

/// Provisioning errors.
#[derive(Error, Debug)]
pub enum ProvisioningError {
    /// Vault call failed or polling gave up
    #[error(transparent)]
    KeyVault(#[from] KeyVaultError),

    /// Config file could not be updated
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Lease file could not be created for a reason other than contention
    #[error("failed to acquire key creation lease {path}: {source}")]
    Lease {
        /// Lock file path
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The vault returned a key id without a version segment
    #[error("key id {0} has no version")]
    MissingVersion(String),
}

/// Resolves or creates the key version to pin.
pub struct KeyProvisioner {
    transport: Arc<dyn KeyVaultTransport>,
    config_path: PathBuf,
    poll: PollPolicy,
}

impl std::fmt::Debug for KeyProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyProvisioner")
            .field("config_path", &self.config_path)
            .field("poll", &self.poll)
            .finish_non_exhaustive()
    }
}

struct Lease {
    path: PathBuf,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release key creation lease");
        }
    }
}

impl KeyProvisioner {
    /// Provisioner writing back to the config file at `config_path`.
    #[must_use]
    pub fn new(transport: Arc<dyn KeyVaultTransport>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            config_path: config_path.into(),
            poll: PollPolicy::new(PollConfig::default()),
        }
    }

    /// Override the contender polling schedule.
    #[must_use]
    pub fn with_poll_config(mut self, config: PollConfig) -> Self {
        self.poll = PollPolicy::new(config);
        self
    }

    /// Lock file guarding key creation.
    #[must_use]
    pub fn lease_path(&self) -> PathBuf {
        let mut name = self.config_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Version of `key_name` to use, creating the key when it is missing.
    ///
    /// # Errors
    ///
    /// Vault failures, a lease that cannot be taken, polling running out of
    /// time or the config file not being writable.
    pub async fn ensure_key_version(&self, key_name: &str) -> Result<String, ProvisioningError> {
        let bundle = match self.transport.get_key(key_name, None).await? {
            Some(bundle) => {
                info!(key_name, kid = %bundle.key.kid, "using latest version of existing key");
                bundle
            }
            None => self.create_or_wait(key_name).await?,
        };

        let version = bundle
            .version()
            .ok_or_else(|| ProvisioningError::MissingVersion(bundle.key.kid.clone()))?
            .to_string();
        persist_key_version(&self.config_path, &version)?;
        info!(key_name, key_version = %version, "key version persisted");
        Ok(version)
    }

    async fn create_or_wait(&self, key_name: &str) -> Result<KeyBundle, ProvisioningError> {
        let Some(_lease) = self.try_lease()? else {
            info!(key_name, "another process is creating the key, waiting for it");
            return Ok(self.wait_for_key(key_name).await?);
        };

        // The key may have been created between the lookup and the lease.
        if let Some(bundle) = self.transport.get_key(key_name, None).await? {
            return Ok(bundle);
        }

        info!(key_name, "creating key");
        match self
            .transport
            .create_key(key_name, &CreateKeyParameters::default())
            .await
        {
            Ok(bundle) => Ok(bundle),
            Err(KeyVaultError::Conflict { .. }) => {
                warn!(key_name, "key creation already in progress, waiting for it");
                Ok(self.wait_for_key(key_name).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn try_lease(&self) -> Result<Option<Lease>, ProvisioningError> {
        let path = self.lease_path();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Some(Lease { path })),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(source) => Err(ProvisioningError::Lease { path, source }),
        }
    }

    async fn wait_for_key(&self, key_name: &str) -> Result<KeyBundle, KeyVaultError> {
        let transport: &dyn KeyVaultTransport = self.transport.as_ref();
        self.poll
            .poll_until(&format!("key {key_name}"), move || transport.get_key(key_name, None))
            .await
    }
}

/// Set `providerKeyVersion` in the JSON config at `path`, keeping every
/// other field and its order.
///
/// # Errors
///
/// Fails when the file cannot be read, parsed or replaced.
pub fn persist_key_version(path: &Path, version: &str) -> Result<(), ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut document: Value = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let Some(fields) = document.as_object_mut() else {
        return Err(ConfigError::InvalidValue {
            field: "config-file-path",
            reason: format!("{} is not a JSON object", path.display()),
        });
    };
    fields.insert(KEY_VERSION_FIELD.to_string(), Value::String(version.to_string()));

    let rendered = serde_json::to_string_pretty(&document).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let write_error = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    std::fs::write(&staging, rendered).map_err(write_error)?;
    std::fs::rename(&staging, path).map_err(write_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyvault::MockKeyVault;
    use std::time::Duration;

    const CONFIG: &str = r#"{"cloud":"AzurePublicCloud","tenantId":"t","providerKeyName":"kek"}"#;

    fn setup(vault: MockKeyVault) -> (tempfile::TempDir, Arc<MockKeyVault>, KeyProvisioner) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("azure.json");
        std::fs::write(&path, CONFIG).unwrap();
        let vault = Arc::new(vault);
        let provisioner = KeyProvisioner::new(vault.clone(), path).with_poll_config(
            PollConfig::default()
                .with_interval(Duration::from_millis(20))
                .with_max_wait(Duration::from_millis(500)),
        );
        (dir, vault, provisioner)
    }

    fn persisted(dir: &tempfile::TempDir) -> Value {
        let raw = std::fs::read_to_string(dir.path().join("azure.json")).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_existing_key_uses_latest_version() {
        let vault = MockKeyVault::new("https://kv.vault.azure.net/")
            .with_key("kek", "old")
            .with_key("kek", "new");
        let (dir, vault, provisioner) = setup(vault);

        assert_eq!(provisioner.ensure_key_version("kek").await.unwrap(), "new");
        assert_eq!(vault.create_calls(), 0);

        let config = persisted(&dir);
        assert_eq!(config[KEY_VERSION_FIELD], "new");
        assert_eq!(config["tenantId"], "t");
        let keys: Vec<&String> = config.as_object().unwrap().keys().collect();
        assert_eq!(keys.first().map(|k| k.as_str()), Some("cloud"));
    }

    #[tokio::test]
    async fn test_missing_key_is_created() {
        let (dir, vault, provisioner) = setup(MockKeyVault::new("https://kv.vault.azure.net/"));

        let version = provisioner.ensure_key_version("kek").await.unwrap();
        assert_eq!(vault.create_calls(), 1);
        assert_eq!(persisted(&dir)[KEY_VERSION_FIELD], version.as_str());
        assert!(!provisioner.lease_path().exists());
    }

    #[tokio::test]
    async fn test_contender_waits_for_lease_holder() {
        let (_dir, vault, provisioner) = setup(MockKeyVault::new("https://kv.vault.azure.net/"));
        std::fs::write(provisioner.lease_path(), b"").unwrap();

        let creator = vault.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            creator.create_key("kek", &CreateKeyParameters::default()).await.unwrap();
        });

        let version = provisioner.ensure_key_version("kek").await.unwrap();
        assert!(!version.is_empty());
        assert_eq!(vault.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_conflict_falls_back_to_polling() {
        let (_dir, vault, provisioner) = setup(MockKeyVault::new("https://kv.vault.azure.net/"));
        vault.set_create_conflicts(1);

        let creator = vault.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            creator.create_key("kek", &CreateKeyParameters::default()).await.unwrap();
        });

        assert!(provisioner.ensure_key_version("kek").await.is_ok());
        assert!(!provisioner.lease_path().exists());
    }

    #[tokio::test]
    async fn test_contender_gives_up() {
        let (dir, _vault, provisioner) = setup(MockKeyVault::new("https://kv.vault.azure.net/"));
        std::fs::write(provisioner.lease_path(), b"").unwrap();

        let err = provisioner.ensure_key_version("kek").await.unwrap_err();
        assert!(matches!(
            err,
            ProvisioningError::KeyVault(KeyVaultError::Platform(kms_common::PlatformError::PollTimeout { .. }))
        ));
        assert!(persisted(&dir).get(KEY_VERSION_FIELD).is_none());
    }

    #[test]
    fn test_persist_rejects_non_object() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "[1, 2]").unwrap();
        assert!(matches!(
            persist_key_version(file.path(), "v1"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
