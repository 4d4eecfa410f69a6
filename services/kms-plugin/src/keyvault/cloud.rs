//! Azure cloud environments and the URLs derived from them.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use super::error::KeyVaultError;
use crate::config::ProxyTarget;

static VAULT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[-A-Za-z0-9]+$").expect("vault name pattern is valid"));

/// Minimum length of a Key Vault name.
pub const MIN_VAULT_NAME_LEN: usize = 3;

/// Maximum length of a Key Vault name.
pub const MAX_VAULT_NAME_LEN: usize = 24;

/// Sovereign clouds the plugin knows endpoints for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AzureCloud {
    /// Azure public cloud
    Public,
    /// Azure China (21Vianet)
    China,
    /// Azure US Government
    UsGovernment,
}

impl AzureCloud {
    /// Resolve a cloud name from `azure.json`; matching ignores case and an
    /// empty name means the public cloud.
    ///
    /// # Errors
    ///
    /// Returns [`KeyVaultError::UnknownCloud`] for anything else.
    pub fn from_name(name: &str) -> Result<Self, KeyVaultError> {
        let upper = name.trim().to_ascii_uppercase();
        match upper.as_str() {
            "" | "AZURECLOUD" | "AZUREPUBLICCLOUD" => Ok(Self::Public),
            "AZURECHINACLOUD" => Ok(Self::China),
            "AZUREGOVERNMENTCLOUD" | "AZUREUSGOVERNMENT" | "AZUREUSGOVERNMENTCLOUD" => {
                Ok(Self::UsGovernment)
            }
            _ => Err(KeyVaultError::UnknownCloud {
                cloud: name.to_string(),
            }),
        }
    }

    /// Canonical name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Public => "AzurePublicCloud",
            Self::China => "AzureChinaCloud",
            Self::UsGovernment => "AzureUSGovernmentCloud",
        }
    }

    /// DNS suffix of vaults (or managed HSMs) in this cloud.
    ///
    /// # Errors
    ///
    /// Managed HSM only exists in the public cloud.
    pub fn vault_dns_suffix(self, managed_hsm: bool) -> Result<&'static str, KeyVaultError> {
        match (self, managed_hsm) {
            (Self::Public, false) => Ok("vault.azure.net"),
            (Self::China, false) => Ok("vault.azure.cn"),
            (Self::UsGovernment, false) => Ok("vault.usgovcloudapi.net"),
            (Self::Public, true) => Ok("managedhsm.azure.net"),
            (cloud, true) => Err(KeyVaultError::HsmUnavailable {
                cloud: cloud.name().to_string(),
            }),
        }
    }

    /// Token audience for the Key Vault data plane.
    #[must_use]
    pub const fn keyvault_resource(self, managed_hsm: bool) -> &'static str {
        match (self, managed_hsm) {
            (_, true) => "https://managedhsm.azure.net",
            (Self::Public, false) => "https://vault.azure.net",
            (Self::China, false) => "https://vault.azure.cn",
            (Self::UsGovernment, false) => "https://vault.usgovcloudapi.net",
        }
    }

    /// Azure Active Directory authority host.
    #[must_use]
    pub const fn aad_authority(self) -> &'static str {
        match self {
            Self::Public => "https://login.microsoftonline.com/",
            Self::China => "https://login.chinacloudapi.cn/",
            Self::UsGovernment => "https://login.microsoftonline.us/",
        }
    }
}

impl fmt::Display for AzureCloud {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Check a vault name against the Key Vault naming rules.
///
/// # Errors
///
/// Returns [`KeyVaultError::InvalidVaultName`] when the name is not 3-24
/// characters of `[-A-Za-z0-9]`.
pub fn validate_vault_name(vault_name: &str) -> Result<(), KeyVaultError> {
    let len = vault_name.len();
    if !(MIN_VAULT_NAME_LEN..=MAX_VAULT_NAME_LEN).contains(&len) {
        return Err(KeyVaultError::invalid_vault_name(
            vault_name,
            format!("must be between {MIN_VAULT_NAME_LEN} and {MAX_VAULT_NAME_LEN} chars"),
        ));
    }
    if !VAULT_NAME.is_match(vault_name) {
        return Err(KeyVaultError::invalid_vault_name(
            vault_name,
            "must match [-a-zA-Z0-9]{3,24}",
        ));
    }
    Ok(())
}

/// `https://{vault_name}.{suffix}/`
///
/// # Errors
///
/// Fails on an invalid vault name or when managed HSM is unavailable.
pub fn vault_url(vault_name: &str, managed_hsm: bool, cloud: AzureCloud) -> Result<String, KeyVaultError> {
    validate_vault_name(vault_name)?;
    let suffix = cloud.vault_dns_suffix(managed_hsm)?;
    Ok(format!("https://{vault_name}.{suffix}/"))
}

/// Rewrites a vault URL so that it goes through the proxy:
/// `http://{addr}:{port}/{host}/`.
#[must_use]
pub fn proxied_url(url: &str, proxy: &ProxyTarget) -> String {
    let rest = url.strip_prefix("https://").unwrap_or(url);
    format!("http://{}:{}/{rest}", proxy.address, proxy.port)
}

/// Identity provider endpoint: the proxy root in proxy mode, otherwise the
/// cloud's AAD authority.
#[must_use]
pub fn aad_endpoint(cloud: AzureCloud, proxy: Option<&ProxyTarget>) -> String {
    match proxy {
        Some(proxy) => proxy.base_url(),
        None => cloud.aad_authority().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_names() {
        assert_eq!(AzureCloud::from_name("").unwrap(), AzureCloud::Public);
        assert_eq!(AzureCloud::from_name("AzureCloud").unwrap(), AzureCloud::Public);
        assert_eq!(AzureCloud::from_name("azurepubliccloud").unwrap(), AzureCloud::Public);
        assert_eq!(AzureCloud::from_name("AzureChinaCloud").unwrap(), AzureCloud::China);
        assert_eq!(
            AzureCloud::from_name("AzureGovernmentCloud").unwrap(),
            AzureCloud::UsGovernment
        );
        assert_eq!(
            AzureCloud::from_name("AzureUSGovernmentCloud").unwrap(),
            AzureCloud::UsGovernment
        );
        assert!(matches!(
            AzureCloud::from_name("AzureGermanCloud"),
            Err(KeyVaultError::UnknownCloud { .. })
        ));
    }

    #[test]
    fn test_vault_url() {
        let cases = [
            ("testkv", false, AzureCloud::Public, "https://testkv.vault.azure.net/"),
            ("testkv", false, AzureCloud::China, "https://testkv.vault.azure.cn/"),
            ("testkv", false, AzureCloud::UsGovernment, "https://testkv.vault.usgovcloudapi.net/"),
            ("testkv", true, AzureCloud::Public, "https://testkv.managedhsm.azure.net/"),
        ];
        for (name, hsm, cloud, expected) in cases {
            assert_eq!(vault_url(name, hsm, cloud).unwrap(), expected);
        }
    }

    #[test]
    fn test_hsm_unavailable_outside_public_cloud() {
        for cloud in [AzureCloud::China, AzureCloud::UsGovernment] {
            let err = vault_url("testkv", true, cloud).unwrap_err();
            assert!(matches!(err, KeyVaultError::HsmUnavailable { .. }));
            assert!(err.to_string().contains("no HSM endpoint in cloud"));
        }
    }

    #[test]
    fn test_vault_name_boundaries() {
        assert!(validate_vault_name("ab").is_err());
        assert!(validate_vault_name("abc").is_ok());
        assert!(validate_vault_name(&"a".repeat(24)).is_ok());
        assert!(validate_vault_name(&"a".repeat(25)).is_err());
        assert!(validate_vault_name("test_kv").is_err());
        assert!(validate_vault_name("test-KV-01").is_ok());
    }

    #[test]
    fn test_proxied_url_and_aad_endpoint() {
        let proxy = ProxyTarget {
            address: "localhost".to_string(),
            port: 7788,
        };
        assert_eq!(
            proxied_url("https://testkv.vault.azure.net/", &proxy),
            "http://localhost:7788/testkv.vault.azure.net/"
        );
        assert_eq!(aad_endpoint(AzureCloud::Public, Some(&proxy)), "http://localhost:7788/");
        assert_eq!(
            aad_endpoint(AzureCloud::China, None),
            "https://login.chinacloudapi.cn/"
        );
    }
}
