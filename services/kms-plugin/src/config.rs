//! Type-safe configuration with validation.
//!
//! Two sources feed the plugin:
//! - command line flags (each with an environment fallback, `.env` honored)
//! - the Azure cloud provider file (`/etc/kubernetes/azure.json` by default)
//!
//! Both are parsed and validated in the same step and are read-only
//! afterwards.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::debug;

use crate::keyvault::cloud::AzureCloud;
use crate::metrics::MetricsBackend;
use crate::utils::{Endpoint, parse_endpoint, sanitize_string};

/// Default gRPC listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "unix:///opt/azurekms.socket";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to load config file {path}: {source}")]
    Read {
        /// File that was read
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Config file is not valid JSON for the expected schema
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// File that was parsed
        path: PathBuf,
        /// Underlying parse error
        source: serde_json::Error,
    },

    /// Config file could not be written back
    #[error("failed to write config file {path}: {source}")]
    Write {
        /// File that was written
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Listen address is not `unix://` or `tcp://`
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A value is present but unusable
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Flag or field name
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// A required value is missing
    #[error("missing required configuration: {0}")]
    MissingRequired(&'static str),

    /// Metrics backend other than prometheus
    #[error("unsupported metrics backend {0}")]
    UnsupportedMetricsBackend(String),
}

/// Command line configuration of the plugin.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "azure-kms-plugin",
    about = "Kubernetes KMS plugin backed by Azure Key Vault",
    disable_version_flag = true
)]
pub struct PluginConfig {
    /// gRPC listen address (`unix:///path` or `tcp://host:port`)
    #[arg(long, env = "KMS_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: String,

    /// Azure Key Vault name
    #[arg(long = "keyvault-name", env = "KMS_KEYVAULT_NAME", default_value = "")]
    pub keyvault_name: String,

    /// Azure Key Vault KMS key name
    #[arg(long, env = "KMS_KEY_NAME", default_value = "")]
    pub key_name: String,

    /// Azure Key Vault KMS key version
    #[arg(long, env = "KMS_KEY_VERSION", default_value = "")]
    pub key_version: String,

    /// Use an Azure Key Vault Managed HSM
    #[arg(long, env = "KMS_MANAGED_HSM")]
    pub managed_hsm: bool,

    /// Log as JSON lines
    #[arg(long, env = "KMS_LOG_FORMAT_JSON")]
    pub log_format_json: bool,

    /// Log level filter (`RUST_LOG` wins when set)
    #[arg(long, env = "KMS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Path of the Azure cloud provider config file
    #[arg(long, env = "KMS_CONFIG_FILE_PATH", default_value = "/etc/kubernetes/azure.json")]
    pub config_file_path: PathBuf,

    /// Print version information and exit
    #[arg(long)]
    pub version: bool,

    /// Port of the health check endpoint
    #[arg(long, env = "KMS_HEALTHZ_PORT", default_value_t = 8787)]
    pub healthz_port: u16,

    /// Path of the health check endpoint
    #[arg(long, env = "KMS_HEALTHZ_PATH", default_value = "/healthz")]
    pub healthz_path: String,

    /// RPC timeout of the health check (e.g. `20s`, `1500ms`, `1m30s`)
    #[arg(long, env = "KMS_HEALTHZ_TIMEOUT", default_value = "20s", value_parser = parse_duration)]
    pub healthz_timeout: Duration,

    /// Metrics backend
    #[arg(long, env = "KMS_METRICS_BACKEND", default_value = "prometheus")]
    pub metrics_backend: String,

    /// Port (or `host:port`) the metrics endpoint binds to
    #[arg(long, env = "KMS_METRICS_ADDR", default_value = "8095")]
    pub metrics_addr: String,

    /// Route identity provider and key vault traffic through a proxy
    #[arg(long, env = "KMS_PROXY_MODE")]
    pub proxy_mode: bool,

    /// Proxy address
    #[arg(long, env = "KMS_PROXY_ADDRESS", default_value = "")]
    pub proxy_address: String,

    /// Proxy port
    #[arg(long, env = "KMS_PROXY_PORT", default_value_t = 7788)]
    pub proxy_port: u16,

    /// Serve KMS v2 from a local HKDF/AES-GCM transformer seeded from this
    /// file instead of a key vault
    #[arg(long, env = "KMS_LOCAL_ENVELOPE_SEED_FILE")]
    pub local_envelope_seed_file: Option<PathBuf>,

    /// Create the key (or resolve its latest version) when no key version
    /// is configured
    #[arg(long, env = "KMS_CREATE_KEY_IF_MISSING")]
    pub create_key_if_missing: bool,

    /// Server side deadline of a single RPC
    #[arg(long, env = "KMS_RPC_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub rpc_timeout: Duration,

    /// Time allowed for in-flight RPCs to drain on shutdown
    #[arg(long, env = "KMS_SHUTDOWN_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub shutdown_timeout: Duration,
}

/// Where encryption happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMode {
    /// Azure Key Vault key (v1 and v2 APIs)
    KeyVault,
    /// Local envelope transformer (v2 API only)
    LocalEnvelope {
        /// File holding the cluster seed(s)
        seed_file: PathBuf,
    },
}

/// Proxy the plugin talks through in proxy mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    /// Host name or IP
    pub address: String,
    /// TCP port
    pub port: u16,
}

impl ProxyTarget {
    /// `http://address:port/`
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/", self.address, self.port)
    }
}

impl PluginConfig {
    /// Parses flags and environment, then validates.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config = Self::parse();
        if !config.version {
            config.validate()?;
        }
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first invalid or missing value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;
        if !self.healthz_path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                field: "healthz-path",
                reason: format!("{:?} must start with '/'", self.healthz_path),
            });
        }
        if self.healthz_port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "healthz-port",
                reason: "must be between 1 and 65535".to_string(),
            });
        }
        for (field, value) in [
            ("healthz-timeout", self.healthz_timeout),
            ("rpc-timeout", self.rpc_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than 0".to_string(),
                });
            }
        }
        MetricsBackend::from_name(&self.metrics_backend)?;
        self.metrics_socket_addr()?;
        if self.proxy_mode && self.proxy_address.trim().is_empty() {
            return Err(ConfigError::MissingRequired("proxy-address"));
        }
        Ok(())
    }

    /// Parsed listen address.
    ///
    /// # Errors
    ///
    /// Fails when `listen_addr` is malformed.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        parse_endpoint(&self.listen_addr)
    }

    /// Address of the metrics listener; a bare port binds all interfaces.
    ///
    /// # Errors
    ///
    /// Fails when `metrics_addr` is neither a port nor `host:port`.
    pub fn metrics_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr("metrics-addr", &self.metrics_addr)
    }

    /// Address of the health check listener.
    #[must_use]
    pub fn healthz_socket_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.healthz_port))
    }

    /// Proxy settings when proxy mode is on.
    #[must_use]
    pub fn proxy(&self) -> Option<ProxyTarget> {
        self.proxy_mode.then(|| ProxyTarget {
            address: sanitize_string(&self.proxy_address),
            port: self.proxy_port,
        })
    }

    /// Selected encryption backend.
    #[must_use]
    pub fn backend_mode(&self) -> BackendMode {
        match &self.local_envelope_seed_file {
            Some(seed_file) => BackendMode::LocalEnvelope {
                seed_file: seed_file.clone(),
            },
            None => BackendMode::KeyVault,
        }
    }
}

fn socket_addr(field: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    let value = value.trim();
    let invalid = |reason: String| ConfigError::InvalidValue { field, reason };

    if let Ok(port) = value.trim_start_matches(':').parse::<u16>() {
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    value
        .parse::<SocketAddr>()
        .map_err(|e| invalid(format!("{value:?}: {e}")))
}

/// Parses a bare number of seconds or a sum of `<number><unit>` segments
/// with units `h`, `m`, `s` and `ms` (`20s`, `1500ms`, `1m30s`).
///
/// # Errors
///
/// Returns a message suitable for clap when the value does not parse.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let invalid = || format!("invalid duration {value:?}");
    if value.is_empty() {
        return Err(invalid());
    }
    if value.bytes().all(|b| b.is_ascii_digit()) {
        return value.parse().map(Duration::from_secs).map_err(|_| invalid());
    }

    let mut total = Duration::ZERO;
    let mut rest = value;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let (number, tail) = rest.split_at(digits);
        let amount: u64 = number.parse().map_err(|_| invalid())?;
        let letters = tail.find(|c: char| !c.is_ascii_alphabetic()).unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(letters);
        let segment = match unit {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount.saturating_mul(60)),
            "h" => Duration::from_secs(amount.saturating_mul(3600)),
            _ => return Err(format!("invalid duration unit {unit:?} in {value:?}")),
        };
        total = total.checked_add(segment).ok_or_else(invalid)?;
        rest = tail;
    }
    Ok(total)
}

/// Contents of the Azure cloud provider config file.
///
/// Secret values are wrapped in [`SecretString`] and never printed.
#[derive(Debug, Default, Deserialize)]
pub struct AzureConfig {
    /// Cloud name (`AzurePublicCloud`, `AzureChinaCloud`, ...); empty means public
    #[serde(default)]
    pub cloud: String,
    /// AAD tenant
    #[serde(rename = "tenantId", default)]
    pub tenant_id: String,
    /// Service principal client id
    #[serde(rename = "aadClientId", default)]
    pub client_id: String,
    /// Service principal client secret
    #[serde(rename = "aadClientSecret", default, deserialize_with = "deserialize_secret")]
    pub client_secret: Option<SecretString>,
    /// Subscription id
    #[serde(rename = "subscriptionId", default)]
    pub subscription_id: String,
    /// Resource group name
    #[serde(rename = "resourceGroup", default)]
    pub resource_group: String,
    /// Use the VM managed identity
    #[serde(rename = "useManagedIdentityExtension", default)]
    pub use_managed_identity_extension: bool,
    /// Client id of a user-assigned managed identity
    #[serde(rename = "userAssignedIdentityID", default)]
    pub user_assigned_identity_id: String,
    /// Vault name used when `--keyvault-name` is not given
    #[serde(rename = "providerVaultName", default)]
    pub provider_vault_name: String,
    /// Key name used when `--key-name` is not given
    #[serde(rename = "providerKeyName", default)]
    pub provider_key_name: String,
    /// Key version used when `--key-version` is not given
    #[serde(rename = "providerKeyVersion", default)]
    pub provider_key_version: String,
    /// PKCS#12 client certificate path
    #[serde(rename = "aadClientCertPath", default)]
    pub client_cert_path: String,
    /// Password of the PKCS#12 client certificate
    #[serde(rename = "aadClientCertPassword", default, deserialize_with = "deserialize_secret")]
    pub client_cert_password: Option<SecretString>,
    /// Path of an externally managed identity descriptor
    #[serde(rename = "aadMSIDataPlaneIdentityPath", default)]
    pub msi_dataplane_identity_path: String,
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()).map(SecretString::from))
}

impl AzureConfig {
    /// Reads and validates the config file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read, is not valid JSON, or names an
    /// unknown cloud.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "populating AzureConfig");
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the parsed values.
    ///
    /// # Errors
    ///
    /// Fails on an unknown cloud name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        AzureCloud::from_name(&self.cloud).map_err(|e| ConfigError::InvalidValue {
            field: "cloud",
            reason: e.to_string(),
        })?;
        Ok(())
    }
}
