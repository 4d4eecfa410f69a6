//! Azure Key Vault KMS plugin library.
//!
//! Serves the Kubernetes KMS v1beta1 and v2 gRPC APIs on a local socket and
//! delegates envelope encryption to an Azure Key Vault key, or to a local
//! HKDF/AES-GCM transformer when running without a vault.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod backend;
pub mod config;
pub mod envelope;
pub mod error;
pub mod grpc;
pub mod healthz;
pub mod keyvault;
pub mod metrics;
pub mod provisioning;
pub mod shutdown;
pub mod utils;
pub mod version;

/// Generated protobuf types for both KMS API versions.
#[allow(missing_docs)]
pub mod proto {
    pub mod v1beta1 {
        tonic::include_proto!("v1beta1");
    }
    pub mod v2 {
        tonic::include_proto!("v2");
    }
}

// Re-exports for convenience
pub use config::{AzureConfig, PluginConfig};
pub use error::KmsError;
