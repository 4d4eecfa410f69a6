//! Build and protocol version constants.

use serde::Serialize;

/// API version reported by the v1beta1 `Version` RPC.
pub const KMS_V1_API_VERSION: &str = "v1beta1";

/// API version reported by the v2 `Status` RPC.
pub const KMS_V2_API_VERSION: &str = "v2beta1";

/// Runtime name reported by the v1beta1 `Version` RPC.
pub const RUNTIME_NAME: &str = "Microsoft AzureKMS";

/// Plugin build version.
pub const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commit the binary was built from, injected through `GIT_COMMIT`.
pub const GIT_COMMIT: &str = match option_env!("GIT_COMMIT") {
    Some(commit) => commit,
    None => "unknown",
};

/// Build date, injected through `BUILD_DATE`.
pub const BUILD_DATE: &str = match option_env!("BUILD_DATE") {
    Some(date) => date,
    None => "unknown",
};

/// Build metadata printed by `--version`.
#[derive(Debug, Serialize)]
pub struct VersionInfo {
    #[serde(rename = "BuildVersion")]
    build_version: &'static str,
    #[serde(rename = "GitCommit")]
    git_commit: &'static str,
    #[serde(rename = "BuildDate")]
    build_date: &'static str,
}

impl VersionInfo {
    /// Metadata of the running binary.
    #[must_use]
    pub const fn current() -> Self {
        Self {
            build_version: BUILD_VERSION,
            git_commit: GIT_COMMIT,
            build_date: BUILD_DATE,
        }
    }

    /// JSON rendering used by `--version`.
    ///
    /// # Errors
    ///
    /// Only fails if serialization itself fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// User agent sent to Key Vault and the identity provider.
#[must_use]
pub fn user_agent() -> String {
    format!(
        "k8s-kms-keyvault/{BUILD_VERSION} ({}/{}) {GIT_COMMIT}/{BUILD_DATE}",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
