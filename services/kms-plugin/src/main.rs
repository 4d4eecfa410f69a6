//! Azure KMS plugin - main entry point
//!
//! Serves the Kubernetes KMS gRPC APIs on a local socket, plus the
//! Prometheus metrics and health check endpoints, until SIGINT or SIGTERM.

use std::sync::Arc;

use anyhow::{Context, bail};
use kms_common::{TracingConfig, init_tracing};
use tracing::{info, warn};

use kms_plugin::backend::{LocalEnvelope, RemoteKeyVault};
use kms_plugin::config::{AzureConfig, BackendMode, PluginConfig};
use kms_plugin::envelope::EnvelopeTransformer;
use kms_plugin::grpc::{self, KeyManagementServiceV1, KeyManagementServiceV2, KmsServices, Listener};
use kms_plugin::healthz::{self, HealthChecker};
use kms_plugin::keyvault::{KeyReference, KeyVaultClient, KeyVaultOptions, VaultConnection};
use kms_plugin::metrics::{StatsReporter, serve_metrics};
use kms_plugin::provisioning::KeyProvisioner;
use kms_plugin::shutdown::{ShutdownCoordinator, wait_for_signal};
use kms_plugin::utils::sanitize_string;
use kms_plugin::version::{BUILD_VERSION, GIT_COMMIT, VersionInfo};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PluginConfig::load()?;
    if config.version {
        println!("{}", VersionInfo::current().to_json()?);
        return Ok(());
    }

    init_tracing(
        &TracingConfig::default()
            .with_log_level(&config.log_level)
            .with_json_output(config.log_format_json),
    )?;
    info!(version = BUILD_VERSION, commit = GIT_COMMIT, "starting azure kms plugin");

    let reporter = StatsReporter::new();
    let services = build_services(&config, reporter).await?;
    let legacy_enabled = services.v1.is_some();

    let endpoint = config.endpoint()?;
    let listener = Listener::bind(&endpoint).await?;

    let mut coordinator = ShutdownCoordinator::new();
    let metrics_stop = coordinator.subscribe();
    coordinator.spawn(
        "metrics",
        serve_metrics(config.metrics_socket_addr()?, metrics_stop.recv()),
    );

    let health_router = match config.backend_mode() {
        BackendMode::KeyVault => healthz::router(
            &config.healthz_path,
            HealthChecker::new(endpoint.clone(), config.healthz_timeout, legacy_enabled),
        ),
        BackendMode::LocalEnvelope { .. } => healthz::always_healthy_router(&config.healthz_path),
    };
    let healthz_stop = coordinator.subscribe();
    coordinator.spawn(
        "healthz",
        healthz::serve(config.healthz_socket_addr(), health_router, healthz_stop.recv()),
    );

    let server = grpc::serve(
        listener,
        services,
        config.rpc_timeout,
        reporter,
        coordinator.subscribe().recv(),
    );
    tokio::pin!(server);

    let served = tokio::select! {
        result = &mut server => result,
        () = wait_for_signal() => {
            coordinator.trigger();
            match tokio::time::timeout(config.shutdown_timeout, &mut server).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout = ?config.shutdown_timeout, "in-flight requests did not drain in time");
                    Ok(())
                }
            }
        }
    };

    coordinator.shutdown(config.shutdown_timeout).await;
    served?;
    info!("azure kms plugin stopped");
    Ok(())
}

/// Build the gRPC services for the configured backend.
async fn build_services(config: &PluginConfig, reporter: StatsReporter) -> anyhow::Result<KmsServices> {
    match config.backend_mode() {
        BackendMode::LocalEnvelope { seed_file } => {
            let transformer = EnvelopeTransformer::from_seed_file(&seed_file)
                .with_context(|| format!("loading envelope seed from {}", seed_file.display()))?;
            info!(seed_file = %seed_file.display(), "serving kms v2 from the local envelope transformer");
            Ok(KmsServices {
                v1: None,
                v2: KeyManagementServiceV2::new(Arc::new(LocalEnvelope::new(transformer, reporter)), reporter),
            })
        }
        BackendMode::KeyVault => {
            let client = Arc::new(key_vault_client(config).await?);
            Ok(KmsServices {
                v1: Some(KeyManagementServiceV1::new(client.clone(), reporter)),
                v2: KeyManagementServiceV2::new(Arc::new(RemoteKeyVault::new(client)), reporter),
            })
        }
    }
}

/// Flags win over the provider config's `provider*` fields.
fn first_set(flag: &str, fallback: &str) -> String {
    let flag = sanitize_string(flag);
    if flag.is_empty() {
        sanitize_string(fallback)
    } else {
        flag
    }
}

async fn key_vault_client(config: &PluginConfig) -> anyhow::Result<KeyVaultClient> {
    let azure = AzureConfig::load(&config.config_file_path)?;
    let options = KeyVaultOptions {
        vault_name: first_set(&config.keyvault_name, &azure.provider_vault_name),
        key_name: first_set(&config.key_name, &azure.provider_key_name),
        key_version: first_set(&config.key_version, &azure.provider_key_version),
        managed_hsm: config.managed_hsm,
        proxy: config.proxy(),
    };

    if !options.key_version.is_empty() || !config.create_key_if_missing {
        return Ok(KeyVaultClient::new(&azure, &options)?);
    }

    if options.vault_name.is_empty() || options.key_name.is_empty() {
        bail!("key vault name and key name are required to provision a key");
    }
    let connection = VaultConnection::open(
        &azure,
        &options.vault_name,
        options.managed_hsm,
        options.proxy.as_ref(),
    )?;
    let key_version = KeyProvisioner::new(connection.transport.clone(), &config.config_file_path)
        .ensure_key_version(&options.key_name)
        .await?;
    Ok(KeyVaultClient::with_transport(
        KeyReference {
            vault_url: connection.vault_url,
            key_name: options.key_name,
            key_version,
        },
        connection.transport,
    )?)
}
