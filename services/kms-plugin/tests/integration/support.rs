//! Server harness shared by the integration tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use kms_plugin::backend::{LocalEnvelope, RemoteKeyVault};
use kms_plugin::envelope::EnvelopeTransformer;
use kms_plugin::grpc::{self, KeyManagementServiceV1, KeyManagementServiceV2, KmsServices, Listener};
use kms_plugin::keyvault::{KeyReference, KeyVaultClient, MockKeyVault};
use kms_plugin::metrics::StatsReporter;
use kms_plugin::shutdown::ShutdownCoordinator;
use kms_plugin::utils::Endpoint;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tonic::transport::{Channel, Endpoint as TonicEndpoint, Uri};

pub const VAULT_URL: &str = "https://testkv.vault.azure.net/";

/// A running plugin server.
pub struct TestServer {
    pub endpoint: Endpoint,
    pub vault: Option<Arc<MockKeyVault>>,
    coordinator: ShutdownCoordinator,
    handle: JoinHandle<Result<(), grpc::ServeError>>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    /// Serve v1 and v2 over the in-memory vault.
    pub async fn key_vault() -> Self {
        Self::key_vault_with_timeout(Duration::from_secs(5)).await
    }

    /// Same as [`TestServer::key_vault`] with a custom per-RPC deadline.
    pub async fn key_vault_with_timeout(rpc_timeout: Duration) -> Self {
        let vault = Arc::new(MockKeyVault::new(VAULT_URL).with_key("kek", "v1"));
        let client = Arc::new(
            KeyVaultClient::with_transport(
                KeyReference {
                    vault_url: VAULT_URL.to_string(),
                    key_name: "kek".to_string(),
                    key_version: "v1".to_string(),
                },
                vault.clone(),
            )
            .unwrap(),
        );
        let reporter = StatsReporter::new();
        let services = KmsServices {
            v1: Some(KeyManagementServiceV1::new(client.clone(), reporter)),
            v2: KeyManagementServiceV2::new(Arc::new(RemoteKeyVault::new(client)), reporter),
        };
        Self::start(services, Some(vault), rpc_timeout).await
    }

    /// Serve v2 only over the local envelope transformer.
    pub async fn local_envelope() -> Self {
        let reporter = StatsReporter::new();
        let backend = LocalEnvelope::new(EnvelopeTransformer::new(vec![11u8; 32]).unwrap(), reporter);
        let services = KmsServices {
            v1: None,
            v2: KeyManagementServiceV2::new(Arc::new(backend), reporter),
        };
        Self::start(services, None, Duration::from_secs(5)).await
    }

    async fn start(services: KmsServices, vault: Option<Arc<MockKeyVault>>, rpc_timeout: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(dir.path().join("kms.sock"));
        let listener = Listener::bind(&endpoint).await.unwrap();

        let coordinator = ShutdownCoordinator::new();
        let stop = coordinator.subscribe();
        let handle = tokio::spawn(grpc::serve(
            listener,
            services,
            rpc_timeout,
            StatsReporter::new(),
            stop.recv(),
        ));
        Self {
            endpoint,
            vault,
            coordinator,
            handle,
            _dir: dir,
        }
    }

    pub fn vault(&self) -> &MockKeyVault {
        self.vault.as_deref().unwrap()
    }

    pub fn socket_path(&self) -> PathBuf {
        match &self.endpoint {
            Endpoint::Unix(path) => path.clone(),
            Endpoint::Tcp(_) => unreachable!("test servers listen on unix sockets"),
        }
    }

    /// Client channel over the server socket.
    pub async fn channel(&self) -> Channel {
        let path = self.socket_path();
        TonicEndpoint::from_static("http://[::]:50051")
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let path = path.clone();
                async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
            }))
            .await
            .unwrap()
    }

    pub async fn stop(self) {
        self.coordinator.trigger();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
