//! gRPC servers for both KMS API versions and the listener plumbing.

mod interceptor;
mod v1;
mod v2;

pub use interceptor::{MetricsLayer, MetricsService, operation_name};
pub use v1::{KeyManagementServiceV1, V1_ALGORITHM};
pub use v2::KeyManagementServiceV2;

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_stream::Stream;
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tonic::transport::Server;
use tonic::transport::server::Connected;
use tracing::info;

use crate::metrics::StatsReporter;
use crate::proto::v1beta1::key_management_service_server::KeyManagementServiceServer as V1Server;
use crate::proto::v2::key_management_service_server::KeyManagementServiceServer as V2Server;
use crate::utils::Endpoint;

/// Listener and server errors.
#[derive(Error, Debug)]
pub enum ServeError {
    /// Socket could not be prepared or bound
    #[error("failed to listen on {endpoint}: {source}")]
    Bind {
        /// Endpoint being bound
        endpoint: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Server failed while running
    #[error("grpc server error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// The services one process exposes.
#[derive(Debug, Clone)]
pub struct KmsServices {
    /// Legacy API, absent in local envelope mode
    pub v1: Option<KeyManagementServiceV1>,
    /// Current API
    pub v2: KeyManagementServiceV2,
}

/// Incoming connections on either kind of endpoint.
#[derive(Debug)]
pub enum Listener {
    /// Unix domain socket
    Unix(UnixListenerStream),
    /// TCP socket
    Tcp(TcpListenerStream),
}

impl Listener {
    /// Bind `endpoint`. A stale unix socket file is removed first.
    ///
    /// # Errors
    ///
    /// Fails when the old socket cannot be removed or the bind fails.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, ServeError> {
        let bind_error = |source| ServeError::Bind {
            endpoint: endpoint.to_string(),
            source,
        };
        match endpoint {
            Endpoint::Unix(path) => {
                remove_stale_socket(path).map_err(bind_error)?;
                let listener = UnixListener::bind(path).map_err(bind_error)?;
                Ok(Self::Unix(UnixListenerStream::new(listener)))
            }
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await.map_err(bind_error)?;
                Ok(Self::Tcp(TcpListenerStream::new(listener)))
            }
        }
    }
}

fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Serve `services` on `listener` until `shutdown` resolves, then drain.
///
/// Each RPC is bounded by `rpc_timeout` and timed by the metrics layer.
///
/// # Errors
///
/// Propagates server transport failures.
pub async fn serve<F>(
    listener: Listener,
    services: KmsServices,
    rpc_timeout: Duration,
    reporter: StatsReporter,
    shutdown: F,
) -> Result<(), ServeError>
where
    F: Future<Output = ()> + Send,
{
    match listener {
        Listener::Unix(incoming) => serve_incoming(incoming, services, rpc_timeout, reporter, shutdown).await,
        Listener::Tcp(incoming) => serve_incoming(incoming, services, rpc_timeout, reporter, shutdown).await,
    }
}

async fn serve_incoming<I, IO, IE, F>(
    incoming: I,
    services: KmsServices,
    rpc_timeout: Duration,
    reporter: StatsReporter,
    shutdown: F,
) -> Result<(), ServeError>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IO::ConnectInfo: Clone + Send + Sync + 'static,
    IE: Into<Box<dyn std::error::Error + Send + Sync>>,
    F: Future<Output = ()>,
{
    info!(v1 = services.v1.is_some(), "grpc server listening");
    Server::builder()
        .timeout(rpc_timeout)
        .layer(MetricsLayer::new(reporter))
        .add_service(V2Server::new(services.v2))
        .add_optional_service(services.v1.map(V1Server::new))
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await?;
    info!("grpc server stopped");
    Ok(())
}
