//! Graceful shutdown.
//!
//! One coordinator owns the shutdown flag and the auxiliary server tasks
//! (metrics, health check). Every server gets a [`ShutdownSignal`] and stops
//! accepting work once it fires; the coordinator then waits for the tasks to
//! drain and aborts whatever is left after the timeout.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Shutdown coordinator for graceful termination
#[derive(Debug)]
pub struct ShutdownCoordinator {
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl ShutdownCoordinator {
    /// Creates a new shutdown coordinator
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: JoinSet::new(),
        }
    }

    /// Signal that resolves once shutdown starts.
    #[must_use]
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.shutdown_tx.subscribe(),
        }
    }

    /// Start shutdown; every subscribed signal resolves.
    pub fn trigger(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Track a server task. Its error, if any, is logged with `name`.
    pub fn spawn<F, E>(&mut self, name: &'static str, future: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.tasks.spawn(async move {
            match future.await {
                Ok(()) => info!(task = name, "task stopped"),
                Err(e) => error!(task = name, error = %e, "task failed"),
            }
        });
    }

    /// Number of tracked tasks still running.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Trigger shutdown and wait up to `timeout` for tracked tasks.
    ///
    /// Returns `false` when tasks had to be aborted.
    pub async fn shutdown(mut self, timeout: Duration) -> bool {
        info!("initiating graceful shutdown");
        self.trigger();

        let drained = tokio::time::timeout(timeout, async {
            while let Some(result) = self.tasks.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "task panicked during shutdown");
                }
            }
        })
        .await;

        match drained {
            Ok(()) => {
                info!("shutdown complete");
                true
            }
            Err(_) => {
                warn!(timeout = ?timeout, "shutdown timeout reached, aborting remaining tasks");
                self.tasks.abort_all();
                false
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Shutdown signal receiver
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Waits for shutdown. Also resolves when the coordinator is gone.
    pub async fn recv(mut self) {
        // An error means the sender was dropped, which is shutdown too.
        let _ = self.receiver.wait_for(|stopping| *stopping).await;
    }

    /// Whether shutdown has started.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Waits for SIGTERM or SIGINT.
///
/// A handler that cannot be installed is logged and never fires; the other
/// one still works.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
