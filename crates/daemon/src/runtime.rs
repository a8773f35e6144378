// Process runtime: runs one coordinator until a termination signal or a
// controlled-restart request, then shuts it down.
//
// Exit codes: 0 after a signal, non-zero after a restart request so the
// supervisor starts a fresh process.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tether_common::identity::InboundMessage;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auto_heal::{ExitHook, ExitReason};
use crate::bootstrap::Coordinator;
use crate::clock::{SharedClock, TokioClock};
use crate::config::CoordinatorConfig;
use crate::socket::{DryRunSocket, SessionSocket};
use crate::status;
use crate::store::{DocumentStore, SqliteStore};

/// Exit hook that forwards restart requests to the supervising loop.
pub fn exit_channel() -> (ExitHook, mpsc::UnboundedReceiver<ExitReason>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let hook: ExitHook = Arc::new(move |reason| {
        let _ = tx.send(reason);
    });
    (hook, rx)
}

pub struct StatusServer {
    addr: SocketAddr,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl StatusServer {
    pub async fn bind<D: DocumentStore, S: SessionSocket>(
        addr: SocketAddr,
        coordinator: Arc<Coordinator<D, S>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind status listener on {addr}"))?;
        let addr = listener.local_addr().context("failed to read status listener address")?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let app = status::router(coordinator);
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop_rx.await;
                })
                .await;
            if let Err(error) = served {
                warn!(?error, "status server terminated unexpectedly");
            }
        });
        info!(listen_addr = %addr, "status server listening");
        Ok(Self { addr, stop_tx: Some(stop_tx), task: Some(task) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Production entry: SQLite store, dry-run transport, wall clock.
pub async fn run_standalone(config: CoordinatorConfig) -> Result<i32> {
    let store = SqliteStore::open(&config.database_path)?;
    info!(database = %config.database_path.display(), "durable store opened");
    run_until_signal(config, store, Arc::new(DryRunSocket::new()), TokioClock::shared()).await
}

pub async fn run_until_signal<D: DocumentStore, S: SessionSocket>(
    config: CoordinatorConfig,
    store: D,
    socket: Arc<S>,
    clock: SharedClock,
) -> Result<i32> {
    let status_addr = config.status_listen_addr;
    let (exit, exit_rx) = exit_channel();
    let (coordinator, inbound) = Coordinator::new(config, store, socket, clock, exit);
    let consumer = tokio::spawn(consume_inbound(inbound));

    let mode = coordinator.start().await;
    info!(instance_id = %coordinator.instance_id(), ?mode, "coordinator started");

    let server = match status_addr {
        Some(addr) => Some(StatusServer::bind(addr, coordinator.clone()).await?),
        None => None,
    };

    let code = supervise(&coordinator, exit_rx, shutdown_signal()).await;

    if let Some(server) = server {
        server.stop().await;
    }
    consumer.abort();
    Ok(code)
}

/// Wait for `shutdown` or the first restart request, then shut the
/// coordinator down. Returns the process exit code.
pub async fn supervise<D, S, F>(
    coordinator: &Arc<Coordinator<D, S>>,
    mut exit_rx: mpsc::UnboundedReceiver<ExitReason>,
    shutdown: F,
) -> i32
where
    D: DocumentStore,
    S: SessionSocket,
    F: Future<Output = ()>,
{
    let code = tokio::select! {
        _ = shutdown => 0,
        Some(reason) = exit_rx.recv() => {
            warn!(reason = reason.as_str(), "controlled restart requested");
            reason.exit_code()
        }
    };
    coordinator.shutdown().await;
    info!(code, "coordinator stopped");
    code
}

async fn consume_inbound(mut inbound: mpsc::UnboundedReceiver<InboundMessage>) {
    while let Some(msg) = inbound.recv().await {
        info!(id = ?msg.id, from = %msg.from, "inbound message");
        debug!(body = ?msg.body, "inbound message body");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
