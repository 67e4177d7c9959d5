//! Server state and HTTP listener.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::db::Db;
use crate::hub::{self, HubHandle, Submission};
use crate::registry::ConnectionRegistry;

/// Shared state accessible by all request and connection handlers.
pub struct SharedState {
    pub config: ServerConfig,
    /// Durable store. Appends are serialized through this lock.
    pub db: Mutex<Db>,
    /// Live connections, for dispatch and forced close.
    pub registry: ConnectionRegistry,
    /// Producer side of the dispatch queue.
    pub hub: HubHandle,
    pub started_at: Instant,
}

impl SharedState {
    /// Build state around an opened store. The returned receiver must be
    /// handed to [`hub::run`] for messages to flow.
    pub fn new(config: ServerConfig, db: Db) -> (Arc<Self>, mpsc::Receiver<Submission>) {
        let (hub, rx) = HubHandle::channel(config.dispatch_queue);
        let state = Arc::new(Self {
            config,
            db: Mutex::new(db),
            registry: ConnectionRegistry::new(),
            hub,
            started_at: Instant::now(),
        });
        (state, rx)
    }
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Open the database and start the dispatcher.
    fn build_state(&self) -> Result<Arc<SharedState>> {
        let opened = if self.config.in_memory() {
            tracing::warn!("Using in-memory database; chats will not survive a restart");
            Db::open_memory()
        } else {
            tracing::info!("Opening database: {}", self.config.db_path);
            Db::open(&self.config.db_path)
        };
        let db = opened.with_context(|| format!("Failed to open database {}", self.config.db_path))?;

        let (state, rx) = SharedState::new(self.config.clone(), db);
        tokio::spawn(hub::run(Arc::clone(&state), rx));
        Ok(state)
    }

    /// Serve until SIGINT/SIGTERM, then give open requests the configured
    /// grace period.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state()?;
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        tracing::info!("HTTP/WebSocket listener on {}", self.config.listen_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Server is shutting down...");
            let _ = shutdown_tx.send(true);
        });

        let mut graceful_rx = shutdown_rx.clone();
        let server = axum::serve(listener, crate::web::router(state))
            .with_graceful_shutdown(async move {
                let _ = graceful_rx.wait_for(|stop| *stop).await;
            })
            .into_future();

        let grace = self.config.shutdown_grace();
        let mut deadline_rx = shutdown_rx;
        let deadline = async move {
            let _ = deadline_rx.wait_for(|stop| *stop).await;
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            res = server => res.context("HTTP server error")?,
            _ = deadline => tracing::warn!("Shutdown grace period elapsed, closing remaining connections"),
        }
        tracing::info!("Server has stopped");
        Ok(())
    }

    /// Start the server and return the bound address, its state and the
    /// task handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, Arc<SharedState>, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let state = self.build_state()?;
        let router = crate::web::router(Arc::clone(&state));
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await?;
            Ok(())
        });

        Ok((addr, state, handle))
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
