//! The termbridge server.
//!
//! Listens for WebSocket connections on the terminal endpoint and hands
//! each one to the [`SessionManager`], which owns the session from then on.

mod manager;
mod table;

pub use manager::{SessionHandle, SessionManager};
pub use table::SessionTable;

use crate::config::{ConfigError, TerminalConfig};
use crate::transport::ws;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Path clients connect to.
pub const TERMINAL_PATH: &str = "/ws/terminal";

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// The termbridge server.
pub struct Server {
    listener: TcpListener,
    manager: Arc<SessionManager>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Bind the listener described by `config`.
    ///
    /// The workspace is created if it does not exist yet.
    pub async fn bind(config: TerminalConfig) -> Result<Self, ServerError> {
        Self::bind_with_table(config, Arc::new(SessionTable::new())).await
    }

    /// Like [`Server::bind`], registering sessions in an existing table.
    pub async fn bind_with_table(
        config: TerminalConfig,
        table: Arc<SessionTable>,
    ) -> Result<Self, ServerError> {
        config.ensure_workspace()?;

        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            listener,
            manager: Arc::new(SessionManager::new(config, table)),
            shutdown_tx,
        })
    }

    /// The address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::Io)
    }

    #[must_use]
    pub const fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// A handle that stops [`Server::run`] when sent to.
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run the accept loop until shutdown, then tear down every session.
    pub async fn run(&self) -> Result<(), ServerError> {
        let config = self.manager.config();
        info!(
            addr = %self.local_addr()?,
            path = TERMINAL_PATH,
            shell = %config.shell.display(),
            workspace = %config.workspace.display(),
            "Server listening"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let connections = TaskTracker::new();
        let stopping = CancellationToken::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!(%addr, "Accepted connection");
                            let manager = Arc::clone(&self.manager);
                            let stopping = stopping.clone();
                            connections.spawn(async move {
                                handle_connection(stream, addr, manager, stopping).await;
                            });
                        }
                        Err(e) => {
                            error!("{}", ServerError::Accept(e));
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        // Connections still handshaking give up; ones already spawning
        // finish registering so the sweep below sees them
        stopping.cancel();
        connections.close();
        connections.wait().await;

        self.manager.shutdown_all().await;
        info!("Server shut down");
        Ok(())
    }

    /// Request server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Upgrade one connection and start its session.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    manager: Arc<SessionManager>,
    stopping: CancellationToken,
) {
    let handshake = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        if request.uri().path() == TERMINAL_PATH {
            Ok(response)
        } else {
            Err(not_found())
        }
    });
    let upgraded = tokio::select! {
        upgraded = handshake => upgraded,
        () = stopping.cancelled() => {
            debug!(%addr, "Server stopping, dropping connection");
            return;
        }
    };

    let stream = match upgraded {
        Ok(stream) => stream,
        Err(e) => {
            debug!(%addr, "WebSocket handshake failed: {e}");
            return;
        }
    };

    let (sink, source) = ws::split(stream);
    match manager.accept(sink, source).await {
        Ok(handle) => {
            info!(%addr, session_id = %handle.id(), "Terminal connected");
        }
        Err(e) => {
            warn!(%addr, "Terminal session could not start: {e}");
        }
    }
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(format!(
        "no terminal here; connect to {TERMINAL_PATH}"
    )));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}
