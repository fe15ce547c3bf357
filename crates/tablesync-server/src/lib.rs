//! # tablesync-server
//!
//! Hosts tables for remote clients.
//!
//! [`Server`] owns one [`Host`] and runs a [`session::Session`] per
//! connection, over axum WebSockets or any [`Transport`].
//!
//! ```rust,ignore
//! use tablesync_server::{Config, Server};
//!
//! let server = Server::new(Config::default());
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! server.serve(listener).await?;
//! ```

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tablesync_core::Host;
use tablesync_transport::{Transport, TransportError};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

pub use config::Config;
pub use handlers::AppState;

/// How long shutdown waits for sessions to close before ejecting tables.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A tablesync server. Clones share the same host and sessions.
#[derive(Clone)]
pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            state: Arc::new(AppState::new(config)),
        }
    }

    /// The table host, for hosting tables in-process.
    #[must_use]
    pub fn host(&self) -> &Arc<Host> {
        &self.state.host
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.state.config
    }

    /// Sessions currently running.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.sessions.active()
    }

    /// HTTP router with the WebSocket and health endpoints.
    pub fn router(&self) -> axum::Router {
        handlers::router(Arc::clone(&self.state))
    }

    /// Serve HTTP and WebSocket clients on `listener` until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!("tablesync server listening on {}", addr);
        info!(
            "WebSocket endpoint: ws://{}{}",
            addr, self.state.config.transport.websocket_path
        );

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(stopped(self.state.shutdown.subscribe()))
            .await?;
        Ok(())
    }

    /// Accept connections from `transport` until shutdown or until the
    /// transport closes.
    ///
    /// # Errors
    ///
    /// Currently infallible; accept errors are logged and skipped.
    pub async fn serve_transport(&self, transport: Arc<dyn Transport>) -> anyhow::Result<()> {
        let stop = stopped(self.state.shutdown.subscribe());
        tokio::pin!(stop);

        info!(transport = transport.name(), "Accepting connections");
        loop {
            let accepted = tokio::select! {
                () = &mut stop => break,
                accepted = transport.accept() => accepted,
            };

            match accepted {
                Ok(conn) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move { state.run_session(conn).await });
                }
                Err(TransportError::ConnectionClosed) => {
                    info!(transport = transport.name(), "Transport closed");
                    break;
                }
                Err(e) => {
                    warn!(transport = transport.name(), error = %e, "Accept failed");
                    metrics::record_error("accept");
                }
            }
        }
        Ok(())
    }

    /// Stop accepting, close every session, then eject every table.
    ///
    /// Returns at once if shutdown already started.
    pub async fn shutdown(&self) {
        if self.state.shutdown.send_replace(true) {
            return;
        }
        info!(sessions = self.connection_count(), "Shutting down");

        if tokio::time::timeout(SHUTDOWN_GRACE, self.state.sessions.wait_idle())
            .await
            .is_err()
        {
            warn!(
                sessions = self.connection_count(),
                "Sessions still open after grace period"
            );
        }

        self.state.host.shutdown().await;
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.state.shutdown.borrow()
    }
}

/// Resolves once shutdown is signalled.
async fn stopped(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
