//! HTTP and WebSocket handlers.
//!
//! The WebSocket endpoint hands every upgraded socket to a [`Session`];
//! `/health` reports liveness and a few host counters.

use crate::config::Config;
use crate::session::{Session, SessionConfig, SessionTracker};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tablesync_core::Host;
use tablesync_protocol::PROTOCOL_VERSION;
use tablesync_transport::{AxumConnection, Connection};
use tokio::sync::watch;
use tracing::debug;

/// Shared server state.
pub struct AppState {
    /// The table host.
    pub host: Arc<Host>,
    /// Server configuration.
    pub config: Config,
    pub(crate) sessions: Arc<SessionTracker>,
    pub(crate) shutdown: watch::Sender<bool>,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let host = Host::with_config(
            Arc::new(tablesync_core::MemoryEngine::new()),
            config.host_config(),
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            host: Arc::new(host),
            config,
            sessions: Arc::new(SessionTracker::default()),
            shutdown,
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat: self.config.heartbeat_interval(),
            idle_timeout: self.config.idle_timeout(),
        }
    }

    /// Serve one connection until it closes.
    pub async fn run_session(&self, conn: Box<dyn Connection>) {
        let _guard = self.sessions.enter();
        let session = Session::new(conn, Arc::clone(&self.host), self.session_config());
        session.run(self.shutdown.subscribe()).await;
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.host.stats();
    let status = if state.host.is_shut_down() {
        "shutting_down"
    } else {
        "ok"
    };

    axum::Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "tables": stats.tables,
        "views": stats.views,
        "connections": state.sessions.active(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let remote = connect_info.map(|ConnectInfo(addr)| addr);
    debug!(remote = ?remote, "WebSocket upgrade");

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| async move {
            let conn = AxumConnection::new(socket, remote);
            state.run_session(Box::new(conn)).await;
        })
}
