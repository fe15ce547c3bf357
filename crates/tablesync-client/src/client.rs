//! Connection to a table host.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tablesync_protocol::{Frame, Reply, Request, Row, Schema, TableOptions, Version, PROTOCOL_VERSION};
use tablesync_transport::{Connection, FrameReceiver, FrameSender, TransportError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::error::ClientError;
use crate::keepalive::Keepalive;
use crate::multiplexer::{Multiplexer, Response, Routed, UpdateRoute};
use crate::table::TableHandle;

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Probe period. `None` follows the heartbeat the server announces;
    /// a zero duration disables probing.
    pub keepalive: Option<Duration>,
    /// Unanswered probes before the connection is considered lost.
    pub max_missed_pongs: u32,
    /// How long to wait for the server's `connected` frame.
    pub handshake_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keepalive: None,
            max_missed_pongs: 3,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Initial data for a remotely hosted table.
#[derive(Debug, Clone, PartialEq)]
pub enum TableSource {
    Rows(Vec<Row>),
    Schema(Schema),
    /// A columnar block in the engine's encoding.
    Columnar(Bytes),
}

enum Outbound {
    Frame(Frame),
    Close,
}

struct Inner {
    connection_id: String,
    server_version: Version,
    mux: Multiplexer,
    outbound: mpsc::UnboundedSender<Outbound>,
    keepalive: Keepalive,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Inner {
    fn send(&self, frame: Frame) -> bool {
        self.outbound.send(Outbound::Frame(frame)).is_ok()
    }

    fn dispatch(&self, frame: Frame) {
        self.keepalive.on_activity();

        match self.mux.on_frame(frame) {
            Routed::Unhandled(Frame::Ping { timestamp }) => {
                self.send(Frame::pong(timestamp));
            }
            Routed::Unhandled(Frame::Pong { timestamp }) => {
                trace!(?timestamp, "Pong");
            }
            Routed::Unhandled(other) => {
                warn!(
                    connection = %self.connection_id,
                    frame_type = ?other.frame_type(),
                    "Unexpected frame from server, dropped"
                );
            }
            Routed::Resolved(_)
            | Routed::Pushed(_)
            | Routed::Dropped(_)
            | Routed::Closed(_)
            | Routed::Violation(_) => {}
        }
    }

    /// Tear the connection down. Safe to call from any task, any number of times.
    fn teardown(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.keepalive.stop();
        let failed = self.mux.on_disconnect();
        let _ = self.outbound.send(Outbound::Close);
        self.shutdown.send_replace(true);

        info!(
            connection = %self.connection_id,
            reason,
            failed_requests = failed,
            "Connection closed"
        );
    }
}

/// A connection to a table host.
///
/// Cheap to clone; every clone and every handle derived from it shares the
/// same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Connect over WebSocket with default settings.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be opened or the handshake fails.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        Self::connect_with_config(url, ClientConfig::default()).await
    }

    /// Connect over WebSocket.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be opened or the handshake fails.
    pub async fn connect_with_config(url: &str, config: ClientConfig) -> Result<Self, ClientError> {
        let conn = tablesync_transport::connect(url).await?;
        Self::new(Box::new(conn), config).await
    }

    /// Run the protocol over an established connection.
    ///
    /// Waits for the server's `connected` frame, then starts the reader,
    /// the writer and the keepalive monitor.
    ///
    /// # Errors
    ///
    /// Fails if the handshake does not arrive in time or the server speaks an
    /// incompatible protocol version.
    pub async fn new(conn: Box<dyn Connection>, config: ClientConfig) -> Result<Self, ClientError> {
        let (mut sender, mut receiver) = conn.split();

        let handshake = tokio::time::timeout(config.handshake_timeout, receiver.recv()).await;
        let (connection_id, server_version, heartbeat) = match handshake {
            Ok(Ok(Some(Frame::Connected {
                connection_id,
                version,
                heartbeat,
            }))) => (connection_id, version, heartbeat),
            Ok(Ok(Some(other))) => {
                let _ = sender.close().await;
                return Err(ClientError::ProtocolViolation(format!(
                    "expected connected frame, got {:?}",
                    other.frame_type()
                )));
            }
            Ok(Ok(None)) => return Err(ClientError::ConnectionClosed),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                let _ = sender.close().await;
                return Err(ClientError::ProtocolViolation(format!(
                    "no connected frame within {:?}",
                    config.handshake_timeout
                )));
            }
        };

        if !server_version.is_compatible_with(&PROTOCOL_VERSION) {
            let _ = sender.close().await;
            return Err(ClientError::IncompatibleVersion {
                server: server_version,
                client: PROTOCOL_VERSION,
            });
        }

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            connection_id,
            server_version,
            mux: Multiplexer::new(),
            outbound,
            keepalive: Keepalive::new(),
            shutdown,
            closed: AtomicBool::new(false),
        });

        tokio::spawn(write_loop(Arc::downgrade(&inner), sender, outbound_rx));
        tokio::spawn(read_loop(Arc::downgrade(&inner), receiver, shutdown_rx));

        let period = config
            .keepalive
            .unwrap_or_else(|| Duration::from_millis(u64::from(heartbeat)));
        if !period.is_zero() {
            let probes = inner.outbound.clone();
            let weak = Arc::downgrade(&inner);
            inner.keepalive.start(
                period,
                config.max_missed_pongs,
                move || {
                    probes
                        .send(Outbound::Frame(Frame::ping_with_timestamp(now_millis())))
                        .is_ok()
                },
                move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.teardown("keepalive timeout");
                    }
                },
            );
        }

        debug!(
            connection = %inner.connection_id,
            version = %inner.server_version,
            keepalive = ?period,
            "Connected"
        );
        Ok(Self { inner })
    }

    /// Close the connection. Pending calls fail with
    /// [`ClientError::ConnectionClosed`]; calling it again does nothing.
    pub fn terminate(&self) {
        self.inner.teardown("terminated");
    }

    /// Names of every hosted table, in hosting order.
    ///
    /// # Errors
    ///
    /// Fails if the connection is gone.
    pub async fn get_hosted_table_names(&self) -> Result<Vec<String>, ClientError> {
        match self.call(Request::GetHostedTableNames).await?.reply {
            Reply::Names { names } => Ok(names),
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// Open a hosted table.
    ///
    /// # Errors
    ///
    /// Fails with a not-found error if no table is hosted under `name`.
    pub async fn open_table(&self, name: &str) -> Result<TableHandle, ClientError> {
        let request = Request::OpenTable { name: name.into() };
        match self.call(request).await?.reply {
            Reply::Table { name } => Ok(TableHandle::new(self.clone(), name)),
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// Create a table on the server and host it under `name`.
    ///
    /// # Errors
    ///
    /// Fails if the name is taken or the engine rejects the data.
    pub async fn host_table(
        &self,
        name: &str,
        source: TableSource,
        options: TableOptions,
    ) -> Result<TableHandle, ClientError> {
        let mut binary = Bytes::new();
        let (rows, schema) = match source {
            TableSource::Rows(rows) => (Some(rows), None),
            TableSource::Schema(schema) => (None, Some(schema)),
            TableSource::Columnar(data) => {
                binary = data;
                (None, None)
            }
        };

        let request = Request::HostTable {
            name: name.into(),
            options,
            rows,
            schema,
        };
        match self.call_with(request, binary, None).await?.reply {
            Reply::Table { name } => Ok(TableHandle::new(self.clone(), name)),
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// Eject a hosted table, destroying its views and subscriptions.
    ///
    /// # Errors
    ///
    /// Fails with a not-found error if no table is hosted under `name`.
    pub async fn eject_table(&self, name: &str) -> Result<(), ClientError> {
        let request = Request::EjectTable { name: name.into() };
        match self.call(request).await?.reply {
            Reply::Ok => Ok(()),
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// Identifier the server assigned to this connection.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    #[must_use]
    pub fn server_version(&self) -> Version {
        self.inner.server_version
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Requests still waiting for a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.mux.pending_count()
    }

    /// Whether the keepalive monitor is running.
    #[must_use]
    pub fn keepalive_active(&self) -> bool {
        self.inner.keepalive.is_active()
    }

    pub(crate) fn multiplexer(&self) -> &Multiplexer {
        &self.inner.mux
    }

    pub(crate) async fn call(&self, request: Request) -> Result<Response, ClientError> {
        self.call_with(request, Bytes::new(), None).await
    }

    /// Send a request and wait for its response.
    ///
    /// `route` receives pushes if the response opens a subscription.
    pub(crate) async fn call_with(
        &self,
        request: Request,
        binary: Bytes,
        route: Option<UpdateRoute>,
    ) -> Result<Response, ClientError> {
        let inner = &self.inner;
        let (id, rx) = inner.mux.register_pending(route)?;
        trace!(id, method = request.method(), "Sending request");

        let frame = if binary.is_empty() {
            Frame::request(id, request)
        } else {
            Frame::request_with_binary(id, request, binary)
        };
        if !inner.send(frame) {
            inner.mux.cancel_pending(id);
            return Err(ClientError::ConnectionClosed);
        }

        rx.await.unwrap_or(Err(ClientError::ConnectionClosed))
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection_id", &self.inner.connection_id)
            .field("server_version", &self.inner.server_version)
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn write_loop(
    inner: Weak<Inner>,
    mut sender: Box<dyn FrameSender>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(Outbound::Frame(frame)) = outbound.recv().await {
        if let Err(e) = sender.send(frame).await {
            warn!(error = %e, "Send failed");
            if let Some(inner) = inner.upgrade() {
                inner.teardown("send failed");
            }
            break;
        }
    }

    if let Err(e) = sender.close().await {
        debug!(error = %e, "Close failed");
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    mut receiver: Box<dyn FrameReceiver>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let result = tokio::select! {
            _ = shutdown.changed() => break,
            result = receiver.recv() => result,
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };

        match result {
            Ok(Some(frame)) => inner.dispatch(frame),
            Ok(None) => {
                inner.teardown("closed by server");
                break;
            }
            // A malformed frame is dropped; the connection stays up.
            Err(TransportError::Protocol(e)) => {
                warn!(connection = %inner.connection_id, error = %e, "Malformed frame, dropped");
            }
            Err(e) => {
                inner.teardown(&e.to_string());
                break;
            }
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
