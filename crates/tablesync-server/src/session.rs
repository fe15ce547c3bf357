//! Per-connection session.
//!
//! A session is a single task that owns one connection. It processes
//! inbound frames strictly in arrival order and interleaves them with the
//! update pushes queued for its subscriptions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tablesync_core::{Host, SyncError, TableData, TableInit, UpdateNotification, UpdateSink};
use tablesync_protocol::{ErrorCode, Frame, Reply, Request, PROTOCOL_VERSION};
use tablesync_transport::{Connection, ConnectionId, FrameReceiver, FrameSender, TransportError};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, trace, warn};

use crate::metrics;

/// Session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Heartbeat announced to the client.
    pub heartbeat: Duration,
    /// Close the session after this much inbound silence.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(30),
            idle_timeout: None,
        }
    }
}

/// Counts live sessions so shutdown can wait for them.
#[derive(Debug, Default)]
pub struct SessionTracker {
    active: AtomicUsize,
    idle: Notify,
}

/// Held by a running session.
pub struct SessionGuard {
    tracker: Arc<SessionTracker>,
}

impl SessionTracker {
    #[must_use]
    pub fn enter(self: &Arc<Self>) -> SessionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        SessionGuard {
            tracker: Arc::clone(self),
        }
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait until no session is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

/// One connected client.
pub struct Session {
    id: ConnectionId,
    host: Arc<Host>,
    config: SessionConfig,
    sender: Box<dyn FrameSender>,
    receiver: Box<dyn FrameReceiver>,
    sink: UpdateSink,
    updates: mpsc::UnboundedReceiver<UpdateNotification>,
}

impl Session {
    #[must_use]
    pub fn new(conn: Box<dyn Connection>, host: Arc<Host>, config: SessionConfig) -> Self {
        let id = conn.id().clone();
        if let Some(addr) = conn.remote_addr() {
            debug!(connection = %id, remote = %addr, "New connection");
        }

        let (sender, receiver) = conn.split();
        let (sink, updates) = mpsc::unbounded_channel();
        Self {
            id,
            host,
            config,
            sender,
            receiver,
            sink,
            updates,
        }
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Run until the peer disconnects, goes silent, or `shutdown` flips.
    ///
    /// Everything the connection owned is released before this returns.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let _metrics_guard = metrics::ConnectionMetricsGuard::new();

        let heartbeat = u32::try_from(self.config.heartbeat.as_millis()).unwrap_or(u32::MAX);
        let connected = Frame::connected(self.id.as_str(), PROTOCOL_VERSION, heartbeat);
        if let Err(e) = self.send(connected).await {
            warn!(connection = %self.id, error = %e, "Failed to send connected frame");
            return;
        }

        let reason = self.process(&mut shutdown).await;

        self.host.remove_connection(self.id.as_str());
        metrics::set_host_stats(&self.host.stats());
        if let Err(e) = self.sender.close().await {
            debug!(connection = %self.id, error = %e, "Close failed");
        }

        info!(connection = %self.id, reason, "Session closed");
    }

    async fn process(&mut self, shutdown: &mut watch::Receiver<bool>) -> &'static str {
        if *shutdown.borrow() {
            return "server shutdown";
        }

        let mut deadline = self
            .config
            .idle_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => return "server shutdown",

                () = sleep_until(deadline) => {
                    warn!(connection = %self.id, "Connection idle, closing");
                    metrics::record_error("idle_timeout");
                    return "idle timeout";
                }

                Some(notification) = self.updates.recv() => {
                    if !notification.is_live() {
                        trace!(
                            connection = %self.id,
                            subscription = notification.subscription_id,
                            "Dropping push for cancelled subscription"
                        );
                        continue;
                    }
                    if self.send(notification.into_frame()).await.is_err() {
                        return "send failed";
                    }
                }

                result = self.receiver.recv() => match result {
                    Ok(Some(frame)) => {
                        if let (Some(timeout), Some(deadline)) = (self.config.idle_timeout, deadline.as_mut()) {
                            *deadline = tokio::time::Instant::now() + timeout;
                        }
                        metrics::record_frame("inbound", frame.attachment().map_or(0, |a| a.len()));
                        if self.handle_frame(frame).await.is_err() {
                            return "send failed";
                        }
                    }
                    Ok(None) => return "closed by peer",
                    Err(TransportError::Protocol(e)) => {
                        warn!(connection = %self.id, error = %e, "Malformed frame, dropped");
                        metrics::record_error("protocol_violation");
                    }
                    Err(e) => {
                        debug!(connection = %self.id, error = %e, "Receive failed");
                        return "receive failed";
                    }
                },
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        match frame {
            Frame::Request {
                id,
                request,
                binary,
            } => {
                let method = request.method();
                let started = Instant::now();

                let outcome = dispatch(
                    &self.host,
                    self.id.as_str(),
                    &self.sink,
                    request,
                    binary.into_bytes(),
                )
                .await;
                let response = match outcome {
                    Ok((reply, data)) if data.is_empty() => Frame::response(id, reply),
                    Ok((reply, data)) => Frame::response_with_binary(id, reply, data),
                    Err(e) => {
                        debug!(connection = %self.id, id, method, error = %e, "Request failed");
                        metrics::record_error(error_kind(&e));
                        Frame::error(id, e.code(), e.to_string())
                    }
                };

                metrics::record_request(method, started.elapsed().as_secs_f64());
                self.send(response).await
            }

            Frame::Ping { timestamp } => self.send(Frame::pong(timestamp)).await,

            Frame::Pong { .. } => Ok(()),

            other => {
                warn!(
                    connection = %self.id,
                    frame_type = ?other.frame_type(),
                    "Unexpected frame, dropped"
                );
                metrics::record_error("protocol_violation");
                Ok(())
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        metrics::record_frame("outbound", frame.attachment().map_or(0, |a| a.len()));
        self.sender.send(frame).await.map_err(|e| {
            debug!(connection = %self.id, error = %e, "Send failed");
            e
        })
    }
}

/// Execute one request against the host.
async fn dispatch(
    host: &Host,
    connection: &str,
    sink: &UpdateSink,
    request: Request,
    binary: Bytes,
) -> Result<(Reply, Bytes), SyncError> {
    let reply = match request {
        Request::GetHostedTableNames => Reply::Names {
            names: host.table_names(),
        },

        Request::HostTable {
            name,
            options,
            rows,
            schema,
        } => {
            let init = match (rows, schema) {
                (Some(rows), _) => TableInit::Rows(rows),
                (None, Some(schema)) => TableInit::Schema(schema),
                (None, None) => TableInit::Columnar(binary),
            };
            host.create_table(&name, init, options)?;
            metrics::set_host_stats(&host.stats());
            Reply::Table { name }
        }

        Request::EjectTable { name } => {
            host.eject_table(&name).await?;
            metrics::set_host_stats(&host.stats());
            Reply::Ok
        }

        Request::OpenTable { name } => Reply::Table {
            name: host.open_table(&name)?.name().to_string(),
        },

        Request::TableSize { table } => Reply::Size {
            size: host.size(&table).await? as u64,
        },

        Request::TableSchema { table } => Reply::Schema {
            schema: host.schema(&table).await?,
        },

        Request::MakePort { table } => Reply::Port {
            port_id: host.make_port(&table).await?,
        },

        Request::Update {
            table,
            port_id,
            rows,
        } => {
            let data = match rows {
                Some(rows) => TableData::Rows(rows),
                None => TableData::Columnar(binary),
            };
            let report = host.update(&table, data, port_id).await?;
            metrics::record_broadcast(&report);
            Reply::Ok
        }

        Request::MakeView { table, config } => Reply::View {
            view_id: host.make_view(&table, config, Some(connection)).await?,
        },

        Request::ViewDelete { view_id } => {
            host.delete_view(view_id)?;
            Reply::Ok
        }

        Request::ViewNumRows { view_id } => Reply::Size {
            size: host.view_num_rows(view_id)? as u64,
        },

        Request::ViewToJson { view_id } => Reply::Rows {
            rows: host.view_to_json(view_id)?,
        },

        Request::ViewToColumnar { view_id } => {
            return Ok((Reply::Columnar, host.view_to_columnar(view_id)?));
        }

        Request::Subscribe { view_id, mode } => Reply::Subscription {
            subscription_id: host.subscribe(view_id, connection, mode, sink.clone())?,
        },

        Request::Unsubscribe { subscription_id } => {
            host.unsubscribe(subscription_id, connection)?;
            Reply::Ok
        }
    };

    Ok((reply, Bytes::new()))
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn error_kind(error: &SyncError) -> &'static str {
    match error.code() {
        ErrorCode::NameConflict => "name_conflict",
        ErrorCode::NotFound => "not_found",
        ErrorCode::Validation => "validation",
        ErrorCode::ConnectionClosed => "connection_closed",
        ErrorCode::ProtocolViolation => "protocol_violation",
        ErrorCode::Internal => "internal",
    }
}
