//! WebSocket transport implementation.
//!
//! Each tablesync frame travels as one binary WebSocket message, built on
//! tokio-tungstenite. Works for both the accepting and the connecting side.

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tablesync_protocol::{codec, Frame, ProtocolError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_async, connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::traits::{
    decode_buffered, Connection, ConnectionId, FrameReceiver, FrameSender, Transport,
    TransportError,
};

/// Default maximum message size.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = tablesync_protocol::codec::MAX_FRAME_SIZE;

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Standalone WebSocket listener.
pub struct WebSocketTransport {
    listener: TcpListener,
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Bind a new WebSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("WebSocket transport listening on {}", config.bind_addr);
        Ok(Self { listener, config })
    }

    /// Bind with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(WebSocketConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, addr) = self.listener.accept().await?;
        debug!("Accepted TCP connection from {}", addr);

        let ws_stream = accept_async(stream).await.map_err(|e| {
            error!("WebSocket handshake failed: {}", e);
            TransportError::Other(format!("WebSocket handshake failed: {e}"))
        })?;

        let conn = WebSocketConnection::new(ws_stream, Some(addr), self.config.max_message_size);
        Ok(Box::new(conn))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Connect to a tablesync server at `url` (e.g. `ws://127.0.0.1:8080/ws`).
///
/// # Errors
///
/// Returns an error if the TCP connection or the WebSocket handshake fails.
pub async fn connect(
    url: &str,
) -> Result<WebSocketConnection<MaybeTlsStream<TcpStream>>, TransportError> {
    let (ws_stream, _response) = connect_async(url)
        .await
        .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

    debug!(url = %url, "WebSocket connected");
    Ok(WebSocketConnection::new(ws_stream, None, DEFAULT_MAX_MESSAGE_SIZE))
}

/// A WebSocket connection over any byte stream.
pub struct WebSocketConnection<S> {
    id: ConnectionId,
    stream: WebSocketStream<S>,
    remote_addr: Option<SocketAddr>,
    max_message_size: usize,
}

impl<S> WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an established WebSocket stream.
    #[must_use]
    pub fn new(
        stream: WebSocketStream<S>,
        remote_addr: Option<SocketAddr>,
        max_message_size: usize,
    ) -> Self {
        Self {
            id: ConnectionId::generate(),
            stream,
            remote_addr,
            max_message_size,
        }
    }
}

impl<S> Connection for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|a| a.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSender>, Box<dyn FrameReceiver>) {
        let (sink, stream) = self.stream.split();
        let sender = WebSocketSender { sink, closed: false };
        let receiver = WebSocketReceiver {
            stream,
            read_buffer: BytesMut::with_capacity(4096),
            max_message_size: self.max_message_size,
        };
        (Box::new(sender), Box::new(receiver))
    }
}

struct WebSocketSender<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    closed: bool,
}

#[async_trait]
impl<S> FrameSender for WebSocketSender<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }

        let data = codec::encode(&frame)?;
        self.sink
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => {
                    TransportError::ConnectionClosed
                }
                e => TransportError::SendFailed(e.to_string()),
            })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }

        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Other(format!("Failed to close: {e}"))),
        }
    }
}

struct WebSocketReceiver<S> {
    stream: SplitStream<WebSocketStream<S>>,
    read_buffer: BytesMut,
    max_message_size: usize,
}

#[async_trait]
impl<S> FrameReceiver for WebSocketReceiver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        if let Some(frame) = decode_buffered(&mut self.read_buffer)? {
            return Ok(Some(frame));
        }

        loop {
            let data = match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => data,
                // Text frames carry the same encoding.
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                // Pings are answered by tungstenite itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            };

            if data.len() > self.max_message_size {
                warn!(
                    "Message too large: {} bytes (max: {})",
                    data.len(),
                    self.max_message_size
                );
                return Err(ProtocolError::FrameTooLarge(data.len()).into());
            }

            self.read_buffer.extend_from_slice(&data);
            if let Some(frame) = decode_buffered(&mut self.read_buffer)? {
                return Ok(Some(frame));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_protocol::Request;

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[tokio::test]
    async fn test_frames_cross_a_real_socket() {
        let transport = WebSocketTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let conn = transport.accept().await.unwrap();
            let (mut tx, mut rx) = conn.split();
            let frame = rx.recv().await.unwrap().unwrap();
            tx.send(frame).await.unwrap();
            // Wait for the client to hang up.
            assert!(rx.recv().await.unwrap().is_none());
        });

        let conn = connect(&format!("ws://{addr}")).await.unwrap();
        let (mut tx, mut rx) = Box::new(conn).split();

        let frame = Frame::request_with_binary(
            7,
            Request::Update {
                table: "t".into(),
                port_id: 0,
                rows: None,
            },
            vec![1u8, 2, 3],
        );
        tx.send(frame.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Some(frame));

        tx.close().await.unwrap();
        tx.close().await.unwrap();
        server.await.unwrap();
    }
}
