//! Transport abstraction traits for tablesync.
//!
//! A connection is split into a sending and a receiving half so a session
//! can write responses and pushes while it waits for the next request.

use async_trait::async_trait;
use bytes::BytesMut;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tablesync_protocol::{codec, Frame};
use thiserror::Error;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let seq = NEXT.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{timestamp:x}_{seq}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to connect.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] tablesync_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A transport that can accept connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new connection.
    ///
    /// Blocks until a connection is available or the transport is closed.
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Get the transport name (e.g., "websocket", "memory").
    fn name(&self) -> &'static str;

    /// Check if the transport is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// An established connection, not yet split.
pub trait Connection: Send {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split into independently usable halves.
    fn split(self: Box<Self>) -> (Box<dyn FrameSender>, Box<dyn FrameReceiver>);
}

/// Sending half of a connection.
#[async_trait]
pub trait FrameSender: Send {
    /// Encode and send a frame.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Receiving half of a connection.
#[async_trait]
pub trait FrameReceiver: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` once the connection is closed cleanly. Must be
    /// cancel safe: dropping the future loses no frame, so it can be used
    /// as a `tokio::select!` branch.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// Decode the next frame from a receive buffer.
///
/// A malformed frame poisons everything after it, so the buffer is
/// discarded on error and the next message starts clean.
pub(crate) fn decode_buffered(buf: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
    codec::decode_from(buf).map_err(|e| {
        buf.clear();
        TransportError::Protocol(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_id_from_string() {
        let id: ConnectionId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
        assert_eq!(id.to_string(), "test-id");
    }

    #[test]
    fn test_malformed_buffer_is_discarded() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 2, 0xc1, 0xc1][..]);
        assert!(matches!(
            decode_buffered(&mut buf),
            Err(TransportError::Protocol(_))
        ));
        assert!(buf.is_empty());

        let encoded = codec::encode(&Frame::ping_with_timestamp(1)).unwrap();
        buf.extend_from_slice(&encoded);
        assert_eq!(
            decode_buffered(&mut buf).unwrap(),
            Some(Frame::ping_with_timestamp(1))
        );
    }
}
