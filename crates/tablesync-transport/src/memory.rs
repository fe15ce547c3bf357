//! In-process transport.
//!
//! Frames still go through the codec, so binary attachments behave exactly
//! as they do on a socket.

use async_trait::async_trait;
use bytes::Bytes;
use tablesync_protocol::{codec, Frame};
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use crate::traits::{
    Connection, ConnectionId, FrameReceiver, FrameSender, Transport, TransportError,
};

/// One end of an in-memory duplex.
pub struct MemoryConnection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

/// Create two connected ends.
#[must_use]
pub fn duplex() -> (MemoryConnection, MemoryConnection) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    let a = MemoryConnection {
        id: ConnectionId::generate(),
        tx: a_tx,
        rx: a_rx,
    };
    let b = MemoryConnection {
        id: ConnectionId::generate(),
        tx: b_tx,
        rx: b_rx,
    };
    (a, b)
}

impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSender>, Box<dyn FrameReceiver>) {
        (
            Box::new(MemorySender { tx: Some(self.tx) }),
            Box::new(MemoryReceiver { rx: self.rx }),
        )
    }
}

struct MemorySender {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

#[async_trait]
impl FrameSender for MemorySender {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        let data = codec::encode(&frame)?;
        trace!(bytes = data.len(), "Memory send");
        tx.send(data).map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Dropping the sender ends the peer's stream.
        self.tx = None;
        Ok(())
    }
}

struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl FrameReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.rx.recv().await {
            Some(data) => Ok(Some(codec::decode(&data)?)),
            None => Ok(None),
        }
    }
}

/// In-process listener.
pub struct MemoryTransport {
    incoming: Mutex<mpsc::UnboundedReceiver<MemoryConnection>>,
}

/// Opens connections to a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryConnector {
    tx: mpsc::UnboundedSender<MemoryConnection>,
}

impl MemoryTransport {
    /// Create a transport and a connector for it.
    #[must_use]
    pub fn new() -> (Self, MemoryConnector) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                incoming: Mutex::new(rx),
            },
            MemoryConnector { tx },
        )
    }
}

impl MemoryConnector {
    /// Open a connection. The other end is handed to the transport's `accept`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport was dropped.
    pub fn connect(&self) -> Result<MemoryConnection, TransportError> {
        let (client, server) = duplex();
        self.tx
            .send(server)
            .map_err(|_| TransportError::ConnectFailed("memory transport closed".into()))?;
        Ok(client)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let conn = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::ConnectionClosed)?;
        Ok(Box::new(conn))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_protocol::Reply;

    #[tokio::test]
    async fn test_duplex_roundtrip() {
        let (a, b) = duplex();
        let (mut a_tx, _a_rx) = Box::new(a).split();
        let (_b_tx, mut b_rx) = Box::new(b).split();

        let frame = Frame::columnar_update(3, 1, vec![9u8; 32]);
        a_tx.send(frame.clone()).await.unwrap();
        assert_eq!(b_rx.recv().await.unwrap(), Some(frame));

        let frame = Frame::response(1, Reply::Ok);
        a_tx.send(frame.clone()).await.unwrap();
        assert_eq!(b_rx.recv().await.unwrap(), Some(frame));
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        let (a, b) = duplex();
        let (mut a_tx, _a_rx) = Box::new(a).split();
        let (_b_tx, mut b_rx) = Box::new(b).split();

        a_tx.close().await.unwrap();
        a_tx.close().await.unwrap();
        assert!(b_rx.recv().await.unwrap().is_none());
        assert!(matches!(
            a_tx.send(Frame::ping()).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_transport_accepts_connections() {
        let (transport, connector) = MemoryTransport::new();
        let client = connector.connect().unwrap();
        let server = transport.accept().await.unwrap();

        let (mut tx, _rx) = Box::new(client).split();
        let (_stx, mut srx) = server.split();
        tx.send(Frame::ping_with_timestamp(5)).await.unwrap();
        assert_eq!(srx.recv().await.unwrap(), Some(Frame::ping_with_timestamp(5)));

        drop(transport);
        assert!(connector.connect().is_err());
    }
}
