//! Adapter for WebSockets upgraded by an axum handler.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tablesync_protocol::{codec, Frame};
use tracing::debug;

use crate::traits::{
    decode_buffered, Connection, ConnectionId, FrameReceiver, FrameSender, TransportError,
};

/// A connection over an axum [`WebSocket`].
pub struct AxumConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
}

impl AxumConnection {
    #[must_use]
    pub fn new(socket: WebSocket, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr,
        }
    }
}

impl Connection for AxumConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|a| a.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSender>, Box<dyn FrameReceiver>) {
        let (sink, stream) = self.socket.split();
        (
            Box::new(AxumSender { sink, closed: false }),
            Box::new(AxumReceiver {
                stream,
                read_buffer: BytesMut::with_capacity(4096),
            }),
        )
    }
}

struct AxumSender {
    sink: SplitSink<WebSocket, Message>,
    closed: bool,
}

#[async_trait]
impl FrameSender for AxumSender {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }

        let data = codec::encode(&frame)?;
        self.sink
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }

        // The peer may already be gone; there is nothing left to do then.
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "WebSocket close failed");
        }
        Ok(())
    }
}

struct AxumReceiver {
    stream: SplitStream<WebSocket>,
    read_buffer: BytesMut,
}

#[async_trait]
impl FrameReceiver for AxumReceiver {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        if let Some(frame) = decode_buffered(&mut self.read_buffer)? {
            return Ok(Some(frame));
        }

        loop {
            let data = match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                // axum answers pings itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            };

            self.read_buffer.extend_from_slice(&data);
            if let Some(frame) = decode_buffered(&mut self.read_buffer)? {
                return Ok(Some(frame));
            }
        }
    }
}
