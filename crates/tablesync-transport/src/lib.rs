//! # tablesync-transport
//!
//! Transport abstraction layer for tablesync.
//!
//! - **WebSocket** - tokio-tungstenite listener and client, plus an adapter
//!   for sockets upgraded by axum
//! - **Memory** - In-process duplex, used by tests and embedded setups
//!
//! ## Transport Abstraction
//!
//! Every transport yields [`Connection`]s that split into a
//! [`FrameSender`] and a [`FrameReceiver`], so sessions and clients never
//! see the underlying protocol.
//!
//! ```rust,ignore
//! use tablesync_transport::{Connection, FrameReceiver};
//!
//! async fn handle_connection(conn: Box<dyn Connection>) {
//!     let (_tx, mut rx) = conn.split();
//!     while let Ok(Some(frame)) = rx.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod axum_ws;
pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use axum_ws::AxumConnection;
pub use memory::{duplex, MemoryConnection, MemoryConnector, MemoryTransport};
pub use traits::{Connection, ConnectionId, FrameReceiver, FrameSender, Transport, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{connect, WebSocketConfig, WebSocketConnection, WebSocketTransport};
