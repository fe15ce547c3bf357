//! # tablesync-protocol
//!
//! Wire protocol for tablesync, the remote table synchronization engine.
//!
//! This crate defines the frames exchanged between clients and a table host,
//! the codec that puts them on the wire, and protocol versioning.
//!
//! ## Frame Types
//!
//! - `Request` / `Response` / `Error` - Correlated calls, matched by `id`
//! - `Update` - Unsolicited delta pushes, tagged by subscription and port
//! - `Ping` / `Pong` - Keepalive
//! - `Connected` - Handshake sent by the server
//!
//! ## Example
//!
//! ```rust
//! use tablesync_protocol::{codec, Frame, Request};
//!
//! let frame = Frame::request(1, Request::OpenTable { name: "prices".into() });
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod types;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{Attachment, ErrorCode, Frame, FrameType, Reply, Request};
pub use types::{
    ColumnType, Filter, FilterOp, PortId, Row, Schema, SchemaColumn, Sort, SortDir,
    SubscriptionId, TableOptions, UpdateMode, ViewConfig, ViewId, DEFAULT_PORT,
};
pub use version::{Version, PROTOCOL_VERSION};
