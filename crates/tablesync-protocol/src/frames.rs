//! Frame types for the tablesync protocol.
//!
//! Frames are the fundamental unit of communication. Each frame header is
//! serialized with MessagePack; frames that carry columnar data append the
//! raw block after the header and announce its size in `binary_length`.

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::types::{
    PortId, Row, Schema, SubscriptionId, TableOptions, UpdateMode, ViewConfig, ViewId,
};
use crate::version::Version;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connected = 0x01,
    Request = 0x02,
    Response = 0x03,
    Error = 0x04,
    Update = 0x05,
    Ping = 0x06,
    Pong = 0x07,
    SubscriptionClosed = 0x08,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connected),
            0x02 => Ok(FrameType::Request),
            0x03 => Ok(FrameType::Response),
            0x04 => Ok(FrameType::Error),
            0x05 => Ok(FrameType::Update),
            0x06 => Ok(FrameType::Ping),
            0x07 => Ok(FrameType::Pong),
            0x08 => Ok(FrameType::SubscriptionClosed),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Error codes carried by [`Frame::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    /// A table is already hosted under the requested name.
    NameConflict = 1001,
    /// Unknown table, view, port, or subscription.
    NotFound = 1002,
    /// The data engine rejected the request (`Abort(): ...`).
    Validation = 1003,
    /// The connection closed before the request completed.
    ConnectionClosed = 1004,
    /// Malformed or unexpected frame.
    ProtocolViolation = 1005,
    /// Anything else.
    Internal = 1006,
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code as u16
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = &'static str;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1001 => Ok(ErrorCode::NameConflict),
            1002 => Ok(ErrorCode::NotFound),
            1003 => Ok(ErrorCode::Validation),
            1004 => Ok(ErrorCode::ConnectionClosed),
            1005 => Ok(ErrorCode::ProtocolViolation),
            1006 => Ok(ErrorCode::Internal),
            _ => Err("Invalid error code"),
        }
    }
}

/// Binary block trailing a frame header.
///
/// On the wire only its length is part of the header (as `binary_length`);
/// the bytes themselves follow the header and are filled in by the codec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attachment {
    expected: usize,
    data: Bytes,
}

impl Attachment {
    /// Wrap a block of bytes.
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            expected: data.len(),
            data,
        }
    }

    /// Whether the frame carries no binary block.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expected == 0
    }

    /// Length announced in the header.
    #[must_use]
    pub fn len(&self) -> usize {
        self.expected
    }

    /// The attached bytes.
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Consume the attachment, returning its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    /// Whether the announced bytes have been received.
    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.data.len() == self.expected
    }

    pub(crate) fn fill(&mut self, data: Bytes) {
        debug_assert_eq!(data.len(), self.expected);
        self.data = data;
    }
}

impl Serialize for Attachment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.expected as u32)
    }
}

impl<'de> Deserialize<'de> for Attachment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let expected = u32::deserialize(deserializer)? as usize;
        Ok(Self {
            expected,
            data: Bytes::new(),
        })
    }
}

/// Requests a client may issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    /// List hosted table names in hosting order.
    GetHostedTableNames,

    /// Create and host a table from rows, a schema, or the attached
    /// columnar block.
    HostTable {
        name: String,
        #[serde(default)]
        options: TableOptions,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<Vec<Row>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Schema>,
    },

    /// Eject a hosted table.
    EjectTable { name: String },

    /// Resolve a hosted table by name.
    OpenTable { name: String },

    /// Number of rows in a table.
    TableSize { table: String },

    /// Schema of a table.
    TableSchema { table: String },

    /// Allocate a fresh port on a table.
    MakePort { table: String },

    /// Apply rows, or the attached columnar block, to a table.
    Update {
        table: String,
        #[serde(default)]
        port_id: PortId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<Vec<Row>>,
    },

    /// Create a view on a table.
    MakeView {
        table: String,
        #[serde(default)]
        config: ViewConfig,
    },

    /// Delete a view and its subscriptions.
    ViewDelete { view_id: ViewId },

    /// Number of rows in a view.
    ViewNumRows { view_id: ViewId },

    /// Serialize a view as rows.
    ViewToJson { view_id: ViewId },

    /// Serialize a view as a columnar block.
    ViewToColumnar { view_id: ViewId },

    /// Listen for updates to a view.
    Subscribe {
        view_id: ViewId,
        #[serde(default)]
        mode: UpdateMode,
    },

    /// Stop listening.
    Unsubscribe { subscription_id: SubscriptionId },
}

impl Request {
    /// Method name, for logging.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Request::GetHostedTableNames => "get_hosted_table_names",
            Request::HostTable { .. } => "host_table",
            Request::EjectTable { .. } => "eject_table",
            Request::OpenTable { .. } => "open_table",
            Request::TableSize { .. } => "table_size",
            Request::TableSchema { .. } => "table_schema",
            Request::MakePort { .. } => "make_port",
            Request::Update { .. } => "update",
            Request::MakeView { .. } => "make_view",
            Request::ViewDelete { .. } => "view_delete",
            Request::ViewNumRows { .. } => "view_num_rows",
            Request::ViewToJson { .. } => "view_to_json",
            Request::ViewToColumnar { .. } => "view_to_columnar",
            Request::Subscribe { .. } => "subscribe",
            Request::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

/// Successful results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    /// Operation completed with no result.
    Ok,
    Names { names: Vec<String> },
    Table { name: String },
    Port { port_id: PortId },
    Size { size: u64 },
    Schema { schema: Schema },
    View { view_id: ViewId },
    Rows { rows: Vec<Row> },
    /// The result is the attached columnar block.
    Columnar,
    Subscription { subscription_id: SubscriptionId },
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Connection established, sent by the server on accept.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Server protocol version.
        version: Version,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// A correlated request.
    #[serde(rename = "request")]
    Request {
        /// Correlation ID, unique per connection.
        id: u64,
        request: Request,
        #[serde(
            rename = "binary_length",
            default,
            skip_serializing_if = "Attachment::is_empty"
        )]
        binary: Attachment,
    },

    /// Successful response to a request.
    #[serde(rename = "response")]
    Response {
        /// Correlation ID of the request.
        id: u64,
        reply: Reply,
        #[serde(
            rename = "binary_length",
            default,
            skip_serializing_if = "Attachment::is_empty"
        )]
        binary: Attachment,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// Correlation ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code.
        code: ErrorCode,
        /// Human-readable error message, passed through verbatim.
        message: String,
    },

    /// Unsolicited update push for a subscription.
    #[serde(rename = "update")]
    Update {
        subscription_id: SubscriptionId,
        /// Port the triggering update was applied on.
        port_id: PortId,
        mode: UpdateMode,
        /// Row delta, in [`UpdateMode::Row`].
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<Vec<Row>>,
        /// Columnar delta, in [`UpdateMode::Columnar`].
        #[serde(
            rename = "binary_length",
            default,
            skip_serializing_if = "Attachment::is_empty"
        )]
        binary: Attachment,
    },

    /// The host cancelled a subscription; no further updates follow for it.
    #[serde(rename = "subscription_closed")]
    SubscriptionClosed { subscription_id: SubscriptionId },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Request { .. } => FrameType::Request,
            Frame::Response { .. } => FrameType::Response,
            Frame::Error { .. } => FrameType::Error,
            Frame::Update { .. } => FrameType::Update,
            Frame::SubscriptionClosed { .. } => FrameType::SubscriptionClosed,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// The binary block carried by this frame, if the frame kind has one.
    #[must_use]
    pub fn attachment(&self) -> Option<&Attachment> {
        match self {
            Frame::Request { binary, .. }
            | Frame::Response { binary, .. }
            | Frame::Update { binary, .. } => Some(binary),
            _ => None,
        }
    }

    pub(crate) fn attachment_mut(&mut self) -> Option<&mut Attachment> {
        match self {
            Frame::Request { binary, .. }
            | Frame::Response { binary, .. }
            | Frame::Update { binary, .. } => Some(binary),
            _ => None,
        }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: Version, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new Request frame.
    #[must_use]
    pub fn request(id: u64, request: Request) -> Self {
        Frame::Request {
            id,
            request,
            binary: Attachment::default(),
        }
    }

    /// Create a new Request frame carrying a binary block.
    #[must_use]
    pub fn request_with_binary(id: u64, request: Request, data: impl Into<Bytes>) -> Self {
        Frame::Request {
            id,
            request,
            binary: Attachment::new(data),
        }
    }

    /// Create a new Response frame.
    #[must_use]
    pub fn response(id: u64, reply: Reply) -> Self {
        Frame::Response {
            id,
            reply,
            binary: Attachment::default(),
        }
    }

    /// Create a new Response frame carrying a binary block.
    #[must_use]
    pub fn response_with_binary(id: u64, reply: Reply, data: impl Into<Bytes>) -> Self {
        Frame::Response {
            id,
            reply,
            binary: Attachment::new(data),
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create an Update push with no delta.
    #[must_use]
    pub fn notify(subscription_id: SubscriptionId, port_id: PortId) -> Self {
        Frame::Update {
            subscription_id,
            port_id,
            mode: UpdateMode::Notify,
            rows: None,
            binary: Attachment::default(),
        }
    }

    /// Create an Update push carrying a row delta.
    #[must_use]
    pub fn row_update(subscription_id: SubscriptionId, port_id: PortId, rows: Vec<Row>) -> Self {
        Frame::Update {
            subscription_id,
            port_id,
            mode: UpdateMode::Row,
            rows: Some(rows),
            binary: Attachment::default(),
        }
    }

    /// Create an Update push carrying a columnar delta.
    #[must_use]
    pub fn columnar_update(
        subscription_id: SubscriptionId,
        port_id: PortId,
        data: impl Into<Bytes>,
    ) -> Self {
        Frame::Update {
            subscription_id,
            port_id,
            mode: UpdateMode::Columnar,
            rows: None,
            binary: Attachment::new(data),
        }
    }

    /// Create a SubscriptionClosed push.
    #[must_use]
    pub fn subscription_closed(subscription_id: SubscriptionId) -> Self {
        Frame::SubscriptionClosed { subscription_id }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Ping frame with timestamp.
    #[must_use]
    pub fn ping_with_timestamp(timestamp: u64) -> Self {
        Frame::Ping {
            timestamp: Some(timestamp),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type() {
        let request = Frame::request(1, Request::GetHostedTableNames);
        assert_eq!(request.frame_type(), FrameType::Request);

        let update = Frame::notify(3, 0);
        assert_eq!(update.frame_type(), FrameType::Update);

        let closed = Frame::subscription_closed(3);
        assert_eq!(closed.frame_type(), FrameType::SubscriptionClosed);
        assert_eq!(FrameType::try_from(0x08), Ok(FrameType::SubscriptionClosed));
    }

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(ErrorCode::try_from(1001), Ok(ErrorCode::NameConflict));
        assert_eq!(ErrorCode::try_from(1003), Ok(ErrorCode::Validation));
        assert_eq!(u16::from(ErrorCode::ProtocolViolation), 1005);
        assert!(ErrorCode::try_from(42).is_err());
    }

    #[test]
    fn test_attachment_only_on_data_frames() {
        let update = Frame::columnar_update(7, 2, vec![1u8, 2, 3]);
        assert_eq!(update.attachment().map(Attachment::len), Some(3));

        let ping = Frame::ping();
        assert!(ping.attachment().is_none());
    }

    #[test]
    fn test_request_method_names() {
        let request = Request::MakeView {
            table: "t".into(),
            config: ViewConfig::default(),
        };
        assert_eq!(request.method(), "make_view");
    }
}
