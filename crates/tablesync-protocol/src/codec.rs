//! Codec for encoding and decoding tablesync frames.
//!
//! This module provides MessagePack-based serialization with length-prefixed framing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::{Attachment, Frame};

/// Maximum frame size (16 MiB), header and binary block together.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a frame to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian header length
/// - N bytes: MessagePack-encoded frame header
/// - M bytes: binary block, where M is the header's `binary_length` (0 if absent)
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let header = rmp_serde::to_vec_named(frame)?;
    let binary = frame.attachment().filter(|a| !a.is_empty());

    if let Some(attachment) = binary {
        if !attachment.is_filled() {
            return Err(ProtocolError::Invalid(format!(
                "binary block announces {} bytes but holds {}",
                attachment.len(),
                attachment.data().len()
            )));
        }
    }

    let binary_len = binary.map_or(0, Attachment::len);
    let total = header.len() + binary_len;
    if total > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(total));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + total);
    buf.put_u32(header.len() as u32);
    buf.extend_from_slice(&header);
    if let Some(attachment) = binary {
        buf.extend_from_slice(attachment.data());
    }

    Ok(())
}

/// Outcome of parsing a frame header from the front of a buffer.
enum Peeked {
    /// Header decoded; the frame spans `total` bytes, the binary block
    /// starts at `binary_start`.
    Complete {
        frame: Frame,
        binary_start: usize,
        total: usize,
    },
    /// More bytes are needed.
    Partial(usize),
}

fn peek(data: &[u8]) -> Result<Peeked, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Ok(Peeked::Partial(LENGTH_PREFIX_SIZE - data.len()));
    }

    let header_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if header_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(header_len));
    }

    let binary_start = LENGTH_PREFIX_SIZE + header_len;
    if data.len() < binary_start {
        return Ok(Peeked::Partial(binary_start - data.len()));
    }

    let frame: Frame = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..binary_start])?;
    let binary_len = frame.attachment().map_or(0, Attachment::len);

    if header_len + binary_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(header_len + binary_len));
    }

    let total = binary_start + binary_len;
    if data.len() < total {
        return Ok(Peeked::Partial(total - data.len()));
    }

    Ok(Peeked::Complete {
        frame,
        binary_start,
        total,
    })
}

/// Decode a frame from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    match peek(data)? {
        Peeked::Partial(missing) => Err(ProtocolError::Incomplete(missing)),
        Peeked::Complete {
            mut frame,
            binary_start,
            total,
        } => {
            if let Some(attachment) = frame.attachment_mut() {
                if !attachment.is_empty() {
                    attachment.fill(Bytes::copy_from_slice(&data[binary_start..total]));
                }
            }
            Ok(frame)
        }
    }
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    match peek(&buf[..])? {
        Peeked::Partial(_) => Ok(None),
        Peeked::Complete {
            mut frame,
            binary_start,
            total,
        } => {
            buf.advance(binary_start);
            let binary = buf.split_to(total - binary_start).freeze();
            if let Some(attachment) = frame.attachment_mut() {
                if !attachment.is_empty() {
                    attachment.fill(binary);
                }
            }
            Ok(Some(frame))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{ErrorCode, Reply, Request};
    use crate::types::{UpdateMode, ViewConfig};
    use crate::version::PROTOCOL_VERSION;
    use serde_json::json;

    fn row(value: serde_json::Value) -> crate::types::Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let frames = vec![
            Frame::connected("conn-123", PROTOCOL_VERSION, 30000),
            Frame::request(
                1,
                Request::MakeView {
                    table: "test".into(),
                    config: ViewConfig::with_columns(["x"]),
                },
            ),
            Frame::response(
                2,
                Reply::Rows {
                    rows: vec![row(json!({"x": 1})), row(json!({"x": 2.5, "y": "a"}))],
                },
            ),
            Frame::error(3, ErrorCode::Validation, "Abort(): boom\n"),
            Frame::row_update(4, 2, vec![row(json!({"x": 2}))]),
            Frame::ping_with_timestamp(99),
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_binary_block_follows_header() {
        let frame = Frame::columnar_update(9, 3, vec![0xAAu8; 32]);
        let encoded = encode(&frame).unwrap();

        let header_len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(encoded.len(), LENGTH_PREFIX_SIZE + header_len as usize + 32);
        assert!(encoded.ends_with(&[0xAA; 32]));

        match decode(&encoded).unwrap() {
            Frame::Update {
                subscription_id,
                port_id,
                mode,
                binary,
                ..
            } => {
                assert_eq!(subscription_id, 9);
                assert_eq!(port_id, 3);
                assert_eq!(mode, UpdateMode::Columnar);
                assert_eq!(binary.data().as_ref(), &[0xAA; 32]);
            }
            other => panic!("Expected Update frame, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = Frame::request(1, Request::OpenTable { name: "test".into() });
        let encoded = encode(&frame).unwrap();

        let partial = &encoded[..5];
        match decode(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_missing_binary_block() {
        let frame = Frame::response_with_binary(5, Reply::Columnar, vec![1u8; 10]);
        let encoded = encode(&frame).unwrap();

        match decode(&encoded[..encoded.len() - 4]) {
            Err(ProtocolError::Incomplete(4)) => {}
            other => panic!("Expected Incomplete(4), got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let frame = Frame::columnar_update(1, 0, vec![0u8; MAX_FRAME_SIZE + 1]);

        match encode(&frame) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = Frame::request_with_binary(
            1,
            Request::Update {
                table: "t".into(),
                port_id: 0,
                rows: None,
            },
            vec![7u8; 16],
        );
        let frame2 = Frame::request(2, Request::MakePort { table: "t".into() });

        let mut buf = BytesMut::new();
        encode_into(&frame1, &mut buf).unwrap();
        encode_into(&frame2, &mut buf).unwrap();

        let decoded1 = decode_from(&mut buf).unwrap().unwrap();
        let decoded2 = decode_from(&mut buf).unwrap().unwrap();

        assert_eq!(frame1, decoded1);
        assert_eq!(frame2, decoded2);
        assert!(buf.is_empty());
        assert!(decode_from(&mut buf).unwrap().is_none());
    }
}
