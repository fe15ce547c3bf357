//! Client errors.

use tablesync_protocol::{ErrorCode, ProtocolError, Version};
use tablesync_transport::TransportError;
use thiserror::Error;

/// Errors surfaced by client calls.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server rejected the request. `message` is the server's text,
    /// unchanged, e.g. `Abort(): Invalid column 'z' found in View columns.\n`.
    #[error("{message}")]
    Remote { code: ErrorCode, message: String },

    /// The connection closed before a response arrived.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The server sent something that does not fit the protocol.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The server speaks an incompatible protocol version.
    #[error("Incompatible server version {server} (client speaks {client})")]
    IncompatibleVersion { server: Version, client: Version },
}

impl ClientError {
    /// Wire code of a remote error.
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Remote { code, .. } => Some(*code),
            ClientError::ConnectionClosed => Some(ErrorCode::ConnectionClosed),
            ClientError::ProtocolViolation(_) => Some(ErrorCode::ProtocolViolation),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.code() == Some(ErrorCode::NotFound)
    }

    #[must_use]
    pub fn is_validation(&self) -> bool {
        self.code() == Some(ErrorCode::Validation)
    }

    pub(crate) fn unexpected(reply: impl std::fmt::Debug) -> Self {
        ClientError::ProtocolViolation(format!("unexpected reply: {reply:?}"))
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Transport(TransportError::Protocol(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_message_is_verbatim() {
        let err = ClientError::Remote {
            code: ErrorCode::Validation,
            message: "Abort(): Invalid column 'z' found in View columns.\n".into(),
        };
        assert_eq!(
            err.to_string(),
            "Abort(): Invalid column 'z' found in View columns.\n"
        );
        assert!(err.is_validation());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_connection_closed_code() {
        assert_eq!(
            ClientError::ConnectionClosed.code(),
            Some(ErrorCode::ConnectionClosed)
        );
    }
}
