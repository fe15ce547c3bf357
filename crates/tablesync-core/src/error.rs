//! Errors raised by the synchronization layer.

use tablesync_protocol::{ErrorCode, PortId, SubscriptionId, ViewId};
use thiserror::Error;

use crate::engine::EngineError;

/// Synchronization errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// A table is already hosted under this name.
    #[error("Table '{0}' is already hosted")]
    NameConflict(String),

    /// No table is hosted under this name.
    #[error("Table '{0}' not found")]
    TableNotFound(String),

    /// Unknown or deleted view.
    #[error("View {0} not found")]
    ViewNotFound(ViewId),

    /// Unknown subscription.
    #[error("Subscription {0} not found")]
    SubscriptionNotFound(SubscriptionId),

    /// Port was never allocated on this table.
    #[error("Port {port} not found on table '{table}'")]
    PortNotFound { table: String, port: PortId },

    /// Rejected by the data engine. Displays as `Abort(): <cause>\n`.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Invalid table name.
    #[error("Invalid table name: {0}")]
    InvalidName(&'static str),

    /// Maximum number of hosted tables reached.
    #[error("Maximum number of tables reached")]
    TooManyTables,

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,

    /// The host has been shut down.
    #[error("Host is shut down")]
    ShutDown,
}

impl SyncError {
    /// Wire error code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::NameConflict(_) => ErrorCode::NameConflict,
            SyncError::TableNotFound(_)
            | SyncError::ViewNotFound(_)
            | SyncError::SubscriptionNotFound(_)
            | SyncError::PortNotFound { .. } => ErrorCode::NotFound,
            SyncError::Engine(_) | SyncError::InvalidName(_) => ErrorCode::Validation,
            SyncError::TooManyTables | SyncError::MaxSubscriptionsReached => ErrorCode::Internal,
            SyncError::ShutDown => ErrorCode::ConnectionClosed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_errors_pass_through_verbatim() {
        let err: SyncError = EngineError::abort("Invalid column 'z' found in View columns.").into();
        assert_eq!(
            err.to_string(),
            "Abort(): Invalid column 'z' found in View columns.\n"
        );
        assert_eq!(err.code(), ErrorCode::Validation);
    }

    #[test]
    fn test_codes() {
        assert_eq!(SyncError::NameConflict("t".into()).code(), ErrorCode::NameConflict);
        assert_eq!(SyncError::TableNotFound("t".into()).code(), ErrorCode::NotFound);
        assert_eq!(SyncError::ViewNotFound(1).code(), ErrorCode::NotFound);
    }
}
