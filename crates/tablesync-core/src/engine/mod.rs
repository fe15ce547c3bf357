//! Data engine boundary.
//!
//! The synchronization layer never looks inside tables. It creates them,
//! derives views, applies updates, and asks views to serialize themselves,
//! all through the traits below. [`MemoryEngine`] is the in-process
//! implementation used by the server binary and the tests.

pub mod columnar;
mod memory;
mod query;

pub use memory::{MemoryEngine, MemoryTable, MemoryView};

use bytes::Bytes;
use tablesync_protocol::{PortId, Row, Schema, TableOptions, ViewConfig};
use thiserror::Error;

/// Errors raised by a data engine.
///
/// The display form is part of the wire contract: clients see exactly
/// `Abort(): <cause>\n`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The engine rejected the input; nothing was changed.
    #[error("Abort(): {0}\n")]
    Abort(String),
}

impl EngineError {
    /// Create an abort error with the given cause.
    #[must_use]
    pub fn abort(cause: impl Into<String>) -> Self {
        EngineError::Abort(cause.into())
    }

    /// The underlying cause, without the `Abort(): ` framing.
    #[must_use]
    pub fn cause(&self) -> &str {
        match self {
            EngineError::Abort(cause) => cause,
        }
    }
}

/// Initial contents of a new table.
#[derive(Debug, Clone)]
pub enum TableInit {
    /// Rows; the schema is inferred from them.
    Rows(Vec<Row>),
    /// An explicit, empty schema.
    Schema(Schema),
    /// A columnar block; the schema is inferred from its contents.
    Columnar(Bytes),
}

/// Data applied to an existing table.
#[derive(Debug, Clone)]
pub enum TableData {
    Rows(Vec<Row>),
    Columnar(Bytes),
}

/// Rows written by one successful update, as stored by the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Port the update was applied on.
    pub port: PortId,
    /// Written rows, after normalization.
    pub rows: Vec<Row>,
}

impl ChangeSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Creates engine tables.
pub trait DataEngine: Send + Sync {
    /// Create a table.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial data is invalid.
    fn create(
        &self,
        init: TableInit,
        options: TableOptions,
    ) -> Result<Box<dyn EngineTable>, EngineError>;
}

/// A mutable engine table.
pub trait EngineTable: Send + Sync {
    fn schema(&self) -> Schema;

    fn size(&self) -> usize;

    /// Apply data. Either the whole update is applied or nothing is.
    ///
    /// # Errors
    ///
    /// Returns an error if the data does not fit the table.
    fn update(&mut self, data: TableData, port: PortId) -> Result<ChangeSet, EngineError>;

    /// Derive a view.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration references unknown columns.
    fn view(&self, config: &ViewConfig) -> Result<Box<dyn EngineView>, EngineError>;
}

/// A read-only view derived from an engine table.
///
/// Every read observes a state between two updates, never a partial one.
pub trait EngineView: Send + Sync {
    fn to_json(&self) -> Result<Vec<Row>, EngineError>;

    fn to_columnar(&self) -> Result<Bytes, EngineError>;

    fn num_rows(&self) -> Result<usize, EngineError>;

    /// The part of `changes` visible through this view, as rows.
    fn delta_json(&self, changes: &ChangeSet) -> Result<Vec<Row>, EngineError>;

    /// The part of `changes` visible through this view, as a columnar block.
    fn delta_columnar(&self, changes: &ChangeSet) -> Result<Bytes, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_message_format() {
        let err = EngineError::abort("Invalid column 'z' found in View columns.");
        assert_eq!(
            err.to_string(),
            "Abort(): Invalid column 'z' found in View columns.\n"
        );
        assert_eq!(err.cause(), "Invalid column 'z' found in View columns.");
    }
}
