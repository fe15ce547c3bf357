//! Data types shared by requests, responses, and update pushes.

use serde::{Deserialize, Serialize};

/// A single row, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Port identifier. Port 0 is the implicit default port of every table.
pub type PortId = u32;

/// The implicit default port.
pub const DEFAULT_PORT: PortId = 0;

/// Server-wide view identifier.
pub type ViewId = u64;

/// Server-wide subscription identifier.
pub type SubscriptionId = u64;

/// Column data types understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    String,
    Boolean,
}

impl ColumnType {
    /// Lowercase type name, as used in error messages.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::String => "string",
            ColumnType::Boolean => "boolean",
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaColumn {
    pub name: String,
    pub dtype: ColumnType,
}

impl SchemaColumn {
    #[must_use]
    pub fn new(name: impl Into<String>, dtype: ColumnType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

/// Ordered table schema.
pub type Schema = Vec<SchemaColumn>;

/// Options applied when a table is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOptions {
    /// Primary-key column. Updates carrying an existing key replace that row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    /// Maximum number of rows kept; the oldest rows are evicted first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Comparison operators for view filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

/// A single filter clause: `column op value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: serde_json::Value,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    Asc,
    Desc,
}

/// A single sort clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub column: String,
    pub dir: SortDir,
}

/// View configuration.
///
/// An empty configuration yields every column of every row in table order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewConfig {
    /// Columns to project, in output order. `None` selects all columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    /// Row filters, all of which must match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<Filter>,
    /// Sort clauses, applied in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<Sort>,
}

impl ViewConfig {
    /// Create a configuration projecting the given columns.
    #[must_use]
    pub fn with_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: Some(columns.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Add a filter clause.
    #[must_use]
    pub fn filter(
        mut self,
        column: impl Into<String>,
        op: FilterOp,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.filter.push(Filter {
            column: column.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Add a sort clause.
    #[must_use]
    pub fn sort(mut self, column: impl Into<String>, dir: SortDir) -> Self {
        self.sort.push(Sort {
            column: column.into(),
            dir,
        });
        self
    }
}

/// Encoding of update pushes delivered to a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Notification only, no delta.
    #[default]
    Notify,
    /// Delta as row objects.
    Row,
    /// Delta as a columnar binary block.
    Columnar,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_config_builder() {
        let config = ViewConfig::with_columns(["x", "y"])
            .filter("x", FilterOp::Gt, 1)
            .sort("y", SortDir::Desc);

        assert_eq!(config.columns.as_deref(), Some(&["x".to_string(), "y".to_string()][..]));
        assert_eq!(config.filter.len(), 1);
        assert_eq!(config.sort[0].dir, SortDir::Desc);
    }

    #[test]
    fn test_filter_op_wire_names() {
        let json = serde_json::to_string(&FilterOp::Ge).unwrap();
        assert_eq!(json, "\">=\"");
    }

    #[test]
    fn test_update_mode_default() {
        assert_eq!(UpdateMode::default(), UpdateMode::Notify);
    }
}
