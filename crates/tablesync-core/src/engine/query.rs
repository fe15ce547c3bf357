//! View configuration compiled against a table schema.

use std::cmp::Ordering;

use serde_json::Value;
use tablesync_protocol::{Filter, FilterOp, Row, Schema, Sort, SortDir, ViewConfig};

use super::EngineError;

/// A validated [`ViewConfig`].
#[derive(Debug, Clone)]
pub(crate) struct Query {
    columns: Vec<String>,
    filter: Vec<Filter>,
    sort: Vec<Sort>,
}

impl Query {
    /// Validate `config` against `schema`.
    pub(crate) fn compile(config: &ViewConfig, schema: &Schema) -> Result<Self, EngineError> {
        let known = |name: &str| schema.iter().any(|c| c.name == name);

        let columns = match &config.columns {
            Some(columns) => {
                if let Some(bad) = columns.iter().find(|c| !known(c)) {
                    return Err(EngineError::abort(format!(
                        "Invalid column '{bad}' found in View columns."
                    )));
                }
                columns.clone()
            }
            None => schema.iter().map(|c| c.name.clone()).collect(),
        };

        if let Some(bad) = config.filter.iter().find(|f| !known(&f.column)) {
            return Err(EngineError::abort(format!(
                "Invalid column '{}' found in View filter.",
                bad.column
            )));
        }

        if let Some(bad) = config.sort.iter().find(|s| !known(&s.column)) {
            return Err(EngineError::abort(format!(
                "Invalid column '{}' found in View sort.",
                bad.column
            )));
        }

        Ok(Self {
            columns,
            filter: config.filter.clone(),
            sort: config.sort.clone(),
        })
    }

    pub(crate) fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Filter, sort, and project `rows`.
    pub(crate) fn apply<'a, I>(&self, rows: I) -> Vec<Row>
    where
        I: IntoIterator<Item = &'a Row>,
    {
        let mut selected: Vec<&Row> = rows.into_iter().filter(|r| self.matches(r)).collect();

        if !self.sort.is_empty() {
            // Stable, so ties keep table order.
            selected.sort_by(|a, b| self.compare(a, b));
        }

        selected.into_iter().map(|row| self.project(row)).collect()
    }

    /// Number of rows that pass the filter.
    pub(crate) fn count<'a, I>(&self, rows: I) -> usize
    where
        I: IntoIterator<Item = &'a Row>,
    {
        rows.into_iter().filter(|r| self.matches(r)).count()
    }

    fn matches(&self, row: &Row) -> bool {
        self.filter.iter().all(|f| {
            let cell = row.get(&f.column).unwrap_or(&Value::Null);
            match (f.op, compare_values(cell, &f.value)) {
                (FilterOp::Eq, ord) => ord == Some(Ordering::Equal),
                (FilterOp::Ne, ord) => ord != Some(Ordering::Equal),
                (_, None) => false,
                (FilterOp::Lt, Some(ord)) => ord == Ordering::Less,
                (FilterOp::Le, Some(ord)) => ord != Ordering::Greater,
                (FilterOp::Gt, Some(ord)) => ord == Ordering::Greater,
                (FilterOp::Ge, Some(ord)) => ord != Ordering::Less,
            }
        })
    }

    fn compare(&self, a: &Row, b: &Row) -> Ordering {
        for sort in &self.sort {
            let left = a.get(&sort.column).unwrap_or(&Value::Null);
            let right = b.get(&sort.column).unwrap_or(&Value::Null);
            let ord = sort_order(left, right);
            let ord = match sort.dir {
                SortDir::Asc => ord,
                SortDir::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    fn project(&self, row: &Row) -> Row {
        self.columns
            .iter()
            .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
            .collect()
    }
}

/// Compare two cells of the same kind; `None` if they are not comparable.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total order for sorting: nulls first, then by value.
fn sort_order(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => compare_values(a, b).unwrap_or(Ordering::Equal),
    }
}
