//! In-memory reference engine.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use serde_json::Value;
use tablesync_protocol::{ColumnType, PortId, Row, Schema, SchemaColumn, TableOptions, ViewConfig};
use tracing::trace;

use super::query::Query;
use super::{columnar, ChangeSet, DataEngine, EngineError, EngineTable, EngineView, TableData, TableInit};

/// Engine that keeps every table in memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryEngine;

impl MemoryEngine {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl DataEngine for MemoryEngine {
    fn create(
        &self,
        init: TableInit,
        options: TableOptions,
    ) -> Result<Box<dyn EngineTable>, EngineError> {
        let table = match init {
            TableInit::Rows(rows) => MemoryTable::from_rows(rows, options)?,
            TableInit::Schema(schema) => MemoryTable::with_schema(schema, options)?,
            TableInit::Columnar(bytes) => {
                let (columns, rows) = columnar::decode(&bytes)?;
                let schema = infer_schema(&columns, &rows)?;
                let mut table = MemoryTable::with_schema(schema, options)?;
                table.store_mut().insert(rows)?;
                table
            }
        };
        Ok(Box::new(table))
    }
}

/// Table storage shared between a table and its views.
#[derive(Debug)]
struct Store {
    schema: Schema,
    rows: Vec<Row>,
    options: TableOptions,
    /// Index key -> row position, when `options.index` is set.
    positions: HashMap<String, usize>,
}

impl Store {
    fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.schema.iter().find(|c| c.name == name).map(|c| c.dtype)
    }

    fn column_names(&self) -> Vec<String> {
        self.schema.iter().map(|c| c.name.clone()).collect()
    }

    /// Validate and coerce every row before touching storage.
    fn normalize(&self, rows: Vec<Row>) -> Result<Vec<Row>, EngineError> {
        rows.into_iter()
            .map(|row| {
                let mut out = Row::new();
                for (name, value) in row {
                    let dtype = self.column_type(&name).ok_or_else(|| {
                        EngineError::abort(format!("Invalid column '{name}' found in update."))
                    })?;
                    out.insert(name.clone(), coerce(&name, dtype, value)?);
                }
                if let Some(index) = &self.options.index {
                    if out.get(index).map_or(true, Value::is_null) {
                        return Err(EngineError::abort(format!(
                            "Update row is missing index column '{index}'."
                        )));
                    }
                }
                Ok(out)
            })
            .collect()
    }

    /// Validate, then insert or merge rows.
    ///
    /// Returns every touched row as stored after the write, once each, minus
    /// rows that `limit` evicted in the same call.
    fn insert(&mut self, rows: Vec<Row>) -> Result<Vec<Row>, EngineError> {
        let rows = self.normalize(rows)?;
        let mut touched = Vec::with_capacity(rows.len());

        match self.options.index.clone() {
            Some(index) => {
                for row in rows {
                    let key = row.get(&index).map(Value::to_string).unwrap_or_default();
                    match self.positions.get(&key) {
                        Some(&pos) => {
                            // Partial updates keep the cells they don't mention.
                            self.rows[pos].extend(row);
                            touched.push(pos);
                        }
                        None => {
                            let pos = self.rows.len();
                            self.positions.insert(key, pos);
                            self.rows.push(row);
                            touched.push(pos);
                        }
                    }
                }
            }
            None => {
                touched.extend(self.rows.len()..self.rows.len() + rows.len());
                self.rows.extend(rows);
            }
        }

        let evicted = self.evict();
        let mut seen = HashSet::with_capacity(touched.len());
        touched.retain(|&pos| pos >= evicted && seen.insert(pos));

        Ok(touched
            .into_iter()
            .map(|pos| self.rows[pos - evicted].clone())
            .collect())
    }

    /// Drop the oldest rows beyond `limit`. Returns how many were dropped.
    fn evict(&mut self) -> usize {
        let Some(limit) = self.options.limit else {
            return 0;
        };
        if self.rows.len() <= limit {
            return 0;
        }

        let excess = self.rows.len() - limit;
        self.rows.drain(..excess);

        if let Some(index) = &self.options.index {
            self.positions = self
                .rows
                .iter()
                .enumerate()
                .map(|(pos, row)| (row.get(index).map(Value::to_string).unwrap_or_default(), pos))
                .collect();
        }
        excess
    }
}

fn coerce(name: &str, dtype: ColumnType, value: Value) -> Result<Value, EngineError> {
    let ok = match (&value, dtype) {
        (Value::Null, _) => true,
        (Value::Number(n), ColumnType::Integer) => n.is_i64() || n.is_u64(),
        (Value::Number(n), ColumnType::Float) => {
            return Ok(n.as_f64().map_or(Value::Null, Value::from));
        }
        (Value::String(_), ColumnType::String) => true,
        (Value::Bool(_), ColumnType::Boolean) => true,
        _ => false,
    };

    if ok {
        Ok(value)
    } else {
        Err(EngineError::abort(format!(
            "Type mismatch for column '{name}': expected {dtype}, found {value}."
        )))
    }
}

fn value_type(value: &Value) -> Option<ColumnType> {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(ColumnType::Integer),
        Value::Number(_) => Some(ColumnType::Float),
        Value::String(_) => Some(ColumnType::String),
        Value::Bool(_) => Some(ColumnType::Boolean),
        _ => None,
    }
}

/// Infer a schema: columns in first-seen order, typed by their values.
///
/// Integers widen to floats; any other mix is an error. Columns holding
/// only nulls become strings.
fn infer_schema(hint: &[String], rows: &[Row]) -> Result<Schema, EngineError> {
    let mut order: Vec<String> = hint.to_vec();
    let mut types: HashMap<String, ColumnType> = HashMap::new();

    for row in rows {
        for (name, value) in row {
            if !order.contains(name) {
                order.push(name.clone());
            }
            let Some(found) = value_type(value) else {
                continue;
            };
            let merged = match types.get(name).copied() {
                None => found,
                Some(known) if known == found => known,
                Some(ColumnType::Integer) if found == ColumnType::Float => ColumnType::Float,
                Some(ColumnType::Float) if found == ColumnType::Integer => ColumnType::Float,
                Some(known) => {
                    return Err(EngineError::abort(format!(
                        "Type mismatch for column '{name}': expected {known}, found {value}."
                    )));
                }
            };
            types.insert(name.clone(), merged);
        }
    }

    if order.is_empty() {
        return Err(EngineError::abort("Cannot infer schema from empty data."));
    }

    Ok(order
        .into_iter()
        .map(|name| {
            let dtype = types.get(&name).copied().unwrap_or(ColumnType::String);
            SchemaColumn::new(name, dtype)
        })
        .collect())
}

fn read(store: &RwLock<Store>) -> RwLockReadGuard<'_, Store> {
    store.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(store: &RwLock<Store>) -> RwLockWriteGuard<'_, Store> {
    store.write().unwrap_or_else(PoisonError::into_inner)
}

/// An in-memory table.
#[derive(Debug)]
pub struct MemoryTable {
    store: Arc<RwLock<Store>>,
}

impl MemoryTable {
    /// Create a table from rows, inferring its schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the rows are empty or have conflicting types.
    pub fn from_rows(rows: Vec<Row>, options: TableOptions) -> Result<Self, EngineError> {
        let schema = infer_schema(&[], &rows)?;
        let mut table = Self::with_schema(schema, options)?;
        table.store_mut().insert(rows)?;
        Ok(table)
    }

    /// Create an empty table.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema is empty or the index column is unknown.
    pub fn with_schema(schema: Schema, options: TableOptions) -> Result<Self, EngineError> {
        if schema.is_empty() {
            return Err(EngineError::abort("Cannot create a table with no columns."));
        }
        if let Some(index) = &options.index {
            if !schema.iter().any(|c| &c.name == index) {
                return Err(EngineError::abort(format!(
                    "Invalid column '{index}' found in table index."
                )));
            }
        }

        Ok(Self {
            store: Arc::new(RwLock::new(Store {
                schema,
                rows: Vec::new(),
                options,
                positions: HashMap::new(),
            })),
        })
    }

    fn store_mut(&mut self) -> RwLockWriteGuard<'_, Store> {
        write(&self.store)
    }
}

impl EngineTable for MemoryTable {
    fn schema(&self) -> Schema {
        read(&self.store).schema.clone()
    }

    fn size(&self) -> usize {
        read(&self.store).rows.len()
    }

    fn update(&mut self, data: TableData, port: PortId) -> Result<ChangeSet, EngineError> {
        let rows = match data {
            TableData::Rows(rows) => rows,
            TableData::Columnar(bytes) => columnar::decode(&bytes)?.1,
        };

        let written = self.store_mut().insert(rows)?;
        trace!(port, rows = written.len(), "Applied update");

        Ok(ChangeSet {
            port,
            rows: written,
        })
    }

    fn view(&self, config: &ViewConfig) -> Result<Box<dyn EngineView>, EngineError> {
        let query = Query::compile(config, &read(&self.store).schema)?;
        Ok(Box::new(MemoryView {
            store: Arc::clone(&self.store),
            query,
        }))
    }
}

/// A view over a [`MemoryTable`].
#[derive(Debug)]
pub struct MemoryView {
    store: Arc<RwLock<Store>>,
    query: Query,
}

impl EngineView for MemoryView {
    fn to_json(&self) -> Result<Vec<Row>, EngineError> {
        Ok(self.query.apply(&read(&self.store).rows))
    }

    fn to_columnar(&self) -> Result<Bytes, EngineError> {
        let rows = self.to_json()?;
        columnar::encode(self.query.columns(), &rows)
    }

    fn num_rows(&self) -> Result<usize, EngineError> {
        Ok(self.query.count(&read(&self.store).rows))
    }

    fn delta_json(&self, changes: &ChangeSet) -> Result<Vec<Row>, EngineError> {
        Ok(self.query.apply(&changes.rows))
    }

    fn delta_columnar(&self, changes: &ChangeSet) -> Result<Bytes, EngineError> {
        let rows = self.delta_json(changes)?;
        columnar::encode(self.query.columns(), &rows)
    }
}

impl MemoryView {
    /// Column names this view projects, in output order.
    #[must_use]
    pub fn columns(&self) -> Vec<String> {
        self.query.columns().to_vec()
    }
}

impl MemoryTable {
    /// Column names in schema order.
    #[must_use]
    pub fn columns(&self) -> Vec<String> {
        read(&self.store).column_names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(value: Value) -> Vec<Row> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    fn json_of(rows: &[Row]) -> Value {
        serde_json::to_value(rows).unwrap()
    }

    #[test]
    fn test_schema_inference() {
        let table = MemoryTable::from_rows(
            rows(json!([{"x": 1, "y": "a"}, {"x": 2.5, "z": true}])),
            TableOptions::default(),
        )
        .unwrap();

        assert_eq!(
            table.schema(),
            vec![
                SchemaColumn::new("x", ColumnType::Float),
                SchemaColumn::new("y", ColumnType::String),
                SchemaColumn::new("z", ColumnType::Boolean),
            ]
        );
        assert_eq!(table.size(), 2);
    }

    #[test]
    fn test_conflicting_types_rejected() {
        let err = MemoryTable::from_rows(
            rows(json!([{"x": 1}, {"x": "one"}])),
            TableOptions::default(),
        )
        .unwrap_err();
        assert_eq!(
            err.cause(),
            "Type mismatch for column 'x': expected integer, found \"one\"."
        );
    }

    #[test]
    fn test_update_appends_and_view_sees_it() {
        let mut table =
            MemoryTable::from_rows(rows(json!([{"x": 1}])), TableOptions::default()).unwrap();
        let view = table.view(&ViewConfig::default()).unwrap();

        let changes = table
            .update(TableData::Rows(rows(json!([{"x": 2}]))), 0)
            .unwrap();
        assert_eq!(json_of(&changes.rows), json!([{"x": 2}]));

        assert_eq!(json_of(&view.to_json().unwrap()), json!([{"x": 1}, {"x": 2}]));
        assert_eq!(json_of(&view.delta_json(&changes).unwrap()), json!([{"x": 2}]));
    }

    #[test]
    fn test_rejected_update_changes_nothing() {
        let mut table =
            MemoryTable::from_rows(rows(json!([{"x": 1}])), TableOptions::default()).unwrap();

        let err = table
            .update(TableData::Rows(rows(json!([{"x": 2}, {"z": 3}]))), 0)
            .unwrap_err();
        assert_eq!(err.to_string(), "Abort(): Invalid column 'z' found in update.\n");
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn test_indexed_update_merges_rows() {
        let options = TableOptions {
            index: Some("id".into()),
            limit: None,
        };
        let mut table = MemoryTable::from_rows(
            rows(json!([{"id": 1, "v": "a"}, {"id": 2, "v": "b"}])),
            options,
        )
        .unwrap();

        table
            .update(TableData::Rows(rows(json!([{"id": 1, "v": "z"}, {"id": 3}]))), 0)
            .unwrap();

        let view = table.view(&ViewConfig::default()).unwrap();
        assert_eq!(
            json_of(&view.to_json().unwrap()),
            json!([{"id": 1, "v": "z"}, {"id": 2, "v": "b"}, {"id": 3, "v": null}])
        );
    }

    #[test]
    fn test_indexed_delta_carries_stored_row() {
        let options = TableOptions {
            index: Some("id".into()),
            limit: None,
        };
        let mut table =
            MemoryTable::from_rows(rows(json!([{"id": 1, "v": "a"}])), options).unwrap();
        let view = table.view(&ViewConfig::default()).unwrap();

        let changes = table
            .update(TableData::Rows(rows(json!([{"id": 1}, {"id": 1}]))), 0)
            .unwrap();

        assert_eq!(json_of(&view.delta_json(&changes).unwrap()), json!([{"id": 1, "v": "a"}]));
        assert_eq!(
            json_of(&view.delta_json(&changes).unwrap()),
            json_of(&view.to_json().unwrap())
        );
    }

    #[test]
    fn test_delta_skips_rows_evicted_by_limit() {
        let options = TableOptions {
            index: None,
            limit: Some(2),
        };
        let mut table = MemoryTable::from_rows(rows(json!([{"x": 1}])), options).unwrap();

        let changes = table
            .update(TableData::Rows(rows(json!([{"x": 2}, {"x": 3}, {"x": 4}]))), 0)
            .unwrap();

        assert_eq!(json_of(&changes.rows), json!([{"x": 3}, {"x": 4}]));
        assert_eq!(table.size(), 2);
    }

    #[test]
    fn test_limit_keeps_latest_rows() {
        let options = TableOptions {
            index: None,
            limit: Some(2),
        };
        let mut table = MemoryTable::from_rows(rows(json!([{"x": 1}, {"x": 2}])), options).unwrap();
        table.update(TableData::Rows(rows(json!([{"x": 3}]))), 0).unwrap();

        let view = table.view(&ViewConfig::default()).unwrap();
        assert_eq!(json_of(&view.to_json().unwrap()), json!([{"x": 2}, {"x": 3}]));
    }

    #[test]
    fn test_columnar_update_roundtrips_through_view() {
        let engine = MemoryEngine::new();
        let mut table = engine
            .create(TableInit::Rows(rows(json!([{"x": 1}]))), TableOptions::default())
            .unwrap();
        let view = table.view(&ViewConfig::default()).unwrap();

        let block = view.to_columnar().unwrap();
        table.update(TableData::Columnar(block.clone()), 0).unwrap();
        table.update(TableData::Columnar(block), 0).unwrap();

        assert_eq!(
            json_of(&view.to_json().unwrap()),
            json!([{"x": 1}, {"x": 1}, {"x": 1}])
        );
    }

    #[test]
    fn test_float_column_coerces_integers() {
        let mut table =
            MemoryTable::from_rows(rows(json!([{"p": 1.5}])), TableOptions::default()).unwrap();
        let changes = table.update(TableData::Rows(rows(json!([{"p": 2}]))), 0).unwrap();
        assert_eq!(json_of(&changes.rows), json!([{"p": 2.0}]));
    }

    #[test]
    fn test_create_from_schema() {
        let engine = MemoryEngine::new();
        let table = engine
            .create(
                TableInit::Schema(vec![SchemaColumn::new("x", ColumnType::Integer)]),
                TableOptions::default(),
            )
            .unwrap();
        assert_eq!(table.size(), 0);

        let err = engine
            .create(TableInit::Schema(Vec::new()), TableOptions::default())
            .err()
            .unwrap();
        assert_eq!(err.cause(), "Cannot create a table with no columns.");
    }
}
