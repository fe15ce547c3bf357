//! Columnar block encoding used by [`MemoryEngine`](super::MemoryEngine).
//!
//! A block is a MessagePack map `{columns: [name, ..], data: [[v, ..], ..]}`
//! where `data[i]` holds every value of `columns[i]`. Absent cells are `null`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tablesync_protocol::Row;

use super::EngineError;

#[derive(Debug, Serialize, Deserialize)]
struct ColumnBlock {
    columns: Vec<String>,
    data: Vec<Vec<Value>>,
}

/// Encode rows column by column.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(columns: &[String], rows: &[Row]) -> Result<Bytes, EngineError> {
    let data = columns
        .iter()
        .map(|column| {
            rows.iter()
                .map(|row| row.get(column).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect();

    let block = ColumnBlock {
        columns: columns.to_vec(),
        data,
    };

    rmp_serde::to_vec_named(&block)
        .map(Bytes::from)
        .map_err(|e| EngineError::abort(format!("Failed to encode columnar data: {e}.")))
}

/// Decode a block into its column names and rows.
///
/// # Errors
///
/// Returns an error if the block is malformed or its columns differ in length.
pub fn decode(bytes: &[u8]) -> Result<(Vec<String>, Vec<Row>), EngineError> {
    let block: ColumnBlock = rmp_serde::from_slice(bytes)
        .map_err(|e| EngineError::abort(format!("Invalid columnar data: {e}.")))?;

    if block.columns.len() != block.data.len() {
        return Err(EngineError::abort(format!(
            "Invalid columnar data: {} column names for {} columns.",
            block.columns.len(),
            block.data.len()
        )));
    }

    let num_rows = block.data.first().map_or(0, Vec::len);
    if let Some((name, _)) = block
        .columns
        .iter()
        .zip(&block.data)
        .find(|(_, values)| values.len() != num_rows)
    {
        return Err(EngineError::abort(format!(
            "Invalid columnar data: column '{name}' has the wrong length."
        )));
    }

    let mut rows = vec![Row::new(); num_rows];
    for (name, values) in block.columns.iter().zip(block.data) {
        for (row, value) in rows.iter_mut().zip(values) {
            if !value.is_null() {
                row.insert(name.clone(), value);
            }
        }
    }

    Ok((block.columns, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_columnar_layout() {
        let columns = vec!["x".to_string(), "y".to_string()];
        let rows = vec![row(json!({"x": 1, "y": "a"})), row(json!({"x": 2}))];

        let bytes = encode(&columns, &rows).unwrap();
        assert!(!bytes.is_empty());

        let (decoded_columns, decoded_rows) = decode(&bytes).unwrap();
        assert_eq!(decoded_columns, columns);
        assert_eq!(decoded_rows, rows);
    }

    #[test]
    fn test_empty_block_keeps_columns() {
        let columns = vec!["x".to_string()];
        let bytes = encode(&columns, &[]).unwrap();

        let (decoded_columns, decoded_rows) = decode(&bytes).unwrap();
        assert_eq!(decoded_columns, columns);
        assert!(decoded_rows.is_empty());
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = decode(b"\x01\x02\x03").unwrap_err();
        assert!(err.to_string().starts_with("Abort(): Invalid columnar data"));
    }
}
