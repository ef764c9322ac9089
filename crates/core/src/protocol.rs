//! Payloads carried by the `progress` and `result` stream events.
//!
//! Result payloads go through `serde_json` built with `arbitrary_precision`,
//! so integer cells keep their exact digits (`UInt64`, `Int128`, ...) instead
//! of being rounded through `f64`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const PROGRESS_EVENT: &str = "progress";
pub const RESULT_EVENT: &str = "result";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryProgress {
    #[serde(rename = "num_rows")]
    pub rows_processed: u64,
    /// Server-side estimate; it can move in either direction between events.
    pub total_rows: u64,
}

impl QueryProgress {
    #[must_use]
    pub fn new(rows_processed: u64, total_rows: u64) -> Self {
        Self {
            rows_processed,
            total_rows,
        }
    }

    /// Completed fraction in `0.0..=1.0`, if the total is known.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> Option<f64> {
        if self.total_rows == 0 {
            return None;
        }
        Some((self.rows_processed as f64 / self.total_rows as f64).min(1.0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

impl ColumnSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryStats {
    pub rows: u64,
    pub bytes: u64,
    /// Seconds.
    pub duration: f64,
}

/// Application-level failure reported by the server inside a successful
/// stream. It is part of the result, not an execution failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("query failed with code {code}: {message}")]
pub struct QueryError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
    #[serde(default)]
    pub stats: Option<QueryStats>,
    #[serde(default)]
    pub error: Option<QueryError>,
}

impl QueryResult {
    #[must_use]
    pub fn new(columns: Vec<ColumnSpec>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows,
            stats: None,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: QueryError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    /// Rows reshaped into column-name keyed objects.
    #[must_use]
    pub fn records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(column, value)| (column.name.clone(), value.clone()))
                    .collect()
            })
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed {event} payload: {source}")]
    Json {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("row {row} has {actual} values but the result has {expected} columns")]
    RowWidth {
        row: usize,
        expected: usize,
        actual: usize,
    },
}

pub fn decode_progress(data: &str) -> Result<QueryProgress, PayloadError> {
    serde_json::from_str(data).map_err(|source| PayloadError::Json {
        event: PROGRESS_EVENT,
        source,
    })
}

pub fn decode_result(data: &str) -> Result<QueryResult, PayloadError> {
    let result: QueryResult = serde_json::from_str(data).map_err(|source| PayloadError::Json {
        event: RESULT_EVENT,
        source,
    })?;

    if !result.columns.is_empty() {
        let expected = result.columns.len();
        if let Some((row, values)) = result
            .rows
            .iter()
            .enumerate()
            .find(|(_, values)| values.len() != expected)
        {
            return Err(PayloadError::RowWidth {
                row,
                expected,
                actual: values.len(),
            });
        }
    }

    Ok(result)
}

/// Reads an unsigned cell that the server may send as a number or a string.
#[must_use]
pub fn cell_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[must_use]
pub fn cell_as_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}
