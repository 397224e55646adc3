use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{Row, Statement};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
}

/// Result of one `execute` call.
///
/// Rows are buffered when the statement completes, so a cursor stays valid
/// after later statements run on the same connection. Clones share the read
/// position.
#[derive(Debug, Clone)]
pub struct Cursor {
    rows: Arc<Mutex<VecDeque<Row>>>,
    description: Arc<Vec<ColumnInfo>>,
    rowcount: u64,
}

impl Cursor {
    pub(crate) fn from_rows(statement: &Statement, rows: Vec<Row>) -> Self {
        let description = statement
            .columns()
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                type_name: col.type_().name().to_string(),
            })
            .collect();
        Self {
            rowcount: rows.len() as u64,
            rows: Arc::new(Mutex::new(rows.into())),
            description: Arc::new(description),
        }
    }

    /// A cursor for a statement that returns no rows.
    pub(crate) fn affected(rowcount: u64) -> Self {
        Self {
            rows: Arc::default(),
            description: Arc::default(),
            rowcount,
        }
    }

    /// Rows returned, or rows affected for statements without a result set.
    pub fn rowcount(&self) -> u64 {
        self.rowcount
    }

    /// Result columns; empty for statements without a result set.
    pub fn description(&self) -> &[ColumnInfo] {
        &self.description
    }

    pub fn fetchone(&self) -> Option<Row> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn fetchmany(&self, n: usize) -> Vec<Row> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let n = n.min(rows.len());
        rows.drain(..n).collect()
    }

    pub fn fetchall(&self) -> Vec<Row> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    /// Rows not yet fetched.
    pub fn remaining(&self) -> usize {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A typed view of one result cell, for display.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
}

impl CellValue {
    pub fn display(&self) -> String {
        match self {
            CellValue::Null => "NULL".to_string(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Int(i) => i.to_string(),
            CellValue::Float(f) => f.to_string(),
            CellValue::Text(s) => s.clone(),
            CellValue::Bytes(b) => format!("[{} bytes]", b.len()),
            CellValue::Date(d) => d.to_string(),
            CellValue::DateTime(dt) => dt.to_string(),
            CellValue::TimestampTz(dt) => dt.to_string(),
            CellValue::Json(j) => j.to_string(),
        }
    }

    /// Decode every cell of a row.
    pub fn from_row(row: &Row) -> Vec<CellValue> {
        row.columns()
            .iter()
            .enumerate()
            .map(|(i, col)| extract_value(row, i, col.type_()))
            .collect()
    }
}

fn get<'a, T, F>(row: &'a Row, idx: usize, wrap: F) -> CellValue
where
    T: FromSql<'a>,
    F: FnOnce(T) -> CellValue,
{
    row.try_get::<_, Option<T>>(idx)
        .ok()
        .flatten()
        .map(wrap)
        .unwrap_or(CellValue::Null)
}

fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> CellValue {
    match *pg_type {
        Type::BOOL => get(row, idx, CellValue::Bool),
        Type::INT2 => get(row, idx, |v: i16| CellValue::Int(v.into())),
        Type::INT4 => get(row, idx, |v: i32| CellValue::Int(v.into())),
        Type::INT8 => get(row, idx, CellValue::Int),
        Type::FLOAT4 => get(row, idx, |v: f32| CellValue::Float(v.into())),
        Type::FLOAT8 => get(row, idx, CellValue::Float),
        Type::BYTEA => get(row, idx, CellValue::Bytes),
        Type::DATE => get(row, idx, CellValue::Date),
        Type::TIMESTAMP => get(row, idx, CellValue::DateTime),
        Type::TIMESTAMPTZ => get(row, idx, CellValue::TimestampTz),
        Type::JSON | Type::JSONB => get(row, idx, CellValue::Json),
        // TEXT, VARCHAR, NAME and anything else with a text representation
        _ => get(row, idx, CellValue::Text),
    }
}
