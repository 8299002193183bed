//! Column inference for creating the destination table from a batch, and for
//! evolving an existing table when a later batch no longer fits it.

use crate::models::Record;
use duckdb::types::Value;
use serde_json::Value as Json;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    BigInt,
    Double,
    Varchar,
}

impl ColumnType {
    pub fn sql(self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE",
            ColumnType::Varchar => "VARCHAR",
        }
    }

    /// Map a DuckDB `data_type` name back to a column type. Types this crate
    /// never creates (dates, decimals, nested) map to `None` and are left alone.
    pub fn from_sql(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "BOOLEAN" => Some(ColumnType::Boolean),
            "TINYINT" | "SMALLINT" | "INTEGER" | "BIGINT" | "HUGEINT" => Some(ColumnType::BigInt),
            "FLOAT" | "REAL" | "DOUBLE" => Some(ColumnType::Double),
            "VARCHAR" => Some(ColumnType::Varchar),
            _ => None,
        }
    }

    fn of(value: &Json) -> Option<Self> {
        match value {
            Json::Null => None,
            Json::Bool(_) => Some(ColumnType::Boolean),
            Json::Number(n) if n.is_i64() => Some(ColumnType::BigInt),
            Json::Number(_) => Some(ColumnType::Double),
            _ => Some(ColumnType::Varchar),
        }
    }

    fn widen(self, other: Self) -> Self {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (BigInt, Double) | (Double, BigInt) => Double,
            _ => Varchar,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql())
    }
}

/// A field seen in a batch. `ty` is `None` when the batch only held nulls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: Option<ColumnType>,
}

impl Column {
    /// Type used in DDL. All-null columns become VARCHAR.
    pub fn sql_type(&self) -> ColumnType {
        self.ty.unwrap_or(ColumnType::Varchar)
    }
}

/// Union of field names in first-seen order, each typed by the narrowest
/// type holding every non-null value.
pub fn infer_columns(records: &[Record]) -> Vec<Column> {
    let mut columns: Vec<(String, Option<ColumnType>)> = Vec::new();

    for record in records {
        for (name, value) in record {
            let seen = ColumnType::of(value);
            match columns.iter_mut().find(|(n, _)| n == name) {
                Some((_, ty)) => {
                    *ty = match (*ty, seen) {
                        (Some(a), Some(b)) => Some(a.widen(b)),
                        (a, b) => a.or(b),
                    };
                }
                None => columns.push((name.clone(), seen)),
            }
        }
    }

    columns.into_iter().map(|(name, ty)| Column { name, ty }).collect()
}

// ── Schema evolution ──────────────────────────────────────────────────────────

/// DDL needed before a batch can go into an existing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnChange {
    Add { name: String, ty: ColumnType },
    Widen { name: String, from: ColumnType, to: ColumnType },
}

impl fmt::Display for ColumnChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnChange::Add { name, ty } => write!(f, "add column {name} {ty}"),
            ColumnChange::Widen { name, from, to } => write!(f, "widen column {name} {from} -> {to}"),
        }
    }
}

/// Compare a batch's columns with the table's `(name, data_type)` pairs.
///
/// New fields are added; a field whose values no longer fit its type is
/// widened along BIGINT -> DOUBLE -> VARCHAR. Fields that were all null in the
/// batch never trigger a change.
pub fn plan_column_changes(existing: &[(String, String)], incoming: &[Column]) -> Vec<ColumnChange> {
    incoming
        .iter()
        .filter_map(|column| match existing.iter().find(|(name, _)| *name == column.name) {
            None => Some(ColumnChange::Add {
                name: column.name.clone(),
                ty: column.sql_type(),
            }),
            Some((_, data_type)) => {
                let current = ColumnType::from_sql(data_type)?;
                let wanted = current.widen(column.ty?);
                (wanted != current).then(|| ColumnChange::Widen {
                    name: column.name.clone(),
                    from: current,
                    to: wanted,
                })
            }
        })
        .collect()
}

/// JSON → DuckDB parameter. Nested arrays and objects are stored as JSON text.
pub fn to_sql_value(value: Option<&Json>) -> Value {
    match value {
        None | Some(Json::Null) => Value::Null,
        Some(Json::Bool(b)) => Value::Boolean(*b),
        Some(Json::Number(n)) => match n.as_i64() {
            Some(i) => Value::BigInt(i),
            None => n.as_f64().map(Value::Double).unwrap_or(Value::Null),
        },
        Some(Json::String(s)) => Value::Text(s.clone()),
        Some(other) => Value::Text(other.to_string()),
    }
}

/// Double-quote an identifier for DuckDB.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
