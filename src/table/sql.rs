//! SQL text for the `SQLite` table backend.
//!
//! Identifiers are always quoted; values always travel as bound parameters,
//! except for column defaults, which `CREATE TABLE` needs as literals.

use crate::models::{ColumnDefault, TableSchema, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::Write as _;

/// Prefix of the text default that stands for "ask the generator registry".
pub const GENERATED_PREFIX: &str = "$Generated:";

static GENERATED_DEFAULT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^'\$Generated:(?P<name>[^']+)'$").ok());

static NUMERIC_DEFAULT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^\(?(?P<number>[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?)\)?$").ok());

/// Quotes an identifier, doubling embedded quotes.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Renders a value as an SQL literal.
#[must_use]
pub fn render_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(r) if r.is_nan() => "NULL".to_string(),
        Value::Real(r) if r.is_infinite() => {
            let literal = if r.is_sign_positive() { "9e999" } else { "-9e999" };
            literal.to_string()
        },
        Value::Real(r) => format!("{r:?}"),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Blob(b) => {
            let mut hex = String::with_capacity(b.len() * 2 + 3);
            hex.push_str("X'");
            for byte in b {
                let _ = write!(hex, "{byte:02X}");
            }
            hex.push('\'');
            hex
        },
    }
}

/// Interprets the `dflt_value` column of `pragma_table_info`.
///
/// Literal defaults become [`ColumnDefault::Value`]; the generator sentinel
/// becomes [`ColumnDefault::Generated`]. Expressions such as
/// `CURRENT_TIMESTAMP` cannot be evaluated client side and map to
/// [`ColumnDefault::None`].
#[must_use]
pub fn parse_default(raw: Option<&str>) -> ColumnDefault {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return ColumnDefault::None;
    };
    if let Some(captures) = GENERATED_DEFAULT.as_ref().and_then(|re| re.captures(raw)) {
        return ColumnDefault::Generated(captures["name"].to_string());
    }
    if raw.eq_ignore_ascii_case("NULL") {
        return ColumnDefault::None;
    }
    if let Some(captures) = NUMERIC_DEFAULT.as_ref().and_then(|re| re.captures(raw)) {
        let number = &captures["number"];
        if let Ok(i) = number.parse::<i64>() {
            return ColumnDefault::Value(Value::Integer(i));
        }
        if let Ok(r) = number.parse::<f64>() {
            return ColumnDefault::Value(Value::Real(r));
        }
    }
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        let inner = &raw[1..raw.len() - 1];
        return ColumnDefault::Value(Value::Text(inner.replace("''", "'")));
    }
    if let Some(hex) = raw
        .strip_prefix("X'")
        .or_else(|| raw.strip_prefix("x'"))
        .and_then(|rest| rest.strip_suffix('\''))
    {
        if let Some(bytes) = decode_hex(hex) {
            return ColumnDefault::Value(Value::Blob(bytes));
        }
    }
    tracing::debug!(default = raw, "column default is an expression; not evaluated client side");
    ColumnDefault::None
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

fn column_list(schema: &TableSchema) -> String {
    schema
        .columns()
        .iter()
        .map(|c| quote_identifier(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `INSERT OR REPLACE` / `INSERT OR IGNORE` over every column.
pub(crate) fn insert(schema: &TableSchema, ignore_existing: bool) -> String {
    let placeholders = vec!["?"; schema.width()].join(", ");
    format!(
        "INSERT OR {} INTO {} ({}) VALUES ({placeholders})",
        if ignore_existing { "IGNORE" } else { "REPLACE" },
        quote_identifier(schema.name()),
        column_list(schema),
    )
}

/// Every column of every row.
pub(crate) fn select(schema: &TableSchema) -> String {
    format!("SELECT {} FROM {}", column_list(schema), quote_identifier(schema.name()))
}

pub(crate) fn count(schema: &TableSchema) -> String {
    format!("SELECT COUNT(*) FROM {}", quote_identifier(schema.name()))
}

pub(crate) fn exists_row(schema: &TableSchema, clause: &str) -> String {
    format!(
        "SELECT 1 FROM {} WHERE {clause} LIMIT 1",
        quote_identifier(schema.name())
    )
}

pub(crate) fn delete(schema: &TableSchema, clause: Option<&str>, returning: bool) -> String {
    let mut sql = format!("DELETE FROM {}", quote_identifier(schema.name()));
    if let Some(clause) = clause {
        let _ = write!(sql, " WHERE {clause}");
    }
    if returning {
        let _ = write!(sql, " RETURNING {}", column_list(schema));
    }
    sql
}

/// `UPDATE .. SET` for the columns at `positions`.
pub(crate) fn update(
    schema: &TableSchema,
    positions: &[usize],
    clause: Option<&str>,
    returning: bool,
) -> String {
    let assignments = positions
        .iter()
        .map(|&i| format!("{} = ?", quote_identifier(&schema.columns()[i].name)))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!("UPDATE {} SET {assignments}", quote_identifier(schema.name()));
    if let Some(clause) = clause {
        let _ = write!(sql, " WHERE {clause}");
    }
    if returning {
        let _ = write!(sql, " RETURNING {}", column_list(schema));
    }
    sql
}

/// `WHERE` clause locating the stored row of one encoded record.
///
/// A column that is unique on its own (a `UNIQUE` column, or the only primary
/// key column) is used alone when it holds a value. A composite primary key
/// is used whole when none of its parts is null. Otherwise every column is
/// matched: `= ?` for values, `IS NULL` for nulls, because `= NULL` never
/// matches.
pub(crate) fn selector(schema: &TableSchema, row: &[Value]) -> (String, Vec<Value>) {
    let columns = schema.columns();
    let primary: Vec<usize> = schema
        .identity()
        .iter()
        .copied()
        .filter(|&i| columns[i].primary)
        .collect();
    let alone = schema.identity().iter().copied().find(|&i| {
        !row[i].is_null() && (columns[i].unique || primary == [i])
    });

    let located: Vec<usize> = match alone {
        Some(i) => vec![i],
        None if primary.len() > 1 && primary.iter().all(|&i| !row[i].is_null()) => primary,
        None => (0..schema.width()).collect(),
    };

    let mut clauses = Vec::with_capacity(located.len());
    let mut params = Vec::with_capacity(located.len());
    for i in located {
        let column = quote_identifier(&columns[i].name);
        match &row[i] {
            Value::Null => clauses.push(format!("{column} IS NULL")),
            value => {
                clauses.push(format!("{column} = ?"));
                params.push(value.clone());
            },
        }
    }
    (clauses.join(" AND "), params)
}
