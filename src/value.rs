use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::catalog::FieldType;

/// A single typed cell of a dynamic table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    /// Kept as its canonical decimal text so no precision is lost.
    Decimal(String),
    Text(String),
    Date(NaiveDate),
    Datetime(DateTime<Utc>),
    Json(serde_json::Value),
    Binary(Vec<u8>),
}

/// One row of a dynamic table keyed by column name.
pub type Row = BTreeMap<String, Value>;

impl Value {
    /// Parses a raw string (CSV cell, query-string value) as `field_type`.
    ///
    /// An empty string is a value for textual columns and NULL for every
    /// other type.
    pub fn parse(field_type: FieldType, raw: &str) -> Result<Value, String> {
        if raw.is_empty() && !field_type.is_textual() {
            return Ok(Value::Null);
        }
        match field_type {
            FieldType::Binary => {
                let digits = raw.strip_prefix("\\x").unwrap_or(raw);
                hex::decode(digits)
                    .map(Value::Binary)
                    .map_err(|e| e.to_string())
            }
            FieldType::Boolean => parse_bool(raw)
                .map(Value::Bool)
                .ok_or_else(|| format!("not a boolean: {}", raw)),
            FieldType::Date => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|e| e.to_string()),
            FieldType::Datetime => parse_datetime(raw)
                .map(Value::Datetime)
                .ok_or_else(|| format!("not a datetime: {}", raw)),
            FieldType::Decimal => {
                if is_decimal(raw) {
                    Ok(Value::Decimal(raw.to_string()))
                } else {
                    Err(format!("not a decimal: {}", raw))
                }
            }
            FieldType::Float => raw
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|e| e.to_string()),
            FieldType::Integer => raw
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|e| e.to_string()),
            FieldType::Json => serde_json::from_str(raw)
                .map(Value::Json)
                .map_err(|e| e.to_string()),
            FieldType::Email | FieldType::String | FieldType::Text => {
                Ok(Value::Text(raw.to_string()))
            }
        }
    }

    /// Text form bound as a query parameter and cast server side by
    /// [`cast_placeholder`]. `None` binds SQL NULL.
    pub fn to_sql_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Decimal(d) => Some(d.clone()),
            Value::Text(s) => Some(s.clone()),
            Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Value::Datetime(dt) => Some(dt.to_rfc3339()),
            Value::Json(j) => Some(j.to_string()),
            Value::Binary(bytes) => Some(hex::encode(bytes)),
        }
    }

    /// Decodes one attribute of a `row_to_json` document.
    pub fn from_json(field_type: FieldType, json: &serde_json::Value) -> Result<Value, String> {
        use serde_json::Value as Json;

        if json.is_null() {
            return Ok(Value::Null);
        }
        match (field_type, json) {
            (FieldType::Json, other) => Ok(Value::Json(other.clone())),
            (FieldType::Boolean, Json::Bool(b)) => Ok(Value::Bool(*b)),
            (FieldType::Integer, Json::Number(n)) => n
                .as_i64()
                .map(Value::Integer)
                .ok_or_else(|| format!("not an integer: {}", n)),
            (FieldType::Float, Json::Number(n)) => n
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| format!("not a float: {}", n)),
            (FieldType::Decimal, Json::Number(n)) => Ok(Value::Decimal(n.to_string())),
            (FieldType::Datetime, Json::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|dt| Value::Datetime(dt.with_timezone(&Utc)))
                .map_err(|e| e.to_string()),
            (kind, Json::String(s)) => Value::parse(kind, s),
            (kind, other) => Err(format!("unexpected {} value: {}", kind, other)),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" => Some(true),
        "false" | "f" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn is_decimal(raw: &str) -> bool {
    let unsigned = raw.strip_prefix(['-', '+']).unwrap_or(raw);
    let mut parts = unsigned.splitn(2, '.');
    let integer = parts.next().unwrap_or("");
    let fraction = parts.next();
    let digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    match fraction {
        Some(fraction) => {
            digits(integer) && digits(fraction) && !(integer.is_empty() && fraction.is_empty())
        }
        None => !integer.is_empty() && digits(integer),
    }
}

/// SQL expression turning the text parameter `$index` into `field_type`.
pub fn cast_placeholder(field_type: FieldType, index: usize) -> String {
    match field_type {
        FieldType::Binary => format!("decode(${}, 'hex')", index),
        other => format!("CAST(${} AS {})", index, cast_target(other)),
    }
}

fn cast_target(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Binary => "bytea",
        FieldType::Boolean => "boolean",
        FieldType::Date => "date",
        FieldType::Datetime => "timestamp with time zone",
        FieldType::Decimal => "numeric",
        FieldType::Float => "double precision",
        FieldType::Integer => "bigint",
        FieldType::Json => "jsonb",
        FieldType::Email | FieldType::String | FieldType::Text => "text",
    }
}
