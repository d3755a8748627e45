// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use super::dialect::{Dialect, DialectKind};
use crate::value::{ScalarType, Value};
use anyhow::{Context as _, Result};
use chrono::SecondsFormat;

#[derive(Debug, Clone, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Sqlite
    }

    fn provider(&self) -> &'static str {
        "sqlite"
    }

    fn supports_distinct_on(&self) -> bool {
        false
    }

    fn supports_mutation_limit(&self) -> bool {
        true
    }

    fn offset_requires_limit(&self) -> bool {
        true
    }

    fn supports_ilike(&self) -> bool {
        false
    }

    fn supports_arrays(&self) -> bool {
        false
    }

    fn encode_value(&self, value: Value) -> Value {
        match value {
            // Booleans live as integers.
            Value::Bool(b) => Value::Int(b as i64),
            Value::DateTime(dt) => {
                Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Value::Decimal(d) => Value::String(d.to_string()),
            Value::Bytes(b) => Value::String(base64::encode(b)),
            Value::Json(v) => Value::String(v.to_string()),
            Value::Enum(s) => Value::String(s),
            Value::BigInt(i) => Value::Int(i),
            other => other,
        }
    }

    fn param_cast(&self, _value: &Value) -> Option<&'static str> {
        None
    }

    fn select_cast(&self, _ty: &ScalarType) -> Option<&'static str> {
        None
    }

    fn json_column_cast(&self) -> Option<&'static str> {
        None
    }

    fn json_scalar_cast(&self, _ty: &ScalarType) -> Option<&'static str> {
        None
    }

    fn json_needs_reparse(&self) -> bool {
        // JSON subtype does not survive a subquery boundary; wrap nested
        // subqueries in `json(…)` so they embed as JSON, not text.
        true
    }

    fn transform_output(
        &self,
        ty: &ScalarType,
        json: serde_json::Value,
    ) -> Result<serde_json::Value> {
        if json.is_null() {
            return Ok(json);
        }
        match ty {
            ScalarType::Boolean => {
                if json.is_boolean() {
                    return Ok(json);
                }
                let n = json.as_i64().context("expected 0/1 for a boolean column")?;
                Ok(serde_json::json!(n != 0))
            }
            ScalarType::Decimal => match json {
                serde_json::Value::Number(n) => Ok(serde_json::json!(n.to_string())),
                other => Ok(other),
            },
            ScalarType::Json => match json {
                serde_json::Value::String(text) => {
                    serde_json::from_str(&text).context("invalid JSON column content")
                }
                other => Ok(other),
            },
            _ => Ok(json),
        }
    }

    fn column_type(&self, ty: &ScalarType) -> &'static str {
        match ty {
            ScalarType::String
            | ScalarType::Enum
            | ScalarType::Bytes
            | ScalarType::Decimal
            | ScalarType::DateTime
            | ScalarType::Json => "TEXT",
            ScalarType::Int | ScalarType::BigInt | ScalarType::Boolean => "INTEGER",
            ScalarType::Float => "REAL",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bool_roundtrip() {
        let dialect = SqliteDialect;
        assert_eq!(dialect.encode_value(Value::Bool(true)), Value::Int(1));
        assert_eq!(
            dialect.transform_output(&ScalarType::Boolean, json!(1)).unwrap(),
            json!(true)
        );
        assert_eq!(
            dialect.transform_output(&ScalarType::Boolean, json!(0)).unwrap(),
            json!(false)
        );
    }
}
