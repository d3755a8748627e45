// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use super::dialect::{Dialect, DialectKind};
use crate::value::{ScalarType, Value};
use anyhow::{Context as _, Result};
use chrono::{DateTime, SecondsFormat, Utc};

#[derive(Debug, Clone)]
pub struct PostgresDialect {
    /// Normalizes timestamp text read back from the server to UTC RFC 3339,
    /// undoing whatever session timezone the connection renders in.
    pub fix_timezone: bool,
}

impl Default for PostgresDialect {
    fn default() -> Self {
        Self { fix_timezone: true }
    }
}

impl Dialect for PostgresDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Postgres
    }

    fn provider(&self) -> &'static str {
        "postgresql"
    }

    fn supports_distinct_on(&self) -> bool {
        true
    }

    fn supports_mutation_limit(&self) -> bool {
        false
    }

    fn offset_requires_limit(&self) -> bool {
        false
    }

    fn supports_ilike(&self) -> bool {
        true
    }

    fn supports_arrays(&self) -> bool {
        true
    }

    fn encode_value(&self, value: Value) -> Value {
        match value {
            Value::DateTime(dt) => {
                Value::String(dt.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            Value::Decimal(d) => Value::String(d.to_string()),
            Value::Bytes(b) => Value::String(base64::encode(b)),
            Value::Json(v) => Value::String(v.to_string()),
            Value::Enum(s) => Value::String(s),
            Value::BigInt(i) => Value::Int(i),
            other => other,
        }
    }

    fn param_cast(&self, value: &Value) -> Option<&'static str> {
        match value {
            Value::DateTime(_) => Some("::timestamptz"),
            Value::Decimal(_) => Some("::numeric"),
            Value::Json(_) => Some("::jsonb"),
            _ => None,
        }
    }

    fn select_cast(&self, ty: &ScalarType) -> Option<&'static str> {
        match ty {
            ScalarType::DateTime | ScalarType::Decimal | ScalarType::Json => Some("text"),
            _ => None,
        }
    }

    fn json_column_cast(&self) -> Option<&'static str> {
        Some("text")
    }

    fn json_scalar_cast(&self, ty: &ScalarType) -> Option<&'static str> {
        // Numerics would lose precision as JSON numbers; timestamps already
        // render as ISO strings inside jsonb.
        match ty {
            ScalarType::Decimal => Some("text"),
            _ => None,
        }
    }

    fn json_needs_reparse(&self) -> bool {
        false
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
            ScalarType::DateTime => {
                let text = json.as_str().context("expected timestamp text")?;
                if !self.fix_timezone {
                    return Ok(json.clone());
                }
                let parsed = parse_pg_timestamp(text)?;
                Ok(serde_json::json!(parsed
                    .with_timezone(&Utc)
                    .to_rfc3339_opts(SecondsFormat::Millis, true)))
            }
            ScalarType::Decimal => {
                // Decimals stay strings on the JSON surface.
                match json {
                    serde_json::Value::Number(n) => Ok(serde_json::json!(n.to_string())),
                    other => Ok(other),
                }
            }
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
            ScalarType::String | ScalarType::Enum | ScalarType::Bytes => "TEXT",
            ScalarType::Int | ScalarType::BigInt => "BIGINT",
            ScalarType::Float => "DOUBLE PRECISION",
            ScalarType::Decimal => "NUMERIC",
            ScalarType::Boolean => "BOOLEAN",
            ScalarType::DateTime => "TIMESTAMPTZ",
            ScalarType::Json => "JSONB",
        }
    }
}

/// Parses a timestamp in either RFC 3339 or the `YYYY-MM-DD HH:MM:SS[.f]+TZ`
/// text format the server prints.
fn parse_pg_timestamp(text: &str) -> Result<DateTime<chrono::FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt);
    }
    DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
        .with_context(|| format!("cannot parse timestamp `{}`", text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timestamp_normalization() {
        let dialect = PostgresDialect::default();
        let out = dialect
            .transform_output(&ScalarType::DateTime, json!("2023-06-01 14:30:00+02"))
            .unwrap();
        assert_eq!(out, json!("2023-06-01T12:30:00.000Z"));
    }

    #[test]
    fn test_json_reparse() {
        let dialect = PostgresDialect::default();
        let out = dialect
            .transform_output(&ScalarType::Json, json!(r#"{"a":1}"#))
            .unwrap();
        assert_eq!(out, json!({"a": 1}));
    }
}
