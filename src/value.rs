// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use anyhow::{bail, Context as _, Result};
use bigdecimal::BigDecimal;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The scalar builtins a field can have. Relations and enums are handled one
/// level up, in the schema; an enum-typed field reaches the value layer as
/// `ScalarType::Enum` with the variant validation already done.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarType {
    String,
    Int,
    Float,
    BigInt,
    Decimal,
    Boolean,
    DateTime,
    Bytes,
    Json,
    Enum,
}

impl ScalarType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "String",
            Self::Int => "Int",
            Self::Float => "Float",
            Self::BigInt => "BigInt",
            Self::Decimal => "Decimal",
            Self::Boolean => "Boolean",
            Self::DateTime => "DateTime",
            Self::Bytes => "Bytes",
            Self::Json => "Json",
            Self::Enum => "Enum",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int | Self::Float | Self::BigInt | Self::Decimal)
    }
}

/// A runtime value flowing between the JSON surface and the database.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    BigInt(i64),
    Float(f64),
    Decimal(BigDecimal),
    String(String),
    DateTime(DateTime<Utc>),
    /// Raw bytes; surfaced as base64 text in JSON and in storage.
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Enum(String),
}

impl Value {
    pub fn kind_str(&self) -> &str {
        match self {
            Self::Null => "Null",
            Self::Bool(_) => "Bool",
            Self::Int(_) => "Int",
            Self::BigInt(_) => "BigInt",
            Self::Float(_) => "Float",
            Self::Decimal(_) => "Decimal",
            Self::String(_) => "String",
            Self::DateTime(_) => "DateTime",
            Self::Bytes(_) => "Bytes",
            Self::Json(_) => "Json",
            Self::Enum(_) => "Enum",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Parses a JSON value coming from query arguments into a `Value` of the
    /// given scalar type.
    pub fn from_json(ty: &ScalarType, json: &serde_json::Value) -> Result<Value> {
        use serde_json::Value as J;
        if json.is_null() {
            return Ok(Value::Null);
        }
        let value = match (ty, json) {
            (ScalarType::String, J::String(s)) => Value::String(s.clone()),
            (ScalarType::Enum, J::String(s)) => Value::Enum(s.clone()),
            (ScalarType::Int, J::Number(n)) => {
                Value::Int(n.as_i64().context("integer out of i64 range")?)
            }
            (ScalarType::BigInt, J::Number(n)) => {
                Value::BigInt(n.as_i64().context("integer out of i64 range")?)
            }
            // BigInt values above the f64-safe range travel as strings.
            (ScalarType::BigInt, J::String(s)) => {
                Value::BigInt(s.parse().context("cannot parse BigInt string")?)
            }
            (ScalarType::Float, J::Number(n)) => {
                Value::Float(n.as_f64().context("cannot read number as f64")?)
            }
            (ScalarType::Decimal, J::String(s)) => {
                Value::Decimal(BigDecimal::from_str(s).context("cannot parse Decimal string")?)
            }
            (ScalarType::Decimal, J::Number(n)) => Value::Decimal(
                BigDecimal::from_str(&n.to_string()).context("cannot parse Decimal number")?,
            ),
            (ScalarType::Boolean, J::Bool(b)) => Value::Bool(*b),
            (ScalarType::DateTime, J::String(s)) => Value::DateTime(
                DateTime::parse_from_rfc3339(s)
                    .context("cannot parse DateTime (expected RFC 3339)")?
                    .with_timezone(&Utc),
            ),
            (ScalarType::Bytes, J::String(s)) => {
                Value::Bytes(base64::decode(s).context("cannot decode Bytes (expected base64)")?)
            }
            (ScalarType::Json, v) => Value::Json(v.clone()),
            (ty, v) => bail!("expected a {} value, got `{}`", ty.name(), v),
        };
        Ok(value)
    }

    /// Converts back to the JSON surface representation.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Int(i) => json!(i),
            Value::BigInt(i) => {
                // Stay a number inside the f64-safe range, else go string.
                if i.abs() <= (1i64 << 53) {
                    json!(i)
                } else {
                    json!(i.to_string())
                }
            }
            Value::Float(f) => json!(f),
            Value::Decimal(d) => json!(d.to_string()),
            Value::String(s) | Value::Enum(s) => json!(s),
            Value::DateTime(dt) => json!(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Value::Bytes(b) => json!(base64::encode(b)),
            Value::Json(v) => v.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! as_copy {
    ($method_name:ident, $variant:ident, $typ:ty) => {
        pub fn $method_name(&self) -> Result<$typ> {
            match self {
                Self::$variant(v) => Ok(*v),
                _ => bail!(
                    "tried to read value as {}, but it is of type {}",
                    stringify!($typ),
                    self.kind_str(),
                ),
            }
        }
    };
}

macro_rules! as_ref {
    ($method_name:ident, $variant:ident, $typ:ty) => {
        pub fn $method_name(&self) -> Result<&$typ> {
            match self {
                Self::$variant(v) => Ok(v),
                _ => bail!(
                    "tried to read value as {}, but it is of type {}",
                    stringify!($typ),
                    self.kind_str(),
                ),
            }
        }
    };
}

impl Value {
    as_ref!(as_str, String, str);
    as_copy!(as_i64, Int, i64);
    as_copy!(as_f64, Float, f64);
    as_copy!(as_bool, Bool, bool);
    as_ref!(as_bytes, Bytes, [u8]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_scalars() {
        let v = Value::from_json(&ScalarType::Int, &json!(42)).unwrap();
        assert_eq!(v, Value::Int(42));

        let v = Value::from_json(&ScalarType::Boolean, &json!(true)).unwrap();
        assert_eq!(v, Value::Bool(true));

        let v = Value::from_json(&ScalarType::Decimal, &json!("12.50")).unwrap();
        assert_eq!(v.to_json(), json!("12.50"));

        let v = Value::from_json(&ScalarType::DateTime, &json!("2023-01-15T10:30:00Z")).unwrap();
        assert_eq!(v.to_json(), json!("2023-01-15T10:30:00.000Z"));

        assert!(Value::from_json(&ScalarType::Int, &json!("nope")).is_err());
        assert!(Value::from_json(&ScalarType::DateTime, &json!("not a date")).is_err());
    }

    #[test]
    fn test_null_passthrough() {
        let v = Value::from_json(&ScalarType::String, &serde_json::Value::Null).unwrap();
        assert!(v.is_null());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let v = Value::from_json(&ScalarType::Bytes, &json!("aGVsbG8=")).unwrap();
        assert_eq!(v, Value::Bytes(b"hello".to_vec()));
        assert_eq!(v.to_json(), json!("aGVsbG8="));
    }

    #[test]
    fn test_bigint_beyond_safe_range() {
        let v = Value::BigInt(9007199254740993);
        assert_eq!(v.to_json(), json!("9007199254740993"));
        let v = Value::from_json(&ScalarType::BigInt, &json!("9007199254740993")).unwrap();
        assert_eq!(v, Value::BigInt(9007199254740993));
    }
}
