// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::value::{ScalarType, Value};
use anyhow::Result;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialectKind {
    Postgres,
    Sqlite,
}

/// Provider-specific strategy. The writer and the query compiler consult
/// this for everything the two supported databases disagree on; adding a
/// provider means implementing this contract.
pub trait Dialect: Send + Sync + fmt::Debug {
    fn kind(&self) -> DialectKind;

    /// The schema provider tag this dialect serves.
    fn provider(&self) -> &'static str;

    /// Whether `DISTINCT ON (…)` is available.
    fn supports_distinct_on(&self) -> bool;

    /// Whether `UPDATE … LIMIT` / `DELETE … LIMIT` are available.
    fn supports_mutation_limit(&self) -> bool;

    /// Whether `OFFSET` without `LIMIT` needs a `LIMIT -1` crutch.
    fn offset_requires_limit(&self) -> bool;

    /// Whether `ILIKE` exists; otherwise case-insensitive matches lower both
    /// operands.
    fn supports_ilike(&self) -> bool;

    /// Whether scalar list columns (`ARRAY[…]`, `@>`, `&&`) are available.
    fn supports_arrays(&self) -> bool;

    /// Encodes a runtime value into the shape it is bound with.
    fn encode_value(&self, value: Value) -> Value;

    /// A cast suffix to apply to the bind placeholder for this value, eg
    /// `::timestamptz`.
    fn param_cast(&self, value: &Value) -> Option<&'static str>;

    /// A type to `CAST(col AS …)` when selecting a column of this scalar
    /// type, where the native column type cannot travel through the driver.
    fn select_cast(&self, ty: &ScalarType) -> Option<&'static str>;

    /// Cast applied to JSON-strategy relation columns.
    fn json_column_cast(&self) -> Option<&'static str>;

    /// Cast applied to a scalar column of this type when it is embedded in a
    /// JSON object constructor.
    fn json_scalar_cast(&self, ty: &ScalarType) -> Option<&'static str>;

    /// Whether a subquery producing JSON needs re-parsing (`json(…)`) before
    /// being embedded in another JSON constructor.
    fn json_needs_reparse(&self) -> bool;

    /// Reverses `encode_value` on a JSON-decoded output value.
    fn transform_output(&self, ty: &ScalarType, json: serde_json::Value)
        -> Result<serde_json::Value>;

    /// Column type used by the table-creation test helper.
    fn column_type(&self, ty: &ScalarType) -> &'static str;
}
