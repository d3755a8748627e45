// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! The read-path compiler: turns validated query arguments into a SQL tree
//! plus a description of how to fold the rows back into entity trees.

pub mod filter;
pub mod order;
pub mod select;

use crate::schema::{Model, Schema};
use crate::sql::{Dialect, Select, SqlExpr};
use crate::value::ScalarType;
use anyhow::{anyhow, Result};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Context handed to `$expr` callbacks and computed-field callbacks.
pub struct ExprContext<'a> {
    /// Alias of the table the predicate applies to.
    pub table_alias: &'a str,
}

impl ExprContext<'_> {
    pub fn column(&self, name: &str) -> SqlExpr {
        SqlExpr::column(self.table_alias, name)
    }
}

pub type ExprSlotFn = Box<dyn Fn(&ExprContext) -> SqlExpr + Send + Sync>;

/// Named predicate callbacks referenced by `{"$expr": "<name>"}` in a
/// `where`. The produced predicate is ANDed with the rest of the filter.
#[derive(Default)]
pub struct ExprSlots {
    slots: HashMap<String, ExprSlotFn>,
}

impl ExprSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, f: ExprSlotFn) {
        self.slots.insert(name.into(), f);
    }

    pub fn get(&self, name: &str) -> Option<&ExprSlotFn> {
        self.slots.get(name)
    }
}

pub type ComputedFieldFn = Box<dyn Fn(&ExprContext) -> SqlExpr + Send + Sync>;

/// Per-(model, field) computed-field expressions, from the client options.
pub type ComputedFields = HashMap<(String, String), ComputedFieldFn>;

/// Everything the compiler needs besides the arguments themselves.
pub struct QueryCtx<'a> {
    pub schema: &'a Schema,
    pub dialect: &'a dyn Dialect,
    pub expr_slots: &'a ExprSlots,
    pub computed_fields: &'a ComputedFields,
    alias_counter: AtomicUsize,
}

impl<'a> QueryCtx<'a> {
    pub fn new(
        schema: &'a Schema,
        dialect: &'a dyn Dialect,
        expr_slots: &'a ExprSlots,
        computed_fields: &'a ComputedFields,
    ) -> Self {
        Self {
            schema,
            dialect,
            expr_slots,
            computed_fields,
            alias_counter: AtomicUsize::new(0),
        }
    }

    /// A fresh table alias; kept short and unique within one statement.
    pub fn fresh_alias(&self, base: &str) -> String {
        let n = self.alias_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", base, n)
    }

    /// Resolves a field, looking through the delegate base chain, and
    /// returns the model that actually carries it.
    pub fn resolve_field(&self, model: &'a Model, name: &str) -> Result<(&'a Model, &'a crate::schema::Field)> {
        if let Some(field) = model.get_field(name) {
            return Ok((model, field));
        }
        let mut base = model.base_model();
        while let Some(base_name) = base {
            let base_model = self.schema.model(base_name)?;
            if let Some(field) = base_model.get_field(name) {
                return Ok((base_model, field));
            }
            base = base_model.base_model();
        }
        Err(anyhow!("model `{}` has no field `{}`", model.name(), name))
    }
}

/// How one scalar output column maps back to the entity tree.
#[derive(Debug, Clone)]
pub struct ScalarShape {
    /// Key in the output object.
    pub name: String,
    /// Column alias in the row.
    pub alias: String,
    pub ty: ScalarType,
}

/// A relation delivered as a JSON-aggregated column.
#[derive(Debug, Clone)]
pub struct JsonRelationShape {
    pub name: String,
    pub alias: String,
    pub to_many: bool,
    pub optional: bool,
    pub nested: EntityShape,
}

/// A to-one relation delivered flat, through left-joined columns with
/// `$`-separated alias prefixes.
#[derive(Debug, Clone)]
pub struct FlatRelationShape {
    pub name: String,
    pub optional: bool,
    /// Aliases of the related id columns; all NULL means the relation is
    /// absent.
    pub id_aliases: Vec<String>,
    pub nested: EntityShape,
}

#[derive(Debug, Clone)]
pub struct DelegateShape {
    /// Descendant model name.
    pub model: String,
    /// Alias of the `$delegate$<Model>` JSON column.
    pub alias: String,
    pub nested: EntityShape,
}

/// The decoding recipe for one entity level of the result.
#[derive(Debug, Clone, Default)]
pub struct EntityShape {
    pub model: String,
    pub scalars: Vec<ScalarShape>,
    pub json_relations: Vec<JsonRelationShape>,
    pub flat_relations: Vec<FlatRelationShape>,
    pub delegates: Vec<DelegateShape>,
    /// Alias of the `_count` JSON column, when requested.
    pub count_alias: Option<String>,
}

/// What an output column holds, for row decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnKind {
    Scalar(ScalarType),
    /// A JSON-strategy column: relation aggregate, `_count`, `$delegate$…`.
    Json,
}

impl EntityShape {
    /// Every output column this shape reads, in no particular order.
    pub fn columns(&self) -> Vec<(String, ColumnKind)> {
        let mut cols = vec![];
        for scalar in &self.scalars {
            cols.push((scalar.alias.clone(), ColumnKind::Scalar(scalar.ty.clone())));
        }
        for flat in &self.flat_relations {
            for scalar in &flat.nested.scalars {
                cols.push((scalar.alias.clone(), ColumnKind::Scalar(scalar.ty.clone())));
            }
        }
        for rel in &self.json_relations {
            cols.push((rel.alias.clone(), ColumnKind::Json));
        }
        for delegate in &self.delegates {
            cols.push((delegate.alias.clone(), ColumnKind::Json));
        }
        if let Some(alias) = &self.count_alias {
            cols.push((alias.clone(), ColumnKind::Json));
        }
        cols
    }
}

/// A compiled read, ready for rendering and execution.
#[derive(Debug, Clone)]
pub struct ReadQuery {
    pub select: Select,
    pub shape: EntityShape,
}

/// Compiles a `findMany`-family read. `single` limits the result to one row
/// (findUnique / findFirst).
pub fn compile_find(
    ctx: &QueryCtx<'_>,
    model: &Model,
    args: &JsonValue,
    single: bool,
) -> Result<ReadQuery> {
    select::compile_entity_select(ctx, model, args, single)
}

/// Compiles `count`: the filtered id set wrapped in `SELECT COUNT(*)`.
pub fn compile_count(ctx: &QueryCtx<'_>, model: &Model, args: &JsonValue) -> Result<Select> {
    select::compile_count(ctx, model, args)
}

/// Compiles `aggregate`.
pub fn compile_aggregate(
    ctx: &QueryCtx<'_>,
    model: &Model,
    args: &JsonValue,
) -> Result<(Select, Vec<ScalarShape>)> {
    select::compile_aggregate(ctx, model, args)
}

/// Compiles `groupBy`.
pub fn compile_group_by(
    ctx: &QueryCtx<'_>,
    model: &Model,
    args: &JsonValue,
) -> Result<(Select, Vec<ScalarShape>)> {
    select::compile_group_by(ctx, model, args)
}
