// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! The mutation planner: orders and executes nested write operations inside
//! one transaction, fills generated values, and enforces write-time
//! policies.

use crate::engine::{ExecutionEngine, TransactionStatic};
use crate::error::{Error, Result};
use crate::policy;
use crate::query::{filter, ColumnKind, QueryCtx};
use crate::schema::{
    utils, DefaultValue, Field, Generator, Model, PolicyOperation,
};
use crate::sql::{
    Delete, Insert, OnConflict, Select, SqlBinaryOp, SqlExpr, Statement, Update,
};
use crate::value::Value;
use crate::JsonObject;
use anyhow::{anyhow, Context as _};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value as JsonValue;

/// Identifying values of one row: id field name → JSON value.
pub type IdMap = JsonObject;

/// Nested relation operations run in this order after the parent row
/// exists; it preserves referential integrity under the common patterns
/// (detach before delete, create before connect-by-key, update last).
const NESTED_OP_ORDER: &[&str] = &[
    "disconnect",
    "set",
    "delete",
    "deleteMany",
    "create",
    "createMany",
    "connect",
    "connectOrCreate",
    "update",
    "updateMany",
    "upsert",
];

pub struct MutationPlanner<'a> {
    pub ctx: &'a QueryCtx<'a>,
    pub engine: &'a ExecutionEngine,
    pub auth: &'a JsonValue,
    pub policies_enabled: bool,
}

impl<'a> MutationPlanner<'a> {
    /// Top-level `create`. Returns the root row's ids for read-back.
    pub async fn create(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        data: &JsonValue,
    ) -> Result<IdMap> {
        let data = data
            .as_object()
            .context("`data` must be an object")?;
        self.create_entity(tr, model, data, JsonObject::new()).await
    }

    /// Top-level `createMany`. Returns the number of inserted rows and, for
    /// the `AndReturn` variant, each row's ids in input order.
    pub async fn create_many(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        data: &JsonValue,
        skip_duplicates: bool,
    ) -> Result<(u64, Vec<IdMap>)> {
        let rows = data.as_array().context("`data` must be an array")?;
        self.create_many_rows(tr, model, rows, skip_duplicates, &JsonObject::new())
            .await
    }

    /// The shared `createMany` body; `preset` carries the parent FK values
    /// for the nested form. Input order is preserved: consecutive rows with
    /// the same column signature batch into one multi-row INSERT.
    async fn create_many_rows(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        rows: &[JsonValue],
        skip_duplicates: bool,
        preset: &JsonObject,
    ) -> Result<(u64, Vec<IdMap>)> {
        let mut prepared: Vec<(Vec<String>, Vec<SqlExpr>)> = vec![];
        for row in rows {
            let row = row.as_object().context("rows must be objects")?;
            let (columns, values, id_map) = self.prepare_row(model, row, preset)?;
            self.check_create_policy(tr, model, row, &id_map).await?;
            prepared.push((columns, values));
        }

        let mut ids = vec![];
        let mut count = 0;
        let mut start = 0;
        while start < prepared.len() {
            let mut end = start + 1;
            while end < prepared.len() && prepared[end].0 == prepared[start].0 {
                end += 1;
            }
            let insert = Insert {
                table: model.db_table().to_owned(),
                model: model.name().to_owned(),
                columns: prepared[start].0.clone(),
                rows: prepared[start..end]
                    .iter()
                    .map(|(_, values)| values.iter().cloned().map(Some).collect())
                    .collect(),
                on_conflict: skip_duplicates.then_some(OnConflict::DoNothing),
                returning: model.id_fields().to_vec(),
            };
            if model.id_fields().is_empty() {
                count += self
                    .engine
                    .execute(tr, &Statement::Insert(insert), model.name())
                    .await?;
            } else {
                // Conflicting rows are absent from RETURNING.
                let returned = self
                    .engine
                    .fetch_all(tr, &Statement::Insert(insert), model.name())
                    .await?;
                for row in &returned {
                    let id_map = self.decode_ids(model, row)?;
                    self.check_create_policy_fallback(tr, model, &id_map).await?;
                    count += 1;
                    ids.push(id_map);
                }
            }
            start = end;
        }
        Ok((count, ids))
    }

    /// Top-level `update`. Returns the (possibly changed) ids of the row.
    pub async fn update(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        where_: &JsonValue,
        data: &JsonValue,
    ) -> Result<IdMap> {
        // Mutation predicates compile against the table name itself so that
        // correlated subqueries stay valid inside UPDATE/DELETE.
        let alias = model.db_table().to_owned();
        let predicate = filter::compile_unique_where(self.ctx, model, &alias, where_)
            .map_err(Error::Internal)?;
        let data = data.as_object().context("`data` must be an object")?;
        self.update_entity(tr, model, &alias, predicate, data).await
    }

    /// Top-level `updateMany`: one patch applied to every matching row.
    pub async fn update_many(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        args: &JsonValue,
    ) -> Result<u64> {
        let alias = model.db_table().to_owned();
        let mut predicate = match args.get("where") {
            Some(w) => filter::compile_where(self.ctx, model, &alias, w).map_err(Error::Internal)?,
            None => SqlExpr::Bool(true),
        };
        predicate = self.with_policy_filter(model, &alias, predicate, PolicyOperation::Update)?;
        let data = args
            .get("data")
            .and_then(|d| d.as_object())
            .context("`data` must be an object")?;
        let sets = self.scalar_sets(model, &alias, data, true)?;
        if sets.is_empty() {
            return Ok(0);
        }
        let limit = args.get("limit").and_then(|l| l.as_u64());
        let (where_, limit) = self.narrow_mutation(model, &alias, predicate, limit)?;
        let update = Update {
            table: model.db_table().to_owned(),
            model: model.name().to_owned(),
            sets,
            where_: Some(where_),
            limit,
            returning: vec![],
        };
        let affected = self
            .engine
            .execute(tr, &Statement::Update(update), model.name())
            .await?;
        self.check_post_update_many(tr, model).await?;
        Ok(affected)
    }

    /// Top-level `upsert`: conditional select, then branch.
    pub async fn upsert(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        args: &JsonValue,
    ) -> Result<IdMap> {
        let where_ = args.get("where").context("`where` is required")?;
        let alias = model.db_table().to_owned();
        let predicate = filter::compile_unique_where(self.ctx, model, &alias, where_)
            .map_err(Error::Internal)?;
        let existing = self
            .find_ids(tr, model, &alias, predicate.clone(), PolicyOperation::Update)
            .await?;
        if existing.is_empty() {
            let data = args
                .get("create")
                .and_then(|d| d.as_object())
                .context("`create` must be an object")?;
            self.create_entity(tr, model, data, JsonObject::new()).await
        } else {
            let data = args
                .get("update")
                .and_then(|d| d.as_object())
                .context("`update` must be an object")?;
            self.update_entity(tr, model, &alias, predicate, data).await
        }
    }

    /// Top-level `delete`. The row must exist and pass the delete policy.
    pub async fn delete(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        where_: &JsonValue,
    ) -> Result<()> {
        let alias = self.ctx.fresh_alias("m");
        let predicate = filter::compile_unique_where(self.ctx, model, &alias, where_)
            .map_err(Error::Internal)?;
        let ids = self
            .find_ids(tr, model, &alias, predicate, PolicyOperation::Delete)
            .await?;
        let id_map = ids
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(model.name()))?;
        let delete = Delete {
            table: model.db_table().to_owned(),
            model: model.name().to_owned(),
            where_: Some(self.ids_predicate(model, "", &id_map)?),
            limit: None,
        };
        self.engine
            .execute(tr, &Statement::Delete(delete), model.name())
            .await?;
        Ok(())
    }

    pub async fn delete_many(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        args: &JsonValue,
    ) -> Result<u64> {
        let alias = model.db_table().to_owned();
        let mut predicate = match args.get("where") {
            Some(w) => filter::compile_where(self.ctx, model, &alias, w).map_err(Error::Internal)?,
            None => SqlExpr::Bool(true),
        };
        predicate = self.with_policy_filter(model, &alias, predicate, PolicyOperation::Delete)?;
        let limit = args.get("limit").and_then(|l| l.as_u64());
        let (where_, limit) = self.narrow_mutation(model, &alias, predicate, limit)?;
        let delete = Delete {
            table: model.db_table().to_owned(),
            model: model.name().to_owned(),
            where_: Some(where_),
            limit,
        };
        self.engine
            .execute(tr, &Statement::Delete(delete), model.name())
            .await
    }

    // ---- create internals ----

    /// Recursively creates one entity: owned-side references resolve first,
    /// then the insert, then the non-owned nested operations.
    fn create_entity<'s>(
        &'s self,
        tr: &'s TransactionStatic,
        model: &'a Model,
        data: &'s JsonObject,
        preset: JsonObject,
    ) -> BoxFuture<'s, Result<IdMap>> {
        async move {
            let mut scalars = preset;
            let mut nested: Vec<(&Field, &JsonValue)> = vec![];
            for (key, value) in data {
                let field = model
                    .get_field(key)
                    .ok_or_else(|| anyhow!("no field `{}` on `{}`", key, model.name()))?;
                if field.is_relation() {
                    nested.push((field, value));
                } else {
                    scalars.insert(key.clone(), value.clone());
                }
            }

            // Owned-side to-one relations become FK assignments pre-insert.
            let mut deferred: Vec<(&Field, &JsonValue)> = vec![];
            for (field, ops) in nested {
                let keys = if utils::is_many_to_many(self.ctx.schema, field) {
                    None
                } else {
                    Some(utils::relation_keys(self.ctx.schema, model, field)?)
                };
                match keys {
                    Some(keys) if keys.owned_by_model => {
                        let fk_values = self.resolve_owned_reference(tr, model, field, ops).await?;
                        for (name, value) in fk_values {
                            scalars.insert(name, value);
                        }
                    }
                    _ => deferred.push((field, ops)),
                }
            }

            let (columns, values, id_map) = self.prepare_row(model, &scalars, &JsonObject::new())?;
            self.check_create_policy(tr, model, &scalars, &id_map).await?;

            let insert = Insert {
                table: model.db_table().to_owned(),
                model: model.name().to_owned(),
                columns,
                rows: vec![values.into_iter().map(Some).collect()],
                on_conflict: None,
                returning: model.id_fields().to_vec(),
            };
            let id_map = if model.id_fields().is_empty() {
                self.engine
                    .execute(tr, &Statement::Insert(insert), model.name())
                    .await?;
                id_map
            } else {
                let row = self
                    .engine
                    .fetch_optional(tr, &Statement::Insert(insert), model.name())
                    .await?
                    .ok_or_else(|| anyhow!("INSERT returned no row"))?;
                self.decode_ids(model, &row)?
            };

            self.check_create_policy_fallback(tr, model, &id_map).await?;

            for (field, ops) in deferred {
                self.run_nested_ops(tr, model, field, &id_map, ops).await?;
            }
            Ok(id_map)
        }
        .boxed()
    }

    /// Resolves a to-one relation the current model owns the FK for into
    /// concrete FK values.
    async fn resolve_owned_reference(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        field: &'a Field,
        ops: &JsonValue,
    ) -> Result<JsonObject> {
        let target = self.ctx.schema.relation_model(field).map_err(Error::Internal)?;
        let keys = utils::relation_keys(self.ctx.schema, model, field)?;
        let ops = ops.as_object().context("expected a relation operation")?;
        let referenced = |id_map: &JsonObject| -> Result<JsonObject> {
            let mut out = JsonObject::new();
            for pair in &keys.key_pairs {
                let value = id_map
                    .get(&pair.pk)
                    .cloned()
                    .ok_or_else(|| anyhow!("missing referenced value `{}`", pair.pk))?;
                out.insert(pair.fk.clone(), value);
            }
            Ok(out)
        };
        for (op, value) in ops {
            match op.as_str() {
                "connect" => {
                    let row = self
                        .locate_unique(tr, target, value, PolicyOperation::Read, &keys.key_pairs)
                        .await?
                        .ok_or_else(|| Error::not_found(target.name()))?;
                    return referenced(&row);
                }
                "create" => {
                    let data = value.as_object().context("expected an object")?;
                    let created = self
                        .create_entity(tr, target, data, JsonObject::new())
                        .await?;
                    let row = self.row_values(tr, target, &created, &keys.key_pairs).await?;
                    return referenced(&row);
                }
                "connectOrCreate" => {
                    let where_ = value.get("where").context("expected `where`")?;
                    if let Some(row) = self
                        .locate_unique(tr, target, where_, PolicyOperation::Read, &keys.key_pairs)
                        .await?
                    {
                        return referenced(&row);
                    }
                    let data = value
                        .get("create")
                        .and_then(|d| d.as_object())
                        .context("expected `create`")?;
                    let created = self
                        .create_entity(tr, target, data, JsonObject::new())
                        .await?;
                    let row = self.row_values(tr, target, &created, &keys.key_pairs).await?;
                    return referenced(&row);
                }
                other => {
                    return Err(anyhow!(
                        "`{}` is not valid for an owned to-one relation here",
                        other
                    )
                    .into())
                }
            }
        }
        Err(anyhow!("empty relation operation for `{}`", field.name).into())
    }

    /// Fetches the values of the referenced columns for a known row.
    async fn row_values(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        id_map: &IdMap,
        pairs: &[utils::KeyPair],
    ) -> Result<JsonObject> {
        // Fast path: the referenced columns are the ids we already have.
        if pairs.iter().all(|p| id_map.contains_key(&p.pk)) {
            return Ok(id_map.clone());
        }
        let alias = self.ctx.fresh_alias("m");
        let predicate = self.ids_predicate(model, &alias, id_map)?;
        let mut select = Select::from_table(model.db_table(), &alias, Some(model.name()));
        let mut columns = vec![];
        for pair in pairs {
            let field = model.field_or_err(&pair.pk)?;
            let ty = field.type_.scalar().context("referenced field is scalar")?;
            select.column(SqlExpr::column(&alias, &pair.pk), Some(pair.pk.as_str()));
            columns.push((pair.pk.clone(), ColumnKind::Scalar(ty)));
        }
        select.and_where(predicate);
        let row = self
            .engine
            .fetch_optional(tr, &Statement::Select(select), model.name())
            .await?
            .ok_or_else(|| Error::not_found(model.name()))?;
        self.engine.decode_columns(&row, &columns).map_err(Error::Internal)
    }

    /// Finds one row by unique `where` (policy-filtered) and returns the
    /// values of `extra` columns along with the ids.
    async fn locate_unique(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        where_: &JsonValue,
        op: PolicyOperation,
        extra: &[utils::KeyPair],
    ) -> Result<Option<JsonObject>> {
        let alias = self.ctx.fresh_alias("m");
        let mut predicate = filter::compile_unique_where(self.ctx, model, &alias, where_)
            .map_err(Error::Internal)?;
        predicate = self.with_policy_filter(model, &alias, predicate, op)?;
        let mut select = Select::from_table(model.db_table(), &alias, Some(model.name()));
        let mut columns = vec![];
        let mut wanted: Vec<String> = model.id_fields().to_vec();
        for pair in extra {
            if !wanted.contains(&pair.pk) {
                wanted.push(pair.pk.clone());
            }
        }
        for name in &wanted {
            let field = model.field_or_err(name)?;
            let ty = field.type_.scalar().context("unique fields are scalars")?;
            select.column(SqlExpr::column(&alias, name), Some(name.as_str()));
            columns.push((name.clone(), ColumnKind::Scalar(ty)));
        }
        select.and_where(predicate);
        select.limit = Some(1);
        let row = self
            .engine
            .fetch_optional(tr, &Statement::Select(select), model.name())
            .await?;
        match row {
            Some(row) => Ok(Some(
                self.engine.decode_columns(&row, &columns).map_err(Error::Internal)?,
            )),
            None => Ok(None),
        }
    }

    /// Prepares one row for insertion: scalar values from the input, plus
    /// generated defaults; returns columns, value expressions, and the id
    /// values known before the insert.
    fn prepare_row(
        &self,
        model: &Model,
        data: &JsonObject,
        preset: &JsonObject,
    ) -> Result<(Vec<String>, Vec<SqlExpr>, IdMap)> {
        let mut columns = vec![];
        let mut values = vec![];
        let mut id_map = IdMap::new();
        for field in model.scalar_fields() {
            if field.computed {
                continue;
            }
            let ty = field
                .type_
                .scalar()
                .ok_or_else(|| anyhow!("`{}` has no scalar type", field.name))?;
            let provided = data.get(&field.name).or_else(|| preset.get(&field.name));
            let (expr, json) = match provided {
                Some(JsonValue::Null) => (SqlExpr::Null, JsonValue::Null),
                Some(json) => {
                    let value = Value::from_json(&ty, json).with_context(|| {
                        format!("invalid value for `{}.{}`", model.name(), field.name)
                    })?;
                    (SqlExpr::Param(value), json.clone())
                }
                None => match generated_value(field)? {
                    Some(value) => {
                        let json = value.to_json();
                        (SqlExpr::Param(value), json)
                    }
                    None if field.generator == Some(Generator::Autoincrement) => continue,
                    None if field.optional => continue,
                    None => {
                        return Err(anyhow!(
                            "missing value for required field `{}.{}`",
                            model.name(),
                            field.name
                        )
                        .into())
                    }
                },
            };
            if model.id_fields().contains(&field.name) && !json.is_null() {
                id_map.insert(field.name.clone(), json.clone());
            }
            columns.push(field.name.clone());
            values.push(expr);
        }
        Ok((columns, values, id_map))
    }

    fn decode_ids(&self, model: &Model, row: &sqlx::any::AnyRow) -> Result<IdMap> {
        let mut columns = vec![];
        for name in model.id_fields() {
            let field = model.field_or_err(name)?;
            let ty = field.type_.scalar().context("id fields are scalars")?;
            columns.push((name.clone(), ColumnKind::Scalar(ty)));
        }
        self.engine.decode_columns(row, &columns).map_err(Error::Internal)
    }

    /// Equality predicate over a row's id values.
    fn ids_predicate(&self, model: &Model, alias: &str, id_map: &IdMap) -> Result<SqlExpr> {
        let mut out = SqlExpr::Bool(true);
        for name in model.id_fields() {
            let field = model.field_or_err(name)?;
            let ty = field.type_.scalar().context("id fields are scalars")?;
            let json = id_map
                .get(name)
                .ok_or_else(|| anyhow!("missing id value `{}`", name))?;
            let value = Value::from_json(&ty, json).map_err(Error::Internal)?;
            out = SqlExpr::and(
                out,
                SqlExpr::binary(
                    SqlExpr::column(alias, name),
                    SqlBinaryOp::Eq,
                    SqlExpr::Param(value),
                ),
            );
        }
        Ok(out)
    }

    // ---- update internals ----

    fn update_entity<'s>(
        &'s self,
        tr: &'s TransactionStatic,
        model: &'a Model,
        alias: &'s str,
        locate: SqlExpr,
        data: &'s JsonObject,
    ) -> BoxFuture<'s, Result<IdMap>> {
        async move {
            let predicate =
                self.with_policy_filter(model, alias, locate, PolicyOperation::Update)?;
            let ids = self
                .find_ids_with(tr, model, alias, predicate)
                .await?;
            let mut id_map = ids
                .into_iter()
                .next()
                .ok_or_else(|| Error::not_found(model.name()))?;

            let mut sets = self.scalar_sets(model, alias, data, true)?;
            let mut nested: Vec<(&Field, &JsonValue)> = vec![];
            for (key, value) in data {
                let field = model
                    .get_field(key)
                    .ok_or_else(|| anyhow!("no field `{}` on `{}`", key, model.name()))?;
                if !field.is_relation() {
                    continue;
                }
                let owned = !utils::is_many_to_many(self.ctx.schema, field)
                    && utils::relation_keys(self.ctx.schema, model, field)?.owned_by_model;
                if owned {
                    // Owned-side manipulations become FK column updates.
                    let fk_sets = self
                        .owned_update_sets(tr, model, field, value)
                        .await?;
                    sets.extend(fk_sets);
                } else {
                    nested.push((field, value));
                }
            }

            if !sets.is_empty() {
                let update = Update {
                    table: model.db_table().to_owned(),
                    model: model.name().to_owned(),
                    sets,
                    where_: Some(self.ids_predicate(model, "", &id_map)?),
                    limit: None,
                    returning: vec![],
                };
                self.engine
                    .execute(tr, &Statement::Update(update), model.name())
                    .await?;
            }

            // Id columns change iff explicitly updated.
            for name in model.id_fields() {
                if let Some(new_value) = data.get(name) {
                    if !new_value.is_object() {
                        id_map.insert(name.clone(), new_value.clone());
                    } else if let Some(set) = new_value.get("set") {
                        id_map.insert(name.clone(), set.clone());
                    }
                }
            }

            for (field, ops) in nested {
                self.run_nested_ops(tr, model, field, &id_map, ops).await?;
            }

            self.check_post_update(tr, model, &id_map).await?;
            Ok(id_map)
        }
        .boxed()
    }

    /// Scalar assignments of an update `data` object, including atomic
    /// numeric updaters and `@updatedAt` maintenance.
    fn scalar_sets(
        &self,
        model: &Model,
        _alias: &str,
        data: &JsonObject,
        touch_updated_at: bool,
    ) -> Result<Vec<(String, SqlExpr)>> {
        let mut sets = vec![];
        for (key, value) in data {
            let field = model
                .get_field(key)
                .ok_or_else(|| anyhow!("no field `{}` on `{}`", key, model.name()))?;
            if field.is_relation() {
                continue;
            }
            let ty = field
                .type_
                .scalar()
                .ok_or_else(|| anyhow!("`{}` has no scalar type", field.name))?;
            let expr = match value {
                JsonValue::Null => SqlExpr::Null,
                JsonValue::Object(updater)
                    if !matches!(ty, crate::value::ScalarType::Json) =>
                {
                    let (op, operand) = updater
                        .iter()
                        .next()
                        .context("empty update operation")?;
                    match op.as_str() {
                        "set" => match operand {
                            JsonValue::Null => SqlExpr::Null,
                            other => SqlExpr::Param(Value::from_json(&ty, other)?),
                        },
                        // Atomic updaters compile to in-place expressions,
                        // not read-modify-write.
                        "increment" | "decrement" | "multiply" | "divide" => {
                            let column = SqlExpr::column("", &field.name);
                            let operand = SqlExpr::Param(Value::from_json(&ty, operand)?);
                            let op = match op.as_str() {
                                "increment" => SqlBinaryOp::Add,
                                "decrement" => SqlBinaryOp::Sub,
                                "multiply" => SqlBinaryOp::Mul,
                                _ => SqlBinaryOp::Div,
                            };
                            SqlExpr::binary(column, op, operand)
                        }
                        other => {
                            return Err(anyhow!("unknown update operator `{}`", other).into())
                        }
                    }
                }
                other => SqlExpr::Param(Value::from_json(&ty, other).with_context(|| {
                    format!("invalid value for `{}.{}`", model.name(), field.name)
                })?),
            };
            sets.push((field.name.clone(), expr));
        }
        if touch_updated_at && !sets.is_empty() {
            for field in model.scalar_fields() {
                if field.updated_at && !data.contains_key(&field.name) {
                    sets.push((
                        field.name.clone(),
                        SqlExpr::Param(Value::DateTime(Utc::now())),
                    ));
                }
            }
        }
        Ok(sets)
    }

    /// FK-column assignments for owned-side relation ops inside an update.
    async fn owned_update_sets(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        field: &'a Field,
        ops: &JsonValue,
    ) -> Result<Vec<(String, SqlExpr)>> {
        let keys = utils::relation_keys(self.ctx.schema, model, field)?;
        let ops_map = ops.as_object().context("expected a relation operation")?;
        if ops_map.get("disconnect").and_then(|d| d.as_bool()) == Some(true) {
            return Ok(keys
                .key_pairs
                .iter()
                .map(|p| (p.fk.clone(), SqlExpr::Null))
                .collect());
        }
        let values = self.resolve_owned_reference(tr, model, field, ops).await?;
        let mut sets = vec![];
        for pair in &keys.key_pairs {
            let fk_field = model.field_or_err(&pair.fk)?;
            let ty = fk_field.type_.scalar().context("FK fields are scalars")?;
            let json = values
                .get(&pair.fk)
                .ok_or_else(|| anyhow!("missing FK value `{}`", pair.fk))?;
            sets.push((
                pair.fk.clone(),
                SqlExpr::Param(Value::from_json(&ty, json)?),
            ));
        }
        Ok(sets)
    }

    // ---- nested (non-owned) operations ----

    async fn run_nested_ops(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        field: &'a Field,
        parent_ids: &IdMap,
        ops: &JsonValue,
    ) -> Result<()> {
        let ops = ops.as_object().context("expected a relation operation")?;
        for op_name in NESTED_OP_ORDER {
            let Some(value) = ops.get(*op_name) else {
                continue;
            };
            self.run_nested_op(tr, model, field, parent_ids, op_name, value)
                .await?;
        }
        for key in ops.keys() {
            if !NESTED_OP_ORDER.contains(&key.as_str()) {
                return Err(anyhow!("unknown relation operation `{}`", key).into());
            }
        }
        Ok(())
    }

    async fn run_nested_op(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        field: &'a Field,
        parent_ids: &IdMap,
        op_name: &str,
        value: &JsonValue,
    ) -> Result<()> {
        let target = self.ctx.schema.relation_model(field).map_err(Error::Internal)?;
        let m2m = utils::is_many_to_many(self.ctx.schema, field);
        let items: Vec<&JsonValue> = match value {
            JsonValue::Array(items) => items.iter().collect(),
            single => vec![single],
        };

        match op_name {
            "create" => {
                for item in &items {
                    let data = item.as_object().context("expected an object")?;
                    if m2m {
                        let child_ids = self
                            .create_entity(tr, target, data, JsonObject::new())
                            .await?;
                        self.link_m2m(tr, model, field, parent_ids, &child_ids).await?;
                    } else {
                        let preset = self.child_fk_values(model, field, parent_ids)?;
                        self.create_entity(tr, target, data, preset).await?;
                    }
                }
            }
            "createMany" => {
                let data = value.get("data").context("expected `{ data: […] }`")?;
                let skip = value
                    .get("skipDuplicates")
                    .and_then(|s| s.as_bool())
                    .unwrap_or(false);
                let rows = data.as_array().context("`data` must be an array")?;
                let preset = self.child_fk_values(model, field, parent_ids)?;
                self.create_many_rows(tr, target, rows, skip, &preset).await?;
            }
            "connect" => {
                for item in &items {
                    if m2m {
                        let child = self
                            .locate_unique(tr, target, item, PolicyOperation::Read, &[])
                            .await?
                            .ok_or_else(|| Error::not_found(target.name()))?;
                        self.link_m2m(tr, model, field, parent_ids, &child).await?;
                    } else {
                        self.attach_child(tr, model, field, parent_ids, item).await?;
                    }
                }
            }
            "connectOrCreate" => {
                for item in &items {
                    let where_ = item.get("where").context("expected `where`")?;
                    let found = self
                        .locate_unique(tr, target, where_, PolicyOperation::Read, &[])
                        .await?;
                    match found {
                        Some(child) if m2m => {
                            self.link_m2m(tr, model, field, parent_ids, &child).await?
                        }
                        Some(_) => self.attach_child(tr, model, field, parent_ids, where_).await?,
                        None => {
                            let data = item
                                .get("create")
                                .and_then(|d| d.as_object())
                                .context("expected `create`")?;
                            if m2m {
                                let child_ids = self
                                    .create_entity(tr, target, data, JsonObject::new())
                                    .await?;
                                self.link_m2m(tr, model, field, parent_ids, &child_ids).await?;
                            } else {
                                let preset = self.child_fk_values(model, field, parent_ids)?;
                                self.create_entity(tr, target, data, preset).await?;
                            }
                        }
                    }
                }
            }
            "disconnect" => {
                if m2m {
                    for item in &items {
                        let child = self
                            .locate_unique(tr, target, item, PolicyOperation::Read, &[])
                            .await?
                            .ok_or_else(|| Error::not_found(target.name()))?;
                        self.unlink_m2m(tr, model, field, parent_ids, Some(&child)).await?;
                    }
                } else if field.is_to_many() {
                    for item in &items {
                        self.detach_child(tr, model, field, parent_ids, Some(item)).await?;
                    }
                } else if value.as_bool() == Some(true) {
                    self.detach_child(tr, model, field, parent_ids, None).await?;
                }
            }
            "set" => {
                // First detach everything not in the new set, then connect
                // the listed rows; idempotent for already-connected ids.
                if m2m {
                    self.unlink_m2m(tr, model, field, parent_ids, None).await?;
                    for item in &items {
                        let child = self
                            .locate_unique(tr, target, item, PolicyOperation::Read, &[])
                            .await?
                            .ok_or_else(|| Error::not_found(target.name()))?;
                        self.link_m2m(tr, model, field, parent_ids, &child).await?;
                    }
                } else {
                    self.detach_all_children(tr, model, field, parent_ids, &items).await?;
                    for item in &items {
                        self.attach_child(tr, model, field, parent_ids, item).await?;
                    }
                }
            }
            "delete" | "deleteMany" => {
                for item in &items {
                    let alias = target.db_table().to_owned();
                    let mut predicate = if op_name == "delete" {
                        filter::compile_unique_where(self.ctx, target, &alias, item)
                            .map_err(Error::Internal)?
                    } else {
                        filter::compile_where(self.ctx, target, &alias, item)
                            .map_err(Error::Internal)?
                    };
                    predicate = SqlExpr::and(
                        predicate,
                        self.child_link_predicate(model, field, parent_ids, &alias)?,
                    );
                    predicate = self.with_policy_filter(
                        target,
                        &alias,
                        predicate,
                        PolicyOperation::Delete,
                    )?;
                    let rows = self.find_ids_with(tr, target, &alias, predicate).await?;
                    if op_name == "delete" && rows.is_empty() {
                        return Err(Error::not_found(target.name()));
                    }
                    for row in rows {
                        if m2m {
                            self.unlink_m2m(tr, model, field, parent_ids, Some(&row)).await?;
                        }
                        let delete = Delete {
                            table: target.db_table().to_owned(),
                            model: target.name().to_owned(),
                            where_: Some(self.ids_predicate(target, "", &row)?),
                            limit: None,
                        };
                        self.engine
                            .execute(tr, &Statement::Delete(delete), target.name())
                            .await?;
                    }
                }
            }
            "update" | "updateMany" => {
                for item in &items {
                    let (where_, data) = if field.is_to_many() || item.get("data").is_some() {
                        (
                            item.get("where").cloned().unwrap_or(JsonValue::Null),
                            item.get("data").context("expected `data`")?,
                        )
                    } else {
                        (JsonValue::Null, *item)
                    };
                    let alias = target.db_table().to_owned();
                    let mut predicate = if op_name == "update" && !where_.is_null() {
                        filter::compile_unique_where(self.ctx, target, &alias, &where_)
                            .map_err(Error::Internal)?
                    } else if !where_.is_null() {
                        filter::compile_where(self.ctx, target, &alias, &where_)
                            .map_err(Error::Internal)?
                    } else {
                        SqlExpr::Bool(true)
                    };
                    predicate = SqlExpr::and(
                        predicate,
                        self.child_link_predicate(model, field, parent_ids, &alias)?,
                    );
                    let data = data.as_object().context("`data` must be an object")?;
                    if op_name == "update" {
                        self.update_entity(tr, target, &alias, predicate, data).await?;
                    } else {
                        // One patch for every matching row.
                        predicate = self.with_policy_filter(
                            target,
                            &alias,
                            predicate,
                            PolicyOperation::Update,
                        )?;
                        let sets = self.scalar_sets(target, &alias, data, true)?;
                        if sets.is_empty() {
                            continue;
                        }
                        let (where_, _) =
                            self.narrow_mutation(target, &alias, predicate, None)?;
                        let update = Update {
                            table: target.db_table().to_owned(),
                            model: target.name().to_owned(),
                            sets,
                            where_: Some(where_),
                            limit: None,
                            returning: vec![],
                        };
                        self.engine
                            .execute(tr, &Statement::Update(update), target.name())
                            .await?;
                        self.check_post_update_many(tr, target).await?;
                    }
                }
            }
            "upsert" => {
                for item in &items {
                    let where_ = item.get("where").context("expected `where`")?;
                    let alias = target.db_table().to_owned();
                    let mut predicate =
                        filter::compile_unique_where(self.ctx, target, &alias, where_)
                            .map_err(Error::Internal)?;
                    predicate = SqlExpr::and(
                        predicate,
                        self.child_link_predicate(model, field, parent_ids, &alias)?,
                    );
                    let existing = self
                        .find_ids_with(
                            tr,
                            target,
                            &alias,
                            self.with_policy_filter(
                                target,
                                &alias,
                                predicate.clone(),
                                PolicyOperation::Update,
                            )?,
                        )
                        .await?;
                    if existing.is_empty() {
                        let data = item
                            .get("create")
                            .and_then(|d| d.as_object())
                            .context("expected `create`")?;
                        if m2m {
                            let child_ids = self
                                .create_entity(tr, target, data, JsonObject::new())
                                .await?;
                            self.link_m2m(tr, model, field, parent_ids, &child_ids).await?;
                        } else {
                            let preset = self.child_fk_values(model, field, parent_ids)?;
                            self.create_entity(tr, target, data, preset).await?;
                        }
                    } else {
                        let data = item
                            .get("update")
                            .and_then(|d| d.as_object())
                            .context("expected `update`")?;
                        self.update_entity(tr, target, &alias, predicate, data).await?;
                    }
                }
            }
            other => return Err(anyhow!("unknown relation operation `{}`", other).into()),
        }
        Ok(())
    }

    /// The FK values a child row needs to point at its parent.
    fn child_fk_values(
        &self,
        model: &Model,
        field: &'a Field,
        parent_ids: &IdMap,
    ) -> Result<JsonObject> {
        let keys = utils::relation_keys(self.ctx.schema, model, field)?;
        if keys.owned_by_model {
            return Err(anyhow!("child-side FK expected").into());
        }
        let mut out = JsonObject::new();
        for pair in &keys.key_pairs {
            let value = parent_ids
                .get(&pair.pk)
                .cloned()
                .ok_or_else(|| anyhow!("parent id `{}` unavailable", pair.pk))?;
            out.insert(pair.fk.clone(), value);
        }
        Ok(out)
    }

    /// Predicate selecting the children of `parent_ids` through `field`.
    fn child_link_predicate(
        &self,
        model: &'a Model,
        field: &'a Field,
        parent_ids: &IdMap,
        child_alias: &str,
    ) -> Result<SqlExpr> {
        if utils::is_many_to_many(self.ctx.schema, field) {
            let target = self.ctx.schema.relation_model(field).map_err(Error::Internal)?;
            let join = utils::implicit_join_table(self.ctx.schema, model, field)?;
            let parent_id = parent_ids
                .get(&model.id_fields()[0])
                .context("parent id unavailable")?;
            let id_field = model.field_or_err(&model.id_fields()[0])?;
            let ty = id_field.type_.scalar().context("id fields are scalars")?;
            let jt_alias = self.ctx.fresh_alias("jt");
            let mut jt = Select::from_table(&join.table, &jt_alias, None);
            jt.column(SqlExpr::column(&jt_alias, &join.other_fk), None);
            jt.and_where(SqlExpr::binary(
                SqlExpr::column(&jt_alias, &join.parent_fk),
                SqlBinaryOp::Eq,
                SqlExpr::Param(Value::from_json(&ty, parent_id)?),
            ));
            return Ok(SqlExpr::InSelect {
                expr: Box::new(SqlExpr::column(child_alias, &target.id_fields()[0])),
                select: Box::new(jt),
                negated: false,
            });
        }
        let fk_values = self.child_fk_values(model, field, parent_ids)?;
        let target = self.ctx.schema.relation_model(field).map_err(Error::Internal)?;
        let mut out = SqlExpr::Bool(true);
        for (name, json) in &fk_values {
            let field = target.field_or_err(name)?;
            let ty = field.type_.scalar().context("FK fields are scalars")?;
            out = SqlExpr::and(
                out,
                SqlExpr::binary(
                    SqlExpr::column(child_alias, name),
                    SqlBinaryOp::Eq,
                    SqlExpr::Param(Value::from_json(&ty, json)?),
                ),
            );
        }
        Ok(out)
    }

    /// Points an existing child row at the parent (`connect`); a no-op when
    /// already connected.
    async fn attach_child(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        field: &'a Field,
        parent_ids: &IdMap,
        where_: &JsonValue,
    ) -> Result<()> {
        let target = self.ctx.schema.relation_model(field).map_err(Error::Internal)?;
        let fk_values = self.child_fk_values(model, field, parent_ids)?;
        let alias = target.db_table().to_owned();
        let mut predicate = filter::compile_unique_where(self.ctx, target, &alias, where_)
            .map_err(Error::Internal)?;
        predicate = self.with_policy_filter(target, &alias, predicate, PolicyOperation::Update)?;
        let mut sets = vec![];
        for (name, json) in &fk_values {
            let fk_field = target.field_or_err(name)?;
            let ty = fk_field.type_.scalar().context("FK fields are scalars")?;
            sets.push((
                name.clone(),
                SqlExpr::Param(Value::from_json(&ty, json)?),
            ));
        }
        let (where_, _) = self.narrow_mutation(target, &alias, predicate, None)?;
        let update = Update {
            table: target.db_table().to_owned(),
            model: target.name().to_owned(),
            sets,
            where_: Some(where_),
            limit: None,
            returning: vec![],
        };
        let affected = self
            .engine
            .execute(tr, &Statement::Update(update), target.name())
            .await?;
        if affected == 0 {
            return Err(Error::not_found(target.name()));
        }
        Ok(())
    }

    /// Clears the child FK (`disconnect`); with `where_` only the matching
    /// child, otherwise every child of the parent. Disconnecting an
    /// unrelated row is a no-op.
    async fn detach_child(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        field: &'a Field,
        parent_ids: &IdMap,
        where_: Option<&JsonValue>,
    ) -> Result<()> {
        let target = self.ctx.schema.relation_model(field).map_err(Error::Internal)?;
        let alias = target.db_table().to_owned();
        let mut predicate = self.child_link_predicate(model, field, parent_ids, &alias)?;
        if let Some(where_) = where_ {
            let unique = filter::compile_unique_where(self.ctx, target, &alias, where_)
                .map_err(Error::Internal)?;
            predicate = SqlExpr::and(predicate, unique);
        }
        predicate = self.with_policy_filter(target, &alias, predicate, PolicyOperation::Update)?;
        let keys = utils::relation_keys(self.ctx.schema, model, field)?;
        let sets: Vec<(String, SqlExpr)> = keys
            .key_pairs
            .iter()
            .map(|p| (p.fk.clone(), SqlExpr::Null))
            .collect();
        let (where_, _) = self.narrow_mutation(target, &alias, predicate, None)?;
        let update = Update {
            table: target.db_table().to_owned(),
            model: target.name().to_owned(),
            sets,
            where_: Some(where_),
            limit: None,
            returning: vec![],
        };
        self.engine
            .execute(tr, &Statement::Update(update), target.name())
            .await?;
        Ok(())
    }

    /// `set` pre-pass: detach every child whose unique key is not in the
    /// incoming list.
    async fn detach_all_children(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        field: &'a Field,
        parent_ids: &IdMap,
        keep: &[&JsonValue],
    ) -> Result<()> {
        let target = self.ctx.schema.relation_model(field).map_err(Error::Internal)?;
        let alias = target.db_table().to_owned();
        let mut predicate = self.child_link_predicate(model, field, parent_ids, &alias)?;
        for kept in keep {
            let unique = filter::compile_unique_where(self.ctx, target, &alias, kept)
                .map_err(Error::Internal)?;
            predicate = SqlExpr::and(predicate, unique.not());
        }
        let keys = utils::relation_keys(self.ctx.schema, model, field)?;
        let sets: Vec<(String, SqlExpr)> = keys
            .key_pairs
            .iter()
            .map(|p| (p.fk.clone(), SqlExpr::Null))
            .collect();
        let (where_, _) = self.narrow_mutation(target, &alias, predicate, None)?;
        let update = Update {
            table: target.db_table().to_owned(),
            model: target.name().to_owned(),
            sets,
            where_: Some(where_),
            limit: None,
            returning: vec![],
        };
        self.engine
            .execute(tr, &Statement::Update(update), target.name())
            .await?;
        Ok(())
    }

    /// Inserts the join-table row of an implicit many-to-many link;
    /// duplicate links are no-ops.
    async fn link_m2m(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        field: &'a Field,
        parent_ids: &IdMap,
        child_ids: &IdMap,
    ) -> Result<()> {
        let target = self.ctx.schema.relation_model(field).map_err(Error::Internal)?;
        let join = utils::implicit_join_table(self.ctx.schema, model, field)?;
        let parent = id_param(model, parent_ids)?;
        let child = id_param(target, child_ids)?;
        let insert = Insert {
            table: join.table.clone(),
            model: model.name().to_owned(),
            columns: vec![join.parent_fk.clone(), join.other_fk.clone()],
            rows: vec![vec![Some(SqlExpr::Param(parent)), Some(SqlExpr::Param(child))]],
            on_conflict: Some(OnConflict::DoNothing),
            returning: vec![],
        };
        self.engine
            .execute(tr, &Statement::Insert(insert), model.name())
            .await?;
        Ok(())
    }

    /// Removes join-table rows; `child` narrows to one link, `None` clears
    /// all links of the parent.
    async fn unlink_m2m(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        field: &'a Field,
        parent_ids: &IdMap,
        child: Option<&IdMap>,
    ) -> Result<()> {
        let target = self.ctx.schema.relation_model(field).map_err(Error::Internal)?;
        let join = utils::implicit_join_table(self.ctx.schema, model, field)?;
        let parent = id_param(model, parent_ids)?;
        let mut where_ = SqlExpr::binary(
            SqlExpr::column("", &join.parent_fk),
            SqlBinaryOp::Eq,
            SqlExpr::Param(parent),
        );
        if let Some(child) = child {
            let child = id_param(target, child)?;
            where_ = SqlExpr::and(
                where_,
                SqlExpr::binary(
                    SqlExpr::column("", &join.other_fk),
                    SqlBinaryOp::Eq,
                    SqlExpr::Param(child),
                ),
            );
        }
        let delete = Delete {
            table: join.table.clone(),
            model: model.name().to_owned(),
            where_: Some(where_),
            limit: None,
        };
        self.engine
            .execute(tr, &Statement::Delete(delete), model.name())
            .await?;
        Ok(())
    }

    // ---- policy checks ----

    fn with_policy_filter(
        &self,
        model: &Model,
        alias: &str,
        predicate: SqlExpr,
        op: PolicyOperation,
    ) -> Result<SqlExpr> {
        if !self.policies_enabled {
            return Ok(predicate);
        }
        match policy::policy_condition(self.ctx, self.auth, model, alias, op)
            .map_err(Error::Internal)?
        {
            Some(condition) => Ok(SqlExpr::and(predicate, condition)),
            None => Ok(predicate),
        }
    }

    /// `create` policies evaluate against the prospective row in memory
    /// where possible; undecidable expressions re-check after the insert.
    async fn check_create_policy(
        &self,
        _tr: &TransactionStatic,
        model: &Model,
        data: &JsonObject,
        _ids: &IdMap,
    ) -> Result<()> {
        if !self.policies_enabled {
            return Ok(());
        }
        let Some(expr) = policy::combined_policy(model, PolicyOperation::Create) else {
            return Ok(());
        };
        match policy::eval_in_memory(self.auth, &expr, data) {
            Some(true) | None => Ok(()),
            Some(false) => Err(Error::policy(model.name(), "create")),
        }
    }

    /// The in-database half of the create check, for expressions the
    /// in-memory evaluator could not decide.
    async fn check_create_policy_fallback(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        id_map: &IdMap,
    ) -> Result<()> {
        if !self.policies_enabled {
            return Ok(());
        }
        let Some(_) = policy::combined_policy(model, PolicyOperation::Create) else {
            return Ok(());
        };
        self.check_row_against(tr, model, id_map, PolicyOperation::Create, "create")
            .await
    }

    async fn check_post_update(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        id_map: &IdMap,
    ) -> Result<()> {
        if !self.policies_enabled {
            return Ok(());
        }
        if policy::combined_policy(model, PolicyOperation::PostUpdate).is_none() {
            return Ok(());
        }
        // Re-select inside the transaction; some providers cannot observe
        // the updated row in the same statement.
        self.check_row_against(tr, model, id_map, PolicyOperation::PostUpdate, "post-update")
            .await
    }

    /// Post-update check for statements without row identity: any surviving
    /// row that violates the policy aborts the transaction.
    async fn check_post_update_many(&self, tr: &TransactionStatic, model: &'a Model) -> Result<()> {
        if !self.policies_enabled {
            return Ok(());
        }
        let Some(expr) = policy::combined_policy(model, PolicyOperation::PostUpdate) else {
            return Ok(());
        };
        let alias = self.ctx.fresh_alias("m");
        let condition =
            policy::compile_policy_expr(self.ctx, self.auth, model, &alias, &expr)
                .map_err(Error::Internal)?;
        let mut select = Select::from_table(model.db_table(), &alias, None);
        select.column(SqlExpr::Int(1), None);
        select.and_where(condition.not());
        select.limit = Some(1);
        let violating = self
            .engine
            .fetch_optional(tr, &Statement::Select(select), model.name())
            .await?;
        if violating.is_some() {
            return Err(Error::policy(model.name(), "post-update"));
        }
        Ok(())
    }

    async fn check_row_against(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        id_map: &IdMap,
        op: PolicyOperation,
        op_name: &str,
    ) -> Result<()> {
        let alias = self.ctx.fresh_alias("m");
        let mut predicate = self.ids_predicate(model, &alias, id_map)?;
        predicate = self.with_policy_filter(model, &alias, predicate, op)?;
        let mut select = Select::from_table(model.db_table(), &alias, None);
        select.column(SqlExpr::Int(1), None);
        select.and_where(predicate);
        select.limit = Some(1);
        let row = self
            .engine
            .fetch_optional(tr, &Statement::Select(select), model.name())
            .await?;
        if row.is_none() {
            return Err(Error::policy(model.name(), op_name));
        }
        Ok(())
    }

    // ---- shared lookups ----

    async fn find_ids(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        alias: &str,
        predicate: SqlExpr,
        op: PolicyOperation,
    ) -> Result<Vec<IdMap>> {
        let predicate = self.with_policy_filter(model, alias, predicate, op)?;
        self.find_ids_with(tr, model, alias, predicate).await
    }

    async fn find_ids_with(
        &self,
        tr: &TransactionStatic,
        model: &'a Model,
        alias: &str,
        predicate: SqlExpr,
    ) -> Result<Vec<IdMap>> {
        let mut select = Select::from_table(model.db_table(), alias, Some(model.name()));
        let mut columns = vec![];
        for name in model.id_fields() {
            let field = model.field_or_err(name)?;
            let ty = field.type_.scalar().context("id fields are scalars")?;
            select.column(SqlExpr::column(alias, name), Some(name.as_str()));
            columns.push((name.clone(), ColumnKind::Scalar(ty)));
        }
        select.and_where(predicate);
        let rows = self
            .engine
            .fetch_all(tr, &Statement::Select(select), model.name())
            .await?;
        rows.iter()
            .map(|row| self.engine.decode_columns(row, &columns).map_err(Error::Internal))
            .collect()
    }

    /// UPDATE/DELETE with a limit: native LIMIT where supported, an id
    /// subquery elsewhere.
    fn narrow_mutation(
        &self,
        model: &Model,
        alias: &str,
        predicate: SqlExpr,
        limit: Option<u64>,
    ) -> Result<(SqlExpr, Option<u64>)> {
        match limit {
            None => Ok((predicate, None)),
            Some(n) if self.engine.dialect().supports_mutation_limit() => {
                Ok((predicate, Some(n)))
            }
            Some(n) => {
                if model.id_fields().len() != 1 {
                    return Err(anyhow!("limited mutations need a single-column id").into());
                }
                // No native limit: narrow through an id subquery instead.
                let id = &model.id_fields()[0];
                let inner_alias = self.ctx.fresh_alias("l");
                let rewritten = rename_columns(predicate, alias, &inner_alias);
                let mut inner =
                    Select::from_table(model.db_table(), &inner_alias, Some(model.name()));
                inner.column(SqlExpr::column(&inner_alias, id), Some(id.as_str()));
                inner.and_where(rewritten);
                inner.limit = Some(n);
                Ok((
                    SqlExpr::InSelect {
                        expr: Box::new(SqlExpr::column("", id)),
                        select: Box::new(inner),
                        negated: false,
                    },
                    None,
                ))
            }
        }
    }
}

/// Rewrites `from`-qualified column refs to the `to` alias.
fn rename_columns(expr: SqlExpr, from: &str, to: &str) -> SqlExpr {
    match expr {
        SqlExpr::Column { table, name } if table == from => SqlExpr::Column {
            table: to.to_owned(),
            name,
        },
        SqlExpr::Binary { left, op, right } => SqlExpr::Binary {
            left: Box::new(rename_columns(*left, from, to)),
            op,
            right: Box::new(rename_columns(*right, from, to)),
        },
        SqlExpr::Not(inner) => SqlExpr::Not(Box::new(rename_columns(*inner, from, to))),
        SqlExpr::IsNull(inner) => SqlExpr::IsNull(Box::new(rename_columns(*inner, from, to))),
        SqlExpr::IsNotNull(inner) => {
            SqlExpr::IsNotNull(Box::new(rename_columns(*inner, from, to)))
        }
        SqlExpr::Like {
            expr,
            pattern,
            insensitive,
            negated,
        } => SqlExpr::Like {
            expr: Box::new(rename_columns(*expr, from, to)),
            pattern,
            insensitive,
            negated,
        },
        SqlExpr::In {
            expr,
            list,
            negated,
        } => SqlExpr::In {
            expr: Box::new(rename_columns(*expr, from, to)),
            list,
            negated,
        },
        SqlExpr::InSelect {
            expr,
            select,
            negated,
        } => SqlExpr::InSelect {
            expr: Box::new(rename_columns(*expr, from, to)),
            select,
            negated,
        },
        other => other,
    }
}

fn id_param(model: &Model, ids: &IdMap) -> anyhow::Result<Value> {
    anyhow::ensure!(
        model.id_fields().len() == 1,
        "many-to-many requires single-column ids"
    );
    let name = &model.id_fields()[0];
    let field = model.field_or_err(name)?;
    let ty = field.type_.scalar().context("id fields are scalars")?;
    let json = ids
        .get(name)
        .ok_or_else(|| anyhow!("missing id value `{}`", name))?;
    Value::from_json(&ty, json)
}

/// Fills a missing field at insert time: generator tags, literal defaults,
/// `now()` and `@updatedAt` timestamps.
pub fn generated_value(field: &Field) -> anyhow::Result<Option<Value>> {
    if let Some(generator) = field.generator {
        let value = match generator {
            Generator::Cuid => Value::String(cuid::cuid().map_err(|e| anyhow!("cuid: {}", e))?),
            Generator::Cuid2 => Value::String(cuid2::create_id()),
            Generator::Uuid4 => Value::String(uuid::Uuid::new_v4().to_string()),
            Generator::Uuid7 => Value::String(uuid::Uuid::now_v7().to_string()),
            Generator::Nanoid => Value::String(nanoid::nanoid!()),
            // The database assigns it; omit the column.
            Generator::Autoincrement => return Ok(None),
        };
        return Ok(Some(value));
    }
    if field.updated_at {
        return Ok(Some(Value::DateTime(Utc::now())));
    }
    match &field.default {
        Some(DefaultValue::Now) => Ok(Some(Value::DateTime(Utc::now()))),
        Some(DefaultValue::Literal(json)) => {
            let ty = field
                .type_
                .scalar()
                .ok_or_else(|| anyhow!("`{}` has no scalar type", field.name))?;
            Ok(Some(Value::from_json(&ty, json)?))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field as SchemaField;
    use crate::value::ScalarType;

    #[test]
    fn test_generated_values() {
        let field = SchemaField::scalar("id", ScalarType::String).generator(Generator::Uuid4);
        let value = generated_value(&field).unwrap().unwrap();
        let Value::String(s) = value else {
            panic!("expected a string id")
        };
        assert_eq!(s.len(), 36);

        let field = SchemaField::scalar("n", ScalarType::Int).generator(Generator::Autoincrement);
        assert!(generated_value(&field).unwrap().is_none());

        let field = SchemaField::scalar("at", ScalarType::DateTime).default(DefaultValue::Now);
        assert!(matches!(
            generated_value(&field).unwrap(),
            Some(Value::DateTime(_))
        ));

        let field = SchemaField::scalar("count", ScalarType::Int)
            .default(DefaultValue::Literal(serde_json::json!(7)));
        assert_eq!(generated_value(&field).unwrap(), Some(Value::Int(7)));
    }

    #[test]
    fn test_nested_op_order_matches_integrity_rules() {
        // Detach and delete before create and connect; update and upsert
        // close the sequence.
        let pos = |name: &str| {
            NESTED_OP_ORDER
                .iter()
                .position(|o| *o == name)
                .unwrap()
        };
        assert!(pos("disconnect") < pos("set"));
        assert!(pos("set") < pos("delete"));
        assert!(pos("delete") < pos("create"));
        assert!(pos("create") < pos("connect"));
        assert!(pos("connect") < pos("update"));
        assert!(pos("update") < pos("upsert"));
    }

    #[test]
    fn test_rename_columns() {
        let expr = SqlExpr::binary(
            SqlExpr::column("Post", "title"),
            SqlBinaryOp::Eq,
            SqlExpr::param("x"),
        );
        let renamed = rename_columns(expr, "Post", "l0");
        assert_eq!(
            renamed,
            SqlExpr::binary(
                SqlExpr::column("l0", "title"),
                SqlBinaryOp::Eq,
                SqlExpr::param("x"),
            )
        );
    }
}
