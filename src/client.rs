// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! The client surface: per-model operations, plugins, options, auth
//! context, client-scoped transactions.

use crate::assemble;
use crate::engine::{ExecutionEngine, LogHook, TransactionStatic};
use crate::error::{Error, Result};
use crate::mutation::{IdMap, MutationPlanner};
use crate::policy;
use crate::query::{self, ColumnKind, ComputedFields, ExprSlots, QueryCtx};
use crate::schema::{Model, PolicyOperation, Schema};
use crate::sql::{Select, Statement};
use crate::validate::Validator;
use crate::{JsonObject, Operation};
use anyhow::{anyhow, Context as _};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;

static EMPTY_SLOTS: Lazy<ExprSlots> = Lazy::new(ExprSlots::new);

pub type ProcedureFn =
    Arc<dyn for<'a> Fn(&'a Client, JsonValue) -> BoxFuture<'a, Result<JsonValue>> + Send + Sync>;

/// A plugin observes and may rewrite queries. Hooks run synchronously in
/// registration order; the later plugin wins on conflicting rewrites.
/// Plugins may observe errors but not suppress them.
pub trait Plugin: Send + Sync {
    fn id(&self) -> &str;

    fn before_query(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn after_query(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }
}

pub struct HookContext<'a> {
    pub model: &'a str,
    pub operation: Operation,
    pub args: &'a mut JsonValue,
    /// Present in `after_query` only.
    pub result: Option<&'a mut JsonValue>,
}

/// Recognized client options.
pub struct ClientOptions {
    /// Database URL, handed to the underlying driver.
    pub url: String,
    pub max_connections: u32,
    /// Hook receiving every compiled SQL statement and its parameters.
    pub log: Option<LogHook>,
    /// Per-model callbacks producing expressions for computed fields.
    pub computed_fields: ComputedFields,
    /// Named callbacks callable through [`Client::procedure`].
    pub procedures: HashMap<String, ProcedureFn>,
    /// Plugins registered at connect time, in order; later wins.
    pub plugins: Vec<Arc<dyn Plugin>>,
    pub fix_postgres_timezone: bool,
    /// Disable runtime argument validation when the caller trusts input.
    pub validate_input: bool,
}

impl ClientOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            log: None,
            computed_fields: ComputedFields::new(),
            procedures: HashMap::new(),
            plugins: vec![],
            fix_postgres_timezone: true,
            validate_input: true,
        }
    }
}

struct ClientInner {
    schema: Arc<Schema>,
    engine: ExecutionEngine,
    computed_fields: ComputedFields,
    procedures: HashMap<String, ProcedureFn>,
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
}

/// Options adjustable after connect, per handle.
#[derive(Clone, Copy)]
pub struct RuntimeOptions {
    pub validate_input: bool,
}

/// The ORM client. Cheap to clone; clones share the pool, plugins and
/// schema, while auth context and transaction scope stay per-handle.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    auth: JsonValue,
    tx: Option<TransactionStatic>,
    policies_enabled: bool,
    runtime: RuntimeOptions,
}

impl Client {
    pub async fn connect(schema: Arc<Schema>, options: ClientOptions) -> Result<Self> {
        let mut engine = ExecutionEngine::connect(
            &options.url,
            options.max_connections,
            options.fix_postgres_timezone,
        )
        .await?;
        engine.set_log_hook(options.log.clone());
        let client = Self {
            inner: Arc::new(ClientInner {
                schema,
                engine,
                computed_fields: options.computed_fields,
                procedures: options.procedures,
                plugins: RwLock::new(vec![]),
            }),
            auth: JsonValue::Null,
            tx: None,
            policies_enabled: true,
            runtime: RuntimeOptions {
                validate_input: options.validate_input,
            },
        };
        for plugin in options.plugins {
            client.use_plugin(plugin);
        }
        Ok(client)
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.inner.engine
    }

    /// Sets the authenticated context `auth()` resolves against.
    pub fn set_auth(&mut self, auth: JsonValue) {
        self.auth = auth;
    }

    /// Adjusts runtime options for this handle.
    pub fn set_options(&mut self, options: RuntimeOptions) {
        self.runtime = options;
    }

    /// A handle with a different auth context; shares everything else.
    pub fn with_auth(&self, auth: JsonValue) -> Self {
        let mut clone = self.clone();
        clone.auth = auth;
        clone
    }

    /// A handle that skips policy enforcement entirely, for trusted code
    /// paths (seeding, administration).
    pub fn raw(&self) -> Self {
        let mut clone = self.clone();
        clone.policies_enabled = false;
        clone
    }

    pub fn use_plugin(&self, plugin: Arc<dyn Plugin>) {
        let mut plugins = self.inner.plugins.write();
        // Re-registering replaces; later wins.
        plugins.retain(|p| p.id() != plugin.id());
        plugins.push(plugin);
    }

    pub fn unuse(&self, id: &str) {
        self.inner.plugins.write().retain(|p| p.id() != id);
    }

    pub fn unuse_all(&self) {
        self.inner.plugins.write().clear();
    }

    pub async fn disconnect(&self) {
        self.inner.engine.disconnect().await;
    }

    /// Direct query-builder access, policy-aware.
    pub fn qb(&self) -> QueryBuilder<'_> {
        QueryBuilder {
            client: self,
            policy_aware: true,
        }
    }

    /// Direct query-builder access bypassing policies.
    pub fn qb_raw(&self) -> QueryBuilder<'_> {
        QueryBuilder {
            client: self,
            policy_aware: false,
        }
    }

    /// Invokes a named procedure registered in the options.
    pub async fn procedure(&self, name: &str, args: JsonValue) -> Result<JsonValue> {
        let procedure = self
            .inner
            .procedures
            .get(name)
            .ok_or_else(|| Error::Internal(anyhow!("no procedure named `{}`", name)))?
            .clone();
        procedure(self, args).await
    }

    /// Runs `f` with a transactional client handle; every operation inside
    /// reuses the one transaction. Nested calls reuse the outer
    /// transaction instead of opening a new one.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c Client) -> BoxFuture<'c, Result<T>>,
    {
        if self.tx.is_some() {
            return f(self).await;
        }
        let tx = self.inner.engine.begin_mutation().await?;
        let mut handle = self.clone();
        handle.tx = Some(tx.clone());
        let result = f(&handle).await;
        drop(handle);
        match result {
            Ok(value) => {
                ExecutionEngine::commit(tx).await?;
                Ok(value)
            }
            Err(err) => {
                let _ = ExecutionEngine::rollback(tx).await;
                Err(err)
            }
        }
    }

    pub fn model<'c>(&'c self, name: &str) -> ModelRef<'c> {
        ModelRef {
            client: self,
            name: name.to_owned(),
        }
    }

    fn query_ctx<'c>(&'c self, slots: &'c ExprSlots) -> QueryCtx<'c> {
        QueryCtx::new(
            &self.inner.schema,
            self.inner.engine.dialect(),
            slots,
            &self.inner.computed_fields,
        )
    }

    fn run_before_hooks(
        &self,
        model: &str,
        operation: Operation,
        args: &mut JsonValue,
    ) -> Result<()> {
        for plugin in self.inner.plugins.read().iter() {
            let mut ctx = HookContext {
                model,
                operation,
                args: &mut *args,
                result: None,
            };
            plugin.before_query(&mut ctx)?;
        }
        Ok(())
    }

    fn run_after_hooks(
        &self,
        model: &str,
        operation: Operation,
        args: &mut JsonValue,
        result: &mut JsonValue,
    ) -> Result<()> {
        for plugin in self.inner.plugins.read().iter() {
            let mut ctx = HookContext {
                model,
                operation,
                args: &mut *args,
                result: Some(&mut *result),
            };
            plugin.after_query(&mut ctx)?;
        }
        Ok(())
    }

    /// Dispatches one operation; the single entry point all the per-model
    /// methods funnel through.
    pub async fn execute_operation(
        &self,
        model_name: &str,
        operation: Operation,
        args: JsonValue,
        slots: &ExprSlots,
    ) -> Result<JsonValue> {
        let model = self
            .inner
            .schema
            .model(model_name)
            .map_err(Error::Internal)?;
        let mut args = args;
        self.run_before_hooks(model_name, operation, &mut args)?;
        if self.runtime.validate_input {
            Validator::new(&self.inner.schema, operation).validate(model, &args)?;
        }
        let mut result = if operation.is_write() {
            self.run_write(model, operation, &args, slots).await?
        } else {
            self.run_read(model, operation, &args, slots).await?
        };
        self.run_after_hooks(model_name, operation, &mut args, &mut result)?;
        Ok(result)
    }

    /// Opens the transaction scope for one call: the handle's transaction
    /// when inside `transaction()`, a fresh one otherwise.
    async fn call_tx(&self, mutation: bool) -> Result<(TransactionStatic, bool)> {
        if let Some(tx) = &self.tx {
            return Ok((tx.clone(), false));
        }
        let tx = if mutation {
            self.inner.engine.begin_mutation().await?
        } else {
            self.inner.engine.begin().await?
        };
        Ok((tx, true))
    }

    async fn finish_tx(
        &self,
        tx: TransactionStatic,
        owned: bool,
        result: Result<JsonValue>,
    ) -> Result<JsonValue> {
        if !owned {
            return result;
        }
        match result {
            Ok(value) => {
                ExecutionEngine::commit(tx).await?;
                Ok(value)
            }
            Err(err) => {
                let _ = ExecutionEngine::rollback(tx).await;
                Err(err)
            }
        }
    }

    async fn run_read(
        &self,
        model: &Model,
        operation: Operation,
        args: &JsonValue,
        slots: &ExprSlots,
    ) -> Result<JsonValue> {
        let (tx, owned) = self.call_tx(false).await?;
        let result = self.read_in_tx(&tx, model, operation, args, slots).await;
        self.finish_tx(tx, owned, result).await
    }

    async fn read_in_tx(
        &self,
        tx: &TransactionStatic,
        model: &Model,
        operation: Operation,
        args: &JsonValue,
        slots: &ExprSlots,
    ) -> Result<JsonValue> {
        let ctx = self.query_ctx(slots);
        let engine = &self.inner.engine;
        match operation {
            Operation::Count => {
                let mut select =
                    query::compile_count(&ctx, model, args).map_err(Error::Internal)?;
                self.apply_read_policies(&ctx, &mut select)?;
                let row = engine
                    .fetch_optional(tx, &Statement::Select(select), model.name())
                    .await?
                    .context("COUNT returned no row")?;
                let count = engine.decode_count(&row, "_count").map_err(Error::Internal)?;
                Ok(json!(count))
            }
            Operation::Aggregate => {
                let (mut select, shapes) =
                    query::compile_aggregate(&ctx, model, args).map_err(Error::Internal)?;
                self.apply_read_policies(&ctx, &mut select)?;
                let columns: Vec<(String, ColumnKind)> = shapes
                    .iter()
                    .map(|s| (s.alias.clone(), ColumnKind::Scalar(s.ty.clone())))
                    .collect();
                let row = engine
                    .fetch_optional(tx, &Statement::Select(select), model.name())
                    .await?
                    .context("aggregate returned no row")?;
                let raw = engine.decode_columns(&row, &columns).map_err(Error::Internal)?;
                assemble::nest_aggregate_row(engine.dialect(), &shapes, &raw)
                    .map_err(Error::Internal)
            }
            Operation::GroupBy => {
                let (mut select, shapes) =
                    query::compile_group_by(&ctx, model, args).map_err(Error::Internal)?;
                self.apply_read_policies(&ctx, &mut select)?;
                let columns: Vec<(String, ColumnKind)> = shapes
                    .iter()
                    .map(|s| (s.alias.clone(), ColumnKind::Scalar(s.ty.clone())))
                    .collect();
                let rows = engine
                    .fetch_all(tx, &Statement::Select(select), model.name())
                    .await?;
                let mut out = vec![];
                for row in &rows {
                    let raw = engine.decode_columns(row, &columns).map_err(Error::Internal)?;
                    out.push(
                        assemble::nest_aggregate_row(engine.dialect(), &shapes, &raw)
                            .map_err(Error::Internal)?,
                    );
                }
                Ok(JsonValue::Array(out))
            }
            Operation::FindMany => {
                let rows = self.fetch_entities(tx, &ctx, model, args, false).await?;
                Ok(JsonValue::Array(rows))
            }
            Operation::FindUnique
            | Operation::FindUniqueOrThrow
            | Operation::FindFirst
            | Operation::FindFirstOrThrow => {
                let rows = self.fetch_entities(tx, &ctx, model, args, true).await?;
                match rows.into_iter().next() {
                    Some(row) => Ok(row),
                    None
                        if matches!(
                            operation,
                            Operation::FindUniqueOrThrow | Operation::FindFirstOrThrow
                        ) =>
                    {
                        Err(Error::not_found(model.name()))
                    }
                    None => Ok(JsonValue::Null),
                }
            }
            other => Err(Error::Internal(anyhow!(
                "`{}` is not a read operation",
                other.name()
            ))),
        }
    }

    async fn fetch_entities(
        &self,
        tx: &TransactionStatic,
        ctx: &QueryCtx<'_>,
        model: &Model,
        args: &JsonValue,
        single: bool,
    ) -> Result<Vec<JsonValue>> {
        let query::ReadQuery { mut select, shape } =
            query::compile_find(ctx, model, args, single).map_err(Error::Internal)?;
        self.apply_read_policies(ctx, &mut select)?;
        let engine = &self.inner.engine;
        let rows = engine
            .fetch_all(tx, &Statement::Select(select), model.name())
            .await?;
        let mut out = vec![];
        for row in &rows {
            let raw = engine.row_to_raw(row, &shape).map_err(Error::Internal)?;
            out.push(
                assemble::assemble_row(engine.dialect(), &shape, &raw)
                    .map_err(Error::Internal)?,
            );
        }
        Ok(out)
    }

    fn apply_read_policies(&self, ctx: &QueryCtx<'_>, select: &mut Select) -> Result<()> {
        if !self.policies_enabled {
            return Ok(());
        }
        policy::apply_policies(ctx, &self.auth, select, PolicyOperation::Read)
            .map_err(Error::Internal)
    }

    async fn run_write(
        &self,
        model: &Model,
        operation: Operation,
        args: &JsonValue,
        slots: &ExprSlots,
    ) -> Result<JsonValue> {
        let (tx, owned) = self.call_tx(true).await?;
        let result = self.write_in_tx(&tx, model, operation, args, slots).await;
        self.finish_tx(tx, owned, result).await
    }

    async fn write_in_tx(
        &self,
        tx: &TransactionStatic,
        model: &Model,
        operation: Operation,
        args: &JsonValue,
        slots: &ExprSlots,
    ) -> Result<JsonValue> {
        let ctx = self.query_ctx(slots);
        let planner = MutationPlanner {
            ctx: &ctx,
            engine: &self.inner.engine,
            auth: &self.auth,
            policies_enabled: self.policies_enabled,
        };
        match operation {
            Operation::Create => {
                let data = args.get("data").context("`data` is required")?;
                let ids = planner.create(tx, model, data).await?;
                self.read_back(tx, model, args, &ids, slots).await
            }
            Operation::CreateMany => {
                let data = args.get("data").context("`data` is required")?;
                let skip = args
                    .get("skipDuplicates")
                    .and_then(|s| s.as_bool())
                    .unwrap_or(false);
                let (count, _) = planner.create_many(tx, model, data, skip).await?;
                Ok(json!({ "count": count }))
            }
            Operation::CreateManyAndReturn => {
                let data = args.get("data").context("`data` is required")?;
                let skip = args
                    .get("skipDuplicates")
                    .and_then(|s| s.as_bool())
                    .unwrap_or(false);
                let (_, ids) = planner.create_many(tx, model, data, skip).await?;
                let mut out = vec![];
                for id_map in &ids {
                    out.push(self.read_back(tx, model, args, id_map, slots).await?);
                }
                Ok(JsonValue::Array(out))
            }
            Operation::Update => {
                let where_ = args.get("where").context("`where` is required")?;
                let data = args.get("data").context("`data` is required")?;
                let ids = planner.update(tx, model, where_, data).await?;
                self.read_back(tx, model, args, &ids, slots).await
            }
            Operation::UpdateMany => {
                let count = planner.update_many(tx, model, args).await?;
                Ok(json!({ "count": count }))
            }
            Operation::Upsert => {
                let ids = planner.upsert(tx, model, args).await?;
                self.read_back(tx, model, args, &ids, slots).await
            }
            Operation::Delete => {
                let where_ = args.get("where").context("`where` is required")?;
                // Capture the row before it goes away.
                let mut read_args = JsonObject::new();
                read_args.insert("where".to_owned(), where_.clone());
                for key in ["select", "include", "omit"] {
                    if let Some(v) = args.get(key) {
                        read_args.insert(key.to_owned(), v.clone());
                    }
                }
                let snapshot = self
                    .fetch_entities(tx, &ctx, model, &JsonValue::Object(read_args), true)
                    .await?
                    .into_iter()
                    .next();
                planner.delete(tx, model, where_).await?;
                snapshot.ok_or_else(|| Error::not_found(model.name()))
            }
            Operation::DeleteMany => {
                let count = planner.delete_many(tx, model, args).await?;
                Ok(json!({ "count": count }))
            }
            other => Err(Error::Internal(anyhow!(
                "`{}` is not a write operation",
                other.name()
            ))),
        }
    }

    /// Post-mutation read-back through the regular read path, inside the
    /// same transaction, filtered to the mutated row.
    async fn read_back(
        &self,
        tx: &TransactionStatic,
        model: &Model,
        args: &JsonValue,
        ids: &IdMap,
        slots: &ExprSlots,
    ) -> Result<JsonValue> {
        let ctx = self.query_ctx(slots);
        let mut read_args = JsonObject::new();
        read_args.insert("where".to_owned(), JsonValue::Object(ids.clone()));
        for key in ["select", "include", "omit"] {
            if let Some(v) = args.get(key) {
                read_args.insert(key.to_owned(), v.clone());
            }
        }
        let row = self
            .fetch_entities(tx, &ctx, model, &JsonValue::Object(read_args), true)
            .await?
            .into_iter()
            .next();
        row.ok_or_else(|| Error::not_found(model.name()))
    }
}

/// Handle for one model's operations.
pub struct ModelRef<'c> {
    client: &'c Client,
    name: String,
}

macro_rules! model_op {
    ($method:ident, $variant:ident) => {
        pub async fn $method(&self, args: JsonValue) -> Result<JsonValue> {
            self.client
                .execute_operation(&self.name, Operation::$variant, args, &EMPTY_SLOTS)
                .await
        }
    };
}

impl ModelRef<'_> {
    model_op!(find_many, FindMany);
    model_op!(find_unique, FindUnique);
    model_op!(find_unique_or_throw, FindUniqueOrThrow);
    model_op!(find_first, FindFirst);
    model_op!(find_first_or_throw, FindFirstOrThrow);
    model_op!(create, Create);
    model_op!(create_many, CreateMany);
    model_op!(create_many_and_return, CreateManyAndReturn);
    model_op!(update, Update);
    model_op!(update_many, UpdateMany);
    model_op!(upsert, Upsert);
    model_op!(delete, Delete);
    model_op!(delete_many, DeleteMany);
    model_op!(count, Count);
    model_op!(aggregate, Aggregate);
    model_op!(group_by, GroupBy);

    /// `find_many` with registered `$expr` predicate callbacks.
    pub async fn find_many_with(&self, args: JsonValue, slots: &ExprSlots) -> Result<JsonValue> {
        self.client
            .execute_operation(&self.name, Operation::FindMany, args, slots)
            .await
    }
}

/// Direct access to the query-builder layer: executes caller-built SQL
/// trees, policy-aware or raw.
pub struct QueryBuilder<'c> {
    client: &'c Client,
    policy_aware: bool,
}

impl QueryBuilder<'_> {
    pub async fn select(
        &self,
        mut select: Select,
        columns: &[(String, ColumnKind)],
    ) -> Result<Vec<JsonObject>> {
        let slots = &*EMPTY_SLOTS;
        let ctx = self.client.query_ctx(slots);
        if self.policy_aware {
            policy::apply_policies(
                &ctx,
                &self.client.auth,
                &mut select,
                PolicyOperation::Read,
            )
            .map_err(Error::Internal)?;
        }
        let (tx, owned) = self.client.call_tx(false).await?;
        let engine = &self.client.inner.engine;
        let result = engine
            .fetch_all(&tx, &Statement::Select(select), "$qb")
            .await;
        let rows = match result {
            Ok(rows) => rows,
            Err(err) => {
                if owned {
                    let _ = ExecutionEngine::rollback(tx).await;
                }
                return Err(err);
            }
        };
        let mut out = vec![];
        for row in &rows {
            out.push(engine.decode_columns(row, columns).map_err(Error::Internal)?);
        }
        if owned {
            ExecutionEngine::commit(tx).await?;
        }
        Ok(out)
    }
}
