// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! Statement execution: connection pool, transactions, row decoding.

use crate::error::{self, Error};
use crate::query::{ColumnKind, EntityShape};
use crate::schema::{utils, Model, Schema};
use crate::sql::{
    CompiledSql, Dialect, DialectKind, PostgresDialect, SqlWriter, SqliteDialect, Statement,
};
use crate::value::{ScalarType, Value};
use crate::JsonObject;
use anyhow::{anyhow, Context as _, Result};
use async_lock::Mutex;
use serde_json::json;
use sqlx::any::{Any, AnyArguments, AnyPool, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Executor, Row, ValueRef};
use std::sync::Arc;

/// A transaction shared across one logical call tree.
pub type TransactionStatic = Arc<Mutex<sqlx::Transaction<'static, Any>>>;

pub type LogHook = Arc<dyn Fn(&str, &[Value]) + Send + Sync>;

/// The execution engine: owns the pool and the dialect, renders SQL trees
/// and runs them. Compilation lives elsewhere; this is the only component
/// that talks to the database.
#[derive(Clone)]
pub struct ExecutionEngine {
    pool: AnyPool,
    dialect: Arc<dyn Dialect>,
    log_hook: Option<LogHook>,
}

impl ExecutionEngine {
    /// Connects to `url` (`postgres://…` or `sqlite://…`).
    pub async fn connect(url: &str, max_connections: u32, fix_timezone: bool) -> Result<Self> {
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .with_context(|| format!("failed to connect to `{}`", url))?;
        let dialect: Arc<dyn Dialect> = if url.starts_with("postgres") {
            Arc::new(PostgresDialect {
                fix_timezone,
            })
        } else {
            Arc::new(SqliteDialect)
        };
        Ok(Self {
            pool,
            dialect,
            log_hook: None,
        })
    }

    pub fn set_log_hook(&mut self, hook: Option<LogHook>) {
        self.log_hook = hook;
    }

    pub fn dialect(&self) -> &dyn Dialect {
        &*self.dialect
    }

    pub fn dialect_arc(&self) -> Arc<dyn Dialect> {
        self.dialect.clone()
    }

    pub async fn disconnect(&self) {
        self.pool.close().await;
    }

    pub async fn begin(&self) -> Result<TransactionStatic> {
        Ok(Arc::new(Mutex::new(self.pool.begin().await?)))
    }

    /// Opens the transaction a mutation tree runs in, at the strongest
    /// practical isolation the provider offers.
    pub async fn begin_mutation(&self) -> Result<TransactionStatic> {
        let mut tr = self.pool.begin().await?;
        if self.dialect.kind() == DialectKind::Postgres {
            tr.execute("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
                .await?;
        }
        Ok(Arc::new(Mutex::new(tr)))
    }

    pub async fn commit(transaction: TransactionStatic) -> Result<()> {
        let transaction = Arc::try_unwrap(transaction)
            .map_err(|_| anyhow!("transaction still has references held"))?;
        transaction.into_inner().commit().await?;
        Ok(())
    }

    pub async fn rollback(transaction: TransactionStatic) -> Result<()> {
        let transaction = Arc::try_unwrap(transaction)
            .map_err(|_| anyhow!("transaction still has references held"))?;
        transaction.into_inner().rollback().await?;
        Ok(())
    }

    pub fn compile(&self, statement: &Statement) -> Result<CompiledSql> {
        SqlWriter::compile(&*self.dialect, statement)
    }

    fn log(&self, compiled: &CompiledSql) {
        log::debug!("sql: {} (args: {:?})", compiled.sql, compiled.args);
        if let Some(hook) = &self.log_hook {
            hook(&compiled.sql, &compiled.args);
        }
    }

    fn bind<'q>(
        query: Query<'q, Any, AnyArguments<'q>>,
        args: &'q [Value],
    ) -> Query<'q, Any, AnyArguments<'q>> {
        let mut query = query;
        for arg in args {
            query = match arg {
                Value::Bool(b) => query.bind(*b),
                Value::Int(i) | Value::BigInt(i) => query.bind(*i),
                Value::Float(f) => query.bind(*f),
                Value::String(s) | Value::Enum(s) => query.bind(s.as_str()),
                // The writer renders nulls and encodes the rest to the
                // variants above before they reach the bind loop.
                other => query.bind(other.to_json().to_string()),
            };
        }
        query
    }

    /// Runs a statement for its side effects, returning the affected-row
    /// count.
    pub async fn execute(
        &self,
        tr: &TransactionStatic,
        statement: &Statement,
        model: &str,
    ) -> crate::error::Result<u64> {
        let compiled = self.compile(statement).map_err(Error::Internal)?;
        self.log(&compiled);
        let query = Self::bind(sqlx::query(&compiled.sql), &compiled.args);
        let mut tr = tr.lock().await;
        let result = tr
            .execute(query)
            .await
            .map_err(|e| error::from_sqlx(e, model, Some(&compiled.sql)))?;
        Ok(result.rows_affected())
    }

    pub async fn fetch_all(
        &self,
        tr: &TransactionStatic,
        statement: &Statement,
        model: &str,
    ) -> crate::error::Result<Vec<AnyRow>> {
        let compiled = self.compile(statement).map_err(Error::Internal)?;
        self.log(&compiled);
        let query = Self::bind(sqlx::query(&compiled.sql), &compiled.args);
        let mut tr = tr.lock().await;
        tr.fetch_all(query)
            .await
            .map_err(|e| error::from_sqlx(e, model, Some(&compiled.sql)))
    }

    pub async fn fetch_optional(
        &self,
        tr: &TransactionStatic,
        statement: &Statement,
        model: &str,
    ) -> crate::error::Result<Option<AnyRow>> {
        let compiled = self.compile(statement).map_err(Error::Internal)?;
        self.log(&compiled);
        let query = Self::bind(sqlx::query(&compiled.sql), &compiled.args);
        let mut tr = tr.lock().await;
        tr.fetch_optional(query)
            .await
            .map_err(|e| error::from_sqlx(e, model, Some(&compiled.sql)))
    }

    /// Decodes a row into raw column values keyed by alias, following the
    /// shape's column list.
    pub fn row_to_raw(&self, row: &AnyRow, shape: &EntityShape) -> Result<JsonObject> {
        let columns = shape.columns();
        self.decode_columns(row, &columns)
    }

    pub fn decode_columns(
        &self,
        row: &AnyRow,
        columns: &[(String, ColumnKind)],
    ) -> Result<JsonObject> {
        let mut out = JsonObject::new();
        for (alias, kind) in columns {
            let value = self.decode_column(row, alias, kind)?;
            out.insert(alias.clone(), value);
        }
        Ok(out)
    }

    fn decode_column(
        &self,
        row: &AnyRow,
        alias: &str,
        kind: &ColumnKind,
    ) -> Result<serde_json::Value> {
        let raw = row
            .try_get_raw(alias)
            .with_context(|| format!("row has no column `{}`", alias))?;
        if raw.is_null() {
            return Ok(serde_json::Value::Null);
        }
        let value = match kind {
            ColumnKind::Json => {
                let text: String = row.try_get(alias)?;
                json!(text)
            }
            ColumnKind::Scalar(ty) => match ty {
                ScalarType::Int | ScalarType::BigInt => {
                    let v: i64 = row.try_get(alias)?;
                    json!(v)
                }
                ScalarType::Float => {
                    // Type info is sometimes missing on computed columns.
                    let v: f64 = row.get_unchecked(alias);
                    json!(v)
                }
                ScalarType::Boolean => match self.dialect.kind() {
                    DialectKind::Postgres => {
                        let v: bool = row.try_get(alias)?;
                        json!(v)
                    }
                    DialectKind::Sqlite => {
                        let v: i64 = row.get_unchecked(alias);
                        json!(v)
                    }
                },
                ScalarType::Decimal => {
                    // Stored as text on SQLite, cast to text on Postgres.
                    let v: String = row.try_get(alias)?;
                    json!(v)
                }
                _ => {
                    let v: String = row.try_get(alias)?;
                    json!(v)
                }
            },
        };
        Ok(value)
    }

    /// Reads a single aliased i64 column (counts).
    pub fn decode_count(&self, row: &AnyRow, alias: &str) -> Result<i64> {
        Ok(row.try_get::<i64, _>(alias)?)
    }

    /// Creates the backing table for `model`. Test scaffolding; schema
    /// migration proper is out of scope.
    pub async fn create_table(&self, tr: &TransactionStatic, model: &Model) -> Result<()> {
        let mut sql = format!("CREATE TABLE IF NOT EXISTS \"{}\" (", model.db_table());
        let mut first = true;
        for field in model.scalar_fields() {
            if !first {
                sql.push_str(", ");
            }
            first = false;
            let ty = field.type_.scalar().expect("scalar field");
            sql.push_str(&format!("\"{}\" {}", field.name, self.dialect.column_type(&ty)));
            if !field.optional {
                sql.push_str(" NOT NULL");
            }
            if field.unique && !field.is_id {
                sql.push_str(" UNIQUE");
            }
        }
        if !model.id_fields().is_empty() {
            let cols: Vec<String> = model
                .id_fields()
                .iter()
                .map(|f| format!("\"{}\"", f))
                .collect();
            sql.push_str(&format!(", PRIMARY KEY ({})", cols.join(", ")));
        }
        for set in model.unique_sets() {
            let cols: Vec<String> = set.iter().map(|f| format!("\"{}\"", f)).collect();
            sql.push_str(&format!(", UNIQUE ({})", cols.join(", ")));
        }
        sql.push(')');
        log::debug!("ddl: {}", sql);
        let mut tr = tr.lock().await;
        tr.execute(sqlx::query(&sql)).await?;
        Ok(())
    }

    /// Creates every model table plus the implicit many-to-many join
    /// tables of `schema`.
    pub async fn create_tables(&self, tr: &TransactionStatic, schema: &Schema) -> Result<()> {
        for model in schema.models() {
            self.create_table(tr, model).await?;
        }
        let mut created = std::collections::HashSet::new();
        for model in schema.models() {
            for field in model.relation_fields() {
                if !utils::is_many_to_many(schema, field) {
                    continue;
                }
                let join = utils::implicit_join_table(schema, model, field)?;
                if !created.insert(join.table.clone()) {
                    continue;
                }
                let sql = format!(
                    "CREATE TABLE IF NOT EXISTS \"{}\" (\"A\" TEXT NOT NULL, \"B\" TEXT NOT NULL, UNIQUE (\"A\", \"B\"))",
                    join.table
                );
                log::debug!("ddl: {}", sql);
                let mut guard = tr.lock().await;
                guard.execute(sqlx::query(&sql)).await?;
            }
        }
        Ok(())
    }
}
