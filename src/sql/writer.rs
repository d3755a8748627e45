// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use super::ast::*;
use super::dialect::{Dialect, DialectKind};
use crate::value::Value;
use anyhow::{bail, Result};
use std::fmt::{self, Write as _};

/// An SQL string with placeholders, plus its argument values in bind order.
#[derive(Debug, Clone)]
pub struct CompiledSql {
    pub sql: String,
    pub args: Vec<Value>,
}

/// Helper struct for rendering SQL trees into statements.
pub struct SqlWriter<'a> {
    dialect: &'a dyn Dialect,
    text: String,
    args: Vec<Value>,
}

impl<'a> SqlWriter<'a> {
    pub fn new(dialect: &'a dyn Dialect) -> Self {
        Self {
            dialect,
            text: String::new(),
            args: vec![],
        }
    }

    pub fn compile(dialect: &'a dyn Dialect, statement: &Statement) -> Result<CompiledSql> {
        let mut writer = Self::new(dialect);
        match statement {
            Statement::Select(select) => writer.write_select(select)?,
            Statement::Insert(insert) => writer.write_insert(insert)?,
            Statement::Update(update) => writer.write_update(update)?,
            Statement::Delete(delete) => writer.write_delete(delete)?,
        }
        Ok(writer.build())
    }

    pub fn build(self) -> CompiledSql {
        CompiledSql {
            sql: self.text,
            args: self.args,
        }
    }

    /// Appends the string verbatim into the SQL statement.
    fn write_str(&mut self, x: &str) {
        self.text.push_str(x);
    }

    /// Appends the name as a quoted identifier into the SQL statement.
    fn write_name(&mut self, name: &str) {
        self.text.reserve(2 + name.len());
        self.text.push('"');
        for c in name.chars() {
            if c == '"' {
                self.text.push_str("\"\"");
            } else {
                self.text.push(c);
            }
        }
        self.text.push('"');
    }

    /// Appends a literal string into the SQL statement.
    fn write_literal_str(&mut self, value: &str) -> Result<()> {
        self.text.reserve(2 + value.len());
        self.text.push('\'');
        for c in value.chars() {
            if c == '\'' {
                self.text.push_str("''");
            } else if c == '\0' {
                bail!("cannot insert a NUL byte into a SQL literal string")
            } else {
                self.text.push(c);
            }
        }
        self.text.push('\'');
        Ok(())
    }

    /// Binds a value and appends its placeholder, with the correct syntax
    /// per database (`?n` for SQLite, `$n` for Postgres) and any cast the
    /// dialect wants on it.
    fn write_param(&mut self, value: Value) {
        let cast = self.dialect.param_cast(&value);
        self.args.push(self.dialect.encode_value(value));
        let idx = self.args.len();
        match self.dialect.kind() {
            DialectKind::Sqlite => write!(self, "?{}", idx),
            DialectKind::Postgres => write!(self, "${}", idx),
        }
        if let Some(cast) = cast {
            self.write_str(cast);
        }
    }

    /// This method makes the `write!` macro work with this struct.
    fn write_fmt(&mut self, fmt: fmt::Arguments<'_>) {
        self.text.write_fmt(fmt).expect("formatting failed")
    }

    pub fn write_expr(&mut self, expr: &SqlExpr) -> Result<()> {
        match expr {
            SqlExpr::Column { table, name } => {
                if !table.is_empty() {
                    self.write_name(table);
                    self.write_str(".");
                }
                self.write_name(name);
            }
            SqlExpr::Param(value) => self.write_param(value.clone()),
            SqlExpr::Bool(b) => match self.dialect.kind() {
                DialectKind::Postgres => self.write_str(if *b { "true" } else { "false" }),
                DialectKind::Sqlite => self.write_str(if *b { "1" } else { "0" }),
            },
            SqlExpr::Int(i) => write!(self, "{}", i),
            SqlExpr::Null => self.write_str("NULL"),
            SqlExpr::CountStar => self.write_str("COUNT(*)"),
            SqlExpr::Binary { left, op, right } => {
                self.write_str("(");
                self.write_expr(left)?;
                write!(self, " {} ", op.to_sql_string());
                self.write_expr(right)?;
                self.write_str(")");
            }
            SqlExpr::Not(inner) => {
                self.write_str("(NOT ");
                self.write_expr(inner)?;
                self.write_str(")");
            }
            SqlExpr::IsNull(inner) => {
                self.write_str("(");
                self.write_expr(inner)?;
                self.write_str(" IS NULL)");
            }
            SqlExpr::IsNotNull(inner) => {
                self.write_str("(");
                self.write_expr(inner)?;
                self.write_str(" IS NOT NULL)");
            }
            SqlExpr::Like {
                expr,
                pattern,
                insensitive,
                negated,
            } => {
                self.write_str("(");
                let lower = *insensitive && !self.dialect.supports_ilike();
                if lower {
                    self.write_str("lower(");
                    self.write_expr(expr)?;
                    self.write_str(")");
                } else {
                    self.write_expr(expr)?;
                }
                if *negated {
                    self.write_str(" NOT");
                }
                if *insensitive && self.dialect.supports_ilike() {
                    self.write_str(" ILIKE ");
                } else {
                    self.write_str(" LIKE ");
                }
                if lower {
                    self.write_str("lower(");
                    self.write_expr(pattern)?;
                    self.write_str(")");
                } else {
                    self.write_expr(pattern)?;
                }
                self.write_str(" ESCAPE '\\')");
            }
            SqlExpr::In {
                expr,
                list,
                negated,
            } => {
                // `x IN ()` is not valid SQL; the compiler folds empty lists
                // away, this is the backstop.
                if list.is_empty() {
                    return self.write_expr(&SqlExpr::Bool(*negated));
                }
                self.write_str("(");
                self.write_expr(expr)?;
                self.write_str(if *negated { " NOT IN (" } else { " IN (" });
                for (i, item) in list.iter().enumerate() {
                    if i > 0 {
                        self.write_str(", ");
                    }
                    self.write_expr(item)?;
                }
                self.write_str("))");
            }
            SqlExpr::InSelect {
                expr,
                select,
                negated,
            } => {
                self.write_str("(");
                self.write_expr(expr)?;
                self.write_str(if *negated { " NOT IN (" } else { " IN (" });
                self.write_select(select)?;
                self.write_str("))");
            }
            SqlExpr::Exists(select) => {
                self.write_str("EXISTS (");
                self.write_select(select)?;
                self.write_str(")");
            }
            SqlExpr::Subquery(select) => {
                self.write_str("(");
                self.write_select(select)?;
                self.write_str(")");
            }
            SqlExpr::Fn { name, args } => {
                write!(self, "{}(", name);
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        self.write_str(", ");
                    }
                    self.write_expr(arg)?;
                }
                self.write_str(")");
            }
            SqlExpr::JsonObject(pairs) => {
                match self.dialect.kind() {
                    DialectKind::Postgres => self.write_str("jsonb_build_object("),
                    DialectKind::Sqlite => self.write_str("json_object("),
                }
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        self.write_str(", ");
                    }
                    self.write_literal_str(key)?;
                    self.write_str(", ");
                    self.write_expr(value)?;
                }
                self.write_str(")");
            }
            SqlExpr::JsonAgg(inner) => {
                match self.dialect.kind() {
                    DialectKind::Postgres => {
                        self.write_str("COALESCE(jsonb_agg(");
                        self.write_expr(inner)?;
                        self.write_str("), '[]'::jsonb)");
                    }
                    DialectKind::Sqlite => {
                        self.write_str("COALESCE(json_group_array(");
                        self.write_expr(inner)?;
                        self.write_str("), json_array())");
                    }
                }
            }
            SqlExpr::Tuple(items) => {
                self.write_str("(");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.write_str(", ");
                    }
                    self.write_expr(item)?;
                }
                self.write_str(")");
            }
            SqlExpr::ArrayLiteral(items) => {
                if self.dialect.kind() != DialectKind::Postgres {
                    bail!("array literals are not supported by this database");
                }
                self.write_str("ARRAY[");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.write_str(", ");
                    }
                    self.write_expr(item)?;
                }
                self.write_str("]");
            }
            SqlExpr::Cast { expr, ty } => {
                self.write_str("CAST(");
                self.write_expr(expr)?;
                write!(self, " AS {})", ty);
            }
        }
        Ok(())
    }

    fn write_from_item(&mut self, item: &FromItem) -> Result<()> {
        match item {
            FromItem::Table { name, alias, .. } => {
                self.write_name(name);
                if alias != name {
                    self.write_str(" AS ");
                    self.write_name(alias);
                }
            }
            FromItem::Subquery { select, alias } => {
                self.write_str("(");
                self.write_select(select)?;
                self.write_str(") AS ");
                self.write_name(alias);
            }
        }
        Ok(())
    }

    pub fn write_select(&mut self, select: &Select) -> Result<()> {
        self.write_str("SELECT ");
        match &select.distinct {
            None => {}
            Some(on) if on.is_empty() => self.write_str("DISTINCT "),
            Some(on) => {
                if !self.dialect.supports_distinct_on() {
                    bail!("DISTINCT ON is not supported by this database");
                }
                self.write_str("DISTINCT ON (");
                for (i, col) in on.iter().enumerate() {
                    if i > 0 {
                        self.write_str(", ");
                    }
                    self.write_expr(col)?;
                }
                self.write_str(") ");
            }
        }
        if select.columns.is_empty() {
            self.write_str("*");
        }
        for (i, col) in select.columns.iter().enumerate() {
            if i > 0 {
                self.write_str(", ");
            }
            self.write_expr(&col.expr)?;
            if let Some(alias) = &col.alias {
                self.write_str(" AS ");
                self.write_name(alias);
            }
        }
        self.write_str(" FROM ");
        self.write_from_item(&select.from)?;
        for join in &select.joins {
            match join.kind {
                JoinKind::Inner => self.write_str(" JOIN "),
                JoinKind::Left => self.write_str(" LEFT JOIN "),
            }
            self.write_from_item(&join.from)?;
            self.write_str(" ON ");
            self.write_expr(&join.on)?;
        }
        if let Some(where_) = &select.where_ {
            self.write_str(" WHERE ");
            self.write_expr(where_)?;
        }
        if !select.group_by.is_empty() {
            self.write_str(" GROUP BY ");
            for (i, col) in select.group_by.iter().enumerate() {
                if i > 0 {
                    self.write_str(", ");
                }
                self.write_expr(col)?;
            }
        }
        if let Some(having) = &select.having {
            self.write_str(" HAVING ");
            self.write_expr(having)?;
        }
        if !select.order_by.is_empty() {
            self.write_str(" ORDER BY ");
            for (i, term) in select.order_by.iter().enumerate() {
                if i > 0 {
                    self.write_str(", ");
                }
                self.write_expr(&term.expr)?;
                self.write_str(if term.descending { " DESC" } else { " ASC" });
                match term.nulls {
                    Some(NullsOrder::First) => self.write_str(" NULLS FIRST"),
                    Some(NullsOrder::Last) => self.write_str(" NULLS LAST"),
                    None => {}
                }
            }
        }
        match (select.limit, select.offset) {
            (Some(limit), offset) => {
                write!(self, " LIMIT {}", limit);
                if let Some(offset) = offset {
                    write!(self, " OFFSET {}", offset);
                }
            }
            (None, Some(offset)) => {
                // SQLite rejects a standalone OFFSET.
                if self.dialect.offset_requires_limit() {
                    self.write_str(" LIMIT -1");
                }
                write!(self, " OFFSET {}", offset);
            }
            (None, None) => {}
        }
        Ok(())
    }

    pub fn write_insert(&mut self, insert: &Insert) -> Result<()> {
        self.write_str("INSERT INTO ");
        self.write_name(&insert.table);
        self.write_str(" (");
        for (i, col) in insert.columns.iter().enumerate() {
            if i > 0 {
                self.write_str(", ");
            }
            self.write_name(col);
        }
        self.write_str(") VALUES ");
        for (i, row) in insert.rows.iter().enumerate() {
            if i > 0 {
                self.write_str(", ");
            }
            self.write_str("(");
            for (j, cell) in row.iter().enumerate() {
                if j > 0 {
                    self.write_str(", ");
                }
                match cell {
                    Some(expr) => self.write_expr(expr)?,
                    None => {
                        if self.dialect.kind() == DialectKind::Sqlite {
                            bail!("SQLite has no DEFAULT expression in VALUES");
                        }
                        self.write_str("DEFAULT");
                    }
                }
            }
            self.write_str(")");
        }
        match &insert.on_conflict {
            None => {}
            Some(OnConflict::DoNothing) => self.write_str(" ON CONFLICT DO NOTHING"),
            Some(OnConflict::DoUpdate { target, sets }) => {
                self.write_str(" ON CONFLICT (");
                for (i, col) in target.iter().enumerate() {
                    if i > 0 {
                        self.write_str(", ");
                    }
                    self.write_name(col);
                }
                self.write_str(") DO UPDATE SET ");
                for (i, (col, expr)) in sets.iter().enumerate() {
                    if i > 0 {
                        self.write_str(", ");
                    }
                    self.write_name(col);
                    self.write_str(" = ");
                    self.write_expr(expr)?;
                }
            }
        }
        self.write_returning(&insert.returning);
        Ok(())
    }

    pub fn write_update(&mut self, update: &Update) -> Result<()> {
        self.write_str("UPDATE ");
        self.write_name(&update.table);
        self.write_str(" SET ");
        for (i, (col, expr)) in update.sets.iter().enumerate() {
            if i > 0 {
                self.write_str(", ");
            }
            self.write_name(col);
            self.write_str(" = ");
            self.write_expr(expr)?;
        }
        if let Some(where_) = &update.where_ {
            self.write_str(" WHERE ");
            self.write_expr(where_)?;
        }
        if let Some(limit) = update.limit {
            if !self.dialect.supports_mutation_limit() {
                bail!("UPDATE … LIMIT is not supported by this database");
            }
            write!(self, " LIMIT {}", limit);
        }
        self.write_returning(&update.returning);
        Ok(())
    }

    pub fn write_delete(&mut self, delete: &Delete) -> Result<()> {
        self.write_str("DELETE FROM ");
        self.write_name(&delete.table);
        if let Some(where_) = &delete.where_ {
            self.write_str(" WHERE ");
            self.write_expr(where_)?;
        }
        if let Some(limit) = delete.limit {
            if !self.dialect.supports_mutation_limit() {
                bail!("DELETE … LIMIT is not supported by this database");
            }
            write!(self, " LIMIT {}", limit);
        }
        Ok(())
    }

    fn write_returning(&mut self, returning: &[String]) {
        if returning.is_empty() {
            return;
        }
        self.write_str(" RETURNING ");
        for (i, col) in returning.iter().enumerate() {
            if i > 0 {
                self.write_str(", ");
            }
            self.write_name(col);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{PostgresDialect, SqliteDialect};

    fn select_ids() -> Select {
        let mut select = Select::from_table("User", "User", Some("User"));
        select.column(SqlExpr::column("User", "id"), Some("id"));
        select
    }

    #[test]
    fn test_simple_select() {
        let mut select = select_ids();
        select.and_where(SqlExpr::binary(
            SqlExpr::column("User", "email"),
            SqlBinaryOp::Eq,
            SqlExpr::param("a@b.c"),
        ));
        let sqlite = SqliteDialect;
        let compiled = SqlWriter::compile(&sqlite, &Statement::Select(select.clone())).unwrap();
        assert_eq!(
            compiled.sql,
            r#"SELECT "User"."id" AS "id" FROM "User" WHERE ("User"."email" = ?1)"#
        );
        assert_eq!(compiled.args.len(), 1);

        let pg = PostgresDialect::default();
        let compiled = SqlWriter::compile(&pg, &Statement::Select(select)).unwrap();
        assert_eq!(
            compiled.sql,
            r#"SELECT "User"."id" AS "id" FROM "User" WHERE ("User"."email" = $1)"#
        );
    }

    #[test]
    fn test_offset_without_limit() {
        let mut select = select_ids();
        select.offset = Some(5);
        let sqlite = SqliteDialect;
        let compiled = SqlWriter::compile(&sqlite, &Statement::Select(select.clone())).unwrap();
        assert!(compiled.sql.ends_with("LIMIT -1 OFFSET 5"));

        let pg = PostgresDialect::default();
        let compiled = SqlWriter::compile(&pg, &Statement::Select(select)).unwrap();
        assert!(compiled.sql.ends_with("OFFSET 5"));
        assert!(!compiled.sql.contains("LIMIT"));
    }

    #[test]
    fn test_bool_literals() {
        let mut select = select_ids();
        select.and_where(SqlExpr::Bool(false));
        let sqlite = SqliteDialect;
        let compiled = SqlWriter::compile(&sqlite, &Statement::Select(select.clone())).unwrap();
        assert!(compiled.sql.ends_with("WHERE 0"));
        let pg = PostgresDialect::default();
        let compiled = SqlWriter::compile(&pg, &Statement::Select(select)).unwrap();
        assert!(compiled.sql.ends_with("WHERE false"));
    }

    #[test]
    fn test_distinct_on_unsupported_on_sqlite() {
        let mut select = select_ids();
        select.distinct = Some(vec![SqlExpr::column("User", "email")]);
        let sqlite = SqliteDialect;
        assert!(SqlWriter::compile(&sqlite, &Statement::Select(select.clone())).is_err());
        let pg = PostgresDialect::default();
        let compiled = SqlWriter::compile(&pg, &Statement::Select(select)).unwrap();
        assert!(compiled.sql.starts_with(r#"SELECT DISTINCT ON ("User"."email") "#));
    }

    #[test]
    fn test_insensitive_like() {
        let like = SqlExpr::Like {
            expr: Box::new(SqlExpr::column("User", "name")),
            pattern: Box::new(SqlExpr::param("%ann%")),
            insensitive: true,
            negated: false,
        };
        let mut select = select_ids();
        select.and_where(like);
        let sqlite = SqliteDialect;
        let compiled = SqlWriter::compile(&sqlite, &Statement::Select(select.clone())).unwrap();
        assert!(compiled.sql.contains(r#"lower("User"."name") LIKE lower(?1)"#));
        let pg = PostgresDialect::default();
        let compiled = SqlWriter::compile(&pg, &Statement::Select(select)).unwrap();
        assert!(compiled.sql.contains(r#""User"."name" ILIKE $1"#));
    }

    #[test]
    fn test_insert_multi_row() {
        let insert = Insert {
            table: "Post".into(),
            model: "Post".into(),
            columns: vec!["id".into(), "title".into()],
            rows: vec![
                vec![Some(SqlExpr::param("p1")), Some(SqlExpr::param("t1"))],
                vec![Some(SqlExpr::param("p2")), Some(SqlExpr::param("t2"))],
            ],
            on_conflict: Some(OnConflict::DoNothing),
            returning: vec!["id".into()],
        };
        let sqlite = SqliteDialect;
        let compiled = SqlWriter::compile(&sqlite, &Statement::Insert(insert)).unwrap();
        assert_eq!(
            compiled.sql,
            r#"INSERT INTO "Post" ("id", "title") VALUES (?1, ?2), (?3, ?4) ON CONFLICT DO NOTHING RETURNING "id""#
        );
        assert_eq!(compiled.args.len(), 4);
    }

    #[test]
    fn test_param_casts_on_postgres() {
        use chrono::{TimeZone, Utc};
        let mut select = select_ids();
        select.and_where(SqlExpr::binary(
            SqlExpr::column("User", "createdAt"),
            SqlBinaryOp::Gt,
            SqlExpr::Param(Value::DateTime(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap())),
        ));
        let pg = PostgresDialect::default();
        let compiled = SqlWriter::compile(&pg, &Statement::Select(select)).unwrap();
        assert!(compiled.sql.contains("$1::timestamptz"));
    }
}
