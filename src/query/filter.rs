// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! Compilation of `where` trees into SQL predicates.

use super::{ExprContext, QueryCtx};
use crate::schema::{utils, Field, FieldType, Model};
use crate::sql::{FromItem, Join, JoinKind, Select, SqlBinaryOp, SqlExpr};
use crate::value::{ScalarType, Value};
use anyhow::{anyhow, bail, ensure, Context as _, Result};
use serde_json::Value as JsonValue;

/// Alias under which the delegate base table of `alias` is joined.
pub fn base_alias(alias: &str, base_name: &str) -> String {
    format!("{}${}", alias, base_name)
}

/// Resolves `field_name` on `model` (looking through the delegate base
/// chain) to a column reference under `alias`.
pub fn column_for<'a>(
    ctx: &QueryCtx<'a>,
    model: &'a Model,
    alias: &str,
    field_name: &str,
) -> Result<(SqlExpr, &'a Field)> {
    let (owner, field) = ctx.resolve_field(model, field_name)?;
    ensure!(
        !field.is_relation(),
        "`{}.{}` is a relation, not a column",
        model.name(),
        field_name
    );
    let table = if owner.name() == model.name() {
        alias.to_owned()
    } else {
        base_alias(alias, owner.name())
    };
    Ok((SqlExpr::column(table, &field.name), field))
}

/// The FROM item for `model` under `alias`, with LEFT JOINs for its delegate
/// base chain so base fields are addressable.
pub fn from_with_base(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
) -> Result<(FromItem, Vec<Join>)> {
    let from = FromItem::Table {
        name: model.db_table().to_owned(),
        alias: alias.to_owned(),
        model: Some(model.name().to_owned()),
    };
    let mut joins = vec![];
    let mut prev_alias = alias.to_owned();
    for base in utils::base_chain(ctx.schema, model)? {
        let b_alias = base_alias(alias, base.name());
        let mut on = SqlExpr::Bool(true);
        for id in model.id_fields() {
            on = SqlExpr::and(
                on,
                SqlExpr::binary(
                    SqlExpr::column(&prev_alias, id),
                    SqlBinaryOp::Eq,
                    SqlExpr::column(&b_alias, id),
                ),
            );
        }
        joins.push(Join {
            kind: JoinKind::Left,
            from: FromItem::Table {
                name: base.db_table().to_owned(),
                alias: b_alias.clone(),
                model: Some(base.name().to_owned()),
            },
            on,
        });
        prev_alias = b_alias;
    }
    Ok((from, joins))
}

/// Compiles a `where` object into a predicate over `alias`.
pub fn compile_where(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
    where_: &JsonValue,
) -> Result<SqlExpr> {
    if where_.is_null() {
        return Ok(SqlExpr::Bool(true));
    }
    let map = where_
        .as_object()
        .context("`where` must be an object")?;
    let mut out = SqlExpr::Bool(true);
    for (key, value) in map {
        let clause = match key.as_str() {
            "AND" => combine(ctx, model, alias, value, true)?,
            "OR" => combine(ctx, model, alias, value, false)?,
            "NOT" => combine(ctx, model, alias, value, true)?.not(),
            "$expr" => {
                let name = value.as_str().context("`$expr` must name a predicate")?;
                let slot = ctx
                    .expr_slots
                    .get(name)
                    .ok_or_else(|| anyhow!("no registered predicate named `{}`", name))?;
                slot(&ExprContext { table_alias: alias })
            }
            field_name => {
                let (_, field) = ctx.resolve_field(model, field_name)?;
                if field.is_relation() {
                    compile_relation_filter(ctx, model, alias, field, value)?
                } else {
                    let (column, field) = column_for(ctx, model, alias, field_name)?;
                    compile_scalar_filter(ctx, column, field, value)?
                }
            }
        };
        out = SqlExpr::and(out, clause);
    }
    Ok(out)
}

fn combine(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
    value: &JsonValue,
    conjunctive: bool,
) -> Result<SqlExpr> {
    let items: Vec<&JsonValue> = match value {
        JsonValue::Array(items) => items.iter().collect(),
        single => vec![single],
    };
    let mut out = SqlExpr::Bool(conjunctive);
    for item in items {
        let clause = compile_where(ctx, model, alias, item)?;
        out = if conjunctive {
            SqlExpr::and(out, clause)
        } else {
            SqlExpr::or(out, clause)
        };
    }
    Ok(out)
}

fn scalar_value(field: &Field, json: &JsonValue) -> Result<Value> {
    let ty = field
        .type_
        .scalar()
        .ok_or_else(|| anyhow!("`{}` has no scalar type", field.name))?;
    Value::from_json(&ty, json)
}

fn compile_scalar_filter(
    ctx: &QueryCtx<'_>,
    column: SqlExpr,
    field: &Field,
    filter: &JsonValue,
) -> Result<SqlExpr> {
    let JsonValue::Object(map) = filter else {
        // A literal is an implicit equals.
        return compile_equals(column, field, filter);
    };
    // Json-typed fields compare whole documents.
    if matches!(field.type_.scalar(), Some(ScalarType::Json)) && !looks_like_filter(map) {
        return compile_equals(column, field, filter);
    }

    let insensitive = map.get("mode").and_then(|m| m.as_str()) == Some("insensitive");
    let mut out = SqlExpr::Bool(true);
    for (op, value) in map {
        let clause = match op.as_str() {
            "equals" => compile_equals(column.clone(), field, value)?,
            "not" => {
                if value.is_null() {
                    SqlExpr::IsNotNull(Box::new(column.clone()))
                } else {
                    compile_scalar_filter(ctx, column.clone(), field, value)?.not()
                }
            }
            "in" | "notIn" => {
                let items = value.as_array().context("expected an array")?;
                let negated = op == "notIn";
                // `in: []` is constant FALSE, `notIn: []` constant TRUE.
                if items.is_empty() {
                    SqlExpr::Bool(negated)
                } else {
                    let list = items
                        .iter()
                        .map(|item| Ok(SqlExpr::Param(scalar_value(field, item)?)))
                        .collect::<Result<Vec<_>>>()?;
                    SqlExpr::In {
                        expr: Box::new(column.clone()),
                        list,
                        negated,
                    }
                }
            }
            "lt" | "lte" | "gt" | "gte" => {
                let op = match op.as_str() {
                    "lt" => SqlBinaryOp::Lt,
                    "lte" => SqlBinaryOp::LtEq,
                    "gt" => SqlBinaryOp::Gt,
                    _ => SqlBinaryOp::GtEq,
                };
                SqlExpr::binary(
                    column.clone(),
                    op,
                    SqlExpr::Param(scalar_value(field, value)?),
                )
            }
            "contains" | "startsWith" | "endsWith" => {
                let needle = value.as_str().context("expected a string")?;
                let pattern = match op.as_str() {
                    "contains" => format!("%{}%", escape_like(needle)),
                    "startsWith" => format!("{}%", escape_like(needle)),
                    _ => format!("%{}", escape_like(needle)),
                };
                SqlExpr::Like {
                    expr: Box::new(column.clone()),
                    pattern: Box::new(SqlExpr::param(pattern)),
                    insensitive,
                    negated: false,
                }
            }
            "mode" => continue,
            "has" | "hasEvery" | "hasSome" | "isEmpty" => {
                compile_array_filter(ctx, column.clone(), field, op, value)?
            }
            other => bail!("unknown filter operator `{}`", other),
        };
        out = SqlExpr::and(out, clause);
    }
    Ok(out)
}

fn looks_like_filter(map: &serde_json::Map<String, JsonValue>) -> bool {
    map.keys().all(|k| {
        matches!(
            k.as_str(),
            "equals" | "not" | "in" | "notIn" | "lt" | "lte" | "gt" | "gte"
        )
    }) && !map.is_empty()
}

fn compile_equals(column: SqlExpr, field: &Field, value: &JsonValue) -> Result<SqlExpr> {
    if value.is_null() {
        return Ok(SqlExpr::IsNull(Box::new(column)));
    }
    Ok(SqlExpr::binary(
        column,
        SqlBinaryOp::Eq,
        SqlExpr::Param(scalar_value(field, value)?),
    ))
}

/// Scalar-list filters; Postgres arrays only.
fn compile_array_filter(
    ctx: &QueryCtx<'_>,
    column: SqlExpr,
    field: &Field,
    op: &str,
    value: &JsonValue,
) -> Result<SqlExpr> {
    ensure!(
        ctx.dialect.supports_arrays(),
        "scalar list filters are not supported by this database"
    );
    let array_param = |json: &JsonValue| -> Result<SqlExpr> {
        let items = match json {
            JsonValue::Array(items) => items.iter().collect::<Vec<_>>(),
            single => vec![single],
        };
        let elems = items
            .iter()
            .map(|item| Ok(SqlExpr::Param(scalar_value(field, item)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(SqlExpr::ArrayLiteral(elems))
    };
    let clause = match op {
        "has" | "hasEvery" => SqlExpr::binary(
            column,
            SqlBinaryOp::ArrayContains,
            array_param(value)?,
        ),
        "hasSome" => SqlExpr::binary(
            column,
            SqlBinaryOp::ArrayOverlaps,
            array_param(value)?,
        ),
        "isEmpty" => {
            let empty = SqlExpr::binary(
                SqlExpr::Fn {
                    name: "cardinality".into(),
                    args: vec![column],
                },
                SqlBinaryOp::Eq,
                SqlExpr::Int(0),
            );
            if value.as_bool() == Some(false) {
                empty.not()
            } else {
                empty
            }
        }
        _ => bail!("unknown list filter `{}`", op),
    };
    Ok(clause)
}

fn compile_relation_filter(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
    field: &Field,
    filter: &JsonValue,
) -> Result<SqlExpr> {
    let target = ctx.schema.relation_model(field)?;
    let map = filter
        .as_object()
        .context("relation filters must be objects")?;

    if field.is_to_many() {
        let mut out = SqlExpr::Bool(true);
        for (op, nested) in map {
            let child_alias = ctx.fresh_alias("t");
            let inner = compile_where(ctx, target, &child_alias, nested)?;
            // Count-based forms: some > 0, none = 0, every = 0 over the
            // negated inner filter. Counting runs against the underlying
            // table, never the assembled arrays.
            let (inner, cmp) = match op.as_str() {
                "some" => (inner, SqlBinaryOp::Gt),
                "none" => (inner, SqlBinaryOp::Eq),
                "every" => (inner.not(), SqlBinaryOp::Eq),
                other => bail!("unknown relation quantifier `{}`", other),
            };
            let count = count_related(ctx, model, alias, field, target, &child_alias, inner)?;
            out = SqlExpr::and(out, SqlExpr::binary(count, cmp, SqlExpr::Int(0)));
        }
        return Ok(out);
    }

    // To-one: `is` / `isNot`, or a bare nested where.
    let quantified = map.keys().any(|k| k == "is" || k == "isNot");
    if !quantified {
        return to_one_predicate(ctx, model, alias, field, target, filter, false);
    }
    let mut out = SqlExpr::Bool(true);
    for (op, nested) in map {
        let clause = match op.as_str() {
            "is" => to_one_predicate(ctx, model, alias, field, target, nested, false)?,
            "isNot" => to_one_predicate(ctx, model, alias, field, target, nested, true)?,
            other => bail!("unknown relation operator `{}`", other),
        };
        out = SqlExpr::and(out, clause);
    }
    Ok(out)
}

fn to_one_predicate(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
    field: &Field,
    target: &Model,
    nested: &JsonValue,
    negated: bool,
) -> Result<SqlExpr> {
    let keys = utils::relation_keys(ctx.schema, model, field)?;
    if nested.is_null() {
        // `is: null` on the FK-owning side is a plain NULL check.
        let absent = if keys.owned_by_model {
            let mut e = SqlExpr::Bool(true);
            for pair in &keys.key_pairs {
                e = SqlExpr::and(e, SqlExpr::IsNull(Box::new(SqlExpr::column(alias, &pair.fk))));
            }
            e
        } else {
            let child_alias = ctx.fresh_alias("t");
            exists_related(ctx, model, alias, field, target, &child_alias, SqlExpr::Bool(true))?
                .not()
        };
        return Ok(if negated { absent.not() } else { absent });
    }
    let child_alias = ctx.fresh_alias("t");
    let inner = compile_where(ctx, target, &child_alias, nested)?;
    let exists = exists_related(ctx, model, alias, field, target, &child_alias, inner)?;
    Ok(if negated { exists.not() } else { exists })
}

/// `EXISTS (SELECT 1 FROM target WHERE link AND inner)`.
fn exists_related(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
    field: &Field,
    target: &Model,
    child_alias: &str,
    inner: SqlExpr,
) -> Result<SqlExpr> {
    let select = related_select(ctx, model, alias, field, target, child_alias, inner, false)?;
    Ok(SqlExpr::Exists(Box::new(select)))
}

/// `(SELECT COUNT(*) FROM target WHERE link AND inner)`.
fn count_related(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
    field: &Field,
    target: &Model,
    child_alias: &str,
    inner: SqlExpr,
) -> Result<SqlExpr> {
    let select = related_select(ctx, model, alias, field, target, child_alias, inner, true)?;
    Ok(SqlExpr::Subquery(Box::new(select)))
}

/// The correlated subquery over the rows of `field` seen from
/// `alias` (a row of `model`), filtered by `inner`.
#[allow(clippy::too_many_arguments)]
fn related_select(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
    field: &Field,
    target: &Model,
    child_alias: &str,
    inner: SqlExpr,
    count: bool,
) -> Result<Select> {
    let (from, joins) = from_with_base(ctx, target, child_alias)?;
    let mut select = Select {
        columns: vec![],
        from,
        joins,
        where_: None,
        group_by: vec![],
        having: None,
        order_by: vec![],
        limit: None,
        offset: None,
        distinct: None,
    };
    if count {
        select.column(SqlExpr::CountStar, None);
    } else {
        select.column(SqlExpr::Int(1), None);
    }
    let link = link_predicate(ctx, model, field, alias, child_alias)?;
    select.and_where(SqlExpr::and(link, inner));
    Ok(select)
}

/// The predicate tying a related row (under `child_alias`) to a parent row
/// (under `parent_alias`) through relation `field`.
pub fn link_predicate(
    ctx: &QueryCtx<'_>,
    parent: &Model,
    field: &Field,
    parent_alias: &str,
    child_alias: &str,
) -> Result<SqlExpr> {
    let target = ctx.schema.relation_model(field)?;
    if utils::is_many_to_many(ctx.schema, field) {
        let join = utils::implicit_join_table(ctx.schema, parent, field)?;
        ensure!(
            parent.id_fields().len() == 1 && target.id_fields().len() == 1,
            "many-to-many requires single-column ids"
        );
        let jt_alias = ctx.fresh_alias("jt");
        let mut jt_select = Select::from_table(&join.table, &jt_alias, None);
        jt_select.column(SqlExpr::column(&jt_alias, &join.other_fk), None);
        jt_select.and_where(SqlExpr::binary(
            SqlExpr::column(&jt_alias, &join.parent_fk),
            SqlBinaryOp::Eq,
            SqlExpr::column(parent_alias, &parent.id_fields()[0]),
        ));
        return Ok(SqlExpr::InSelect {
            expr: Box::new(SqlExpr::column(child_alias, &target.id_fields()[0])),
            select: Box::new(jt_select),
            negated: false,
        });
    }
    let keys = utils::relation_keys(ctx.schema, parent, field)?;
    let mut out = SqlExpr::Bool(true);
    for pair in &keys.key_pairs {
        let clause = if keys.owned_by_model {
            SqlExpr::binary(
                SqlExpr::column(parent_alias, &pair.fk),
                SqlBinaryOp::Eq,
                SqlExpr::column(child_alias, &pair.pk),
            )
        } else {
            SqlExpr::binary(
                SqlExpr::column(child_alias, &pair.fk),
                SqlBinaryOp::Eq,
                SqlExpr::column(parent_alias, &pair.pk),
            )
        };
        out = SqlExpr::and(out, clause);
    }
    Ok(out)
}

/// Compiles a unique `where` (id or unique-set equality) into a predicate.
/// Only the fields of the matched unique set are used.
pub fn compile_unique_where(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
    where_: &JsonValue,
) -> Result<SqlExpr> {
    let map = where_
        .as_object()
        .context("unique `where` must be an object")?;
    let keys: Vec<&str> = map.keys().map(String::as_str).collect();
    let set = utils::match_unique_set(model, &keys)?;
    let mut out = SqlExpr::Bool(true);
    for name in &set {
        let (column, field) = column_for(ctx, model, alias, name)?;
        out = SqlExpr::and(out, compile_equals(column, field, &map[name.as_str()])?);
    }
    Ok(out)
}

/// Escapes LIKE wildcards in user input; the writer always renders an
/// `ESCAPE '\'` clause.
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '%' || c == '_' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Compiles a `having` clause: field filters plus `_avg`/`_sum`/… aggregate
/// filters over the grouped rows.
pub fn compile_having(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
    having: &JsonValue,
) -> Result<SqlExpr> {
    let map = having
        .as_object()
        .context("`having` must be an object")?;
    let mut out = SqlExpr::Bool(true);
    for (key, value) in map {
        let clause = match key.as_str() {
            "AND" | "OR" | "NOT" => {
                let items: Vec<&JsonValue> = match value {
                    JsonValue::Array(items) => items.iter().collect(),
                    single => vec![single],
                };
                let conjunctive = key != "OR";
                let mut combined = SqlExpr::Bool(conjunctive);
                for item in items {
                    let inner = compile_having(ctx, model, alias, item)?;
                    combined = if conjunctive {
                        SqlExpr::and(combined, inner)
                    } else {
                        SqlExpr::or(combined, inner)
                    };
                }
                if key == "NOT" {
                    combined.not()
                } else {
                    combined
                }
            }
            "_count" | "_avg" | "_sum" | "_min" | "_max" => {
                let fn_name = match key.as_str() {
                    "_count" => "COUNT",
                    "_avg" => "AVG",
                    "_sum" => "SUM",
                    "_min" => "MIN",
                    _ => "MAX",
                };
                let inner = value.as_object().context("expected an object")?;
                let mut combined = SqlExpr::Bool(true);
                for (field_name, filter) in inner {
                    let (column, field) = column_for(ctx, model, alias, field_name)?;
                    let agg = SqlExpr::Fn {
                        name: fn_name.into(),
                        args: vec![column],
                    };
                    combined =
                        SqlExpr::and(combined, compile_scalar_filter(ctx, agg, field, filter)?);
                }
                combined
            }
            field_name => {
                let (column, field) = column_for(ctx, model, alias, field_name)?;
                compile_scalar_filter(ctx, column, field, value)?
            }
        };
        out = SqlExpr::and(out, clause);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{ComputedFields, ExprSlots};
    use crate::schema::tests::blog_schema;
    use crate::sql::{SqlWriter, SqliteDialect, Statement};
    use serde_json::json;

    fn where_sql(model: &str, where_: serde_json::Value) -> String {
        let schema = blog_schema();
        let dialect = SqliteDialect;
        let slots = ExprSlots::new();
        let computed = ComputedFields::new();
        let ctx = QueryCtx::new(&schema, &dialect, &slots, &computed);
        let model = schema.model(model).unwrap();
        let predicate = compile_where(&ctx, model, "t", &where_).unwrap();
        let mut select = Select::from_table(model.db_table(), "t", Some(model.name()));
        select.column(SqlExpr::column("t", "id"), Some("id"));
        select.and_where(predicate);
        SqlWriter::compile(&dialect, &Statement::Select(select))
            .unwrap()
            .sql
    }

    #[test]
    fn test_implicit_equals() {
        let sql = where_sql("Post", json!({ "title": "hello" }));
        assert!(sql.contains(r#"("t"."title" = ?1)"#), "{}", sql);
    }

    #[test]
    fn test_empty_in_folds_to_false() {
        let sql = where_sql("Post", json!({ "title": { "in": [] } }));
        assert!(sql.ends_with("WHERE 0"), "{}", sql);

        let sql = where_sql("Post", json!({ "title": { "notIn": [] } }));
        // Constant TRUE disappears entirely.
        assert!(!sql.contains("WHERE"), "{}", sql);
    }

    #[test]
    fn test_null_equals_is_null() {
        let sql = where_sql("User", json!({ "name": null }));
        assert!(sql.contains(r#"("t"."name" IS NULL)"#), "{}", sql);

        let sql = where_sql("User", json!({ "name": { "not": null } }));
        assert!(sql.contains(r#"("t"."name" IS NOT NULL)"#), "{}", sql);
    }

    #[test]
    fn test_string_contains_escapes_wildcards() {
        let sql = where_sql("Post", json!({ "title": { "contains": "50%" } }));
        assert!(sql.contains("LIKE"), "{}", sql);
        assert_eq!(escape_like("50%_x\\"), "50\\%\\_x\\\\");
    }

    #[test]
    fn test_to_many_some_uses_count() {
        let sql = where_sql("User", json!({ "posts": { "some": { "title": "t" } } }));
        assert!(sql.contains("SELECT COUNT(*) FROM \"Post\""), "{}", sql);
        assert!(sql.contains("> 0"), "{}", sql);
    }

    #[test]
    fn test_to_many_every_negates_inner() {
        let sql = where_sql("User", json!({ "posts": { "every": { "published": true } } }));
        assert!(sql.contains("NOT"), "{}", sql);
        assert!(sql.contains("= 0"), "{}", sql);
    }

    #[test]
    fn test_to_one_bare_nested_where() {
        let sql = where_sql("Post", json!({ "author": { "email": "a@b.c" } }));
        assert!(sql.contains("EXISTS"), "{}", sql);
        assert!(sql.contains(r#""authorId""#), "{}", sql);
    }

    #[test]
    fn test_to_one_is_null_on_owning_side() {
        let sql = where_sql("Post", json!({ "author": { "is": null } }));
        assert!(sql.contains(r#""t"."authorId" IS NULL"#), "{}", sql);
    }

    #[test]
    fn test_many_to_many_uses_join_table_subselect() {
        let sql = where_sql("Post", json!({ "tags": { "some": { "label": "x" } } }));
        assert!(sql.contains(r#""_PostToTag""#), "{}", sql);
        assert!(sql.contains(r#" IN (SELECT "#), "{}", sql);
    }

    #[test]
    fn test_logical_combinators() {
        let sql = where_sql(
            "Post",
            json!({ "OR": [ { "title": "a" }, { "title": "b" } ] }),
        );
        assert!(sql.contains(" OR "), "{}", sql);

        // Constant-true members fold away.
        let sql = where_sql("Post", json!({ "AND": [ {}, { "title": "a" } ] }));
        assert!(!sql.contains(" AND ("), "{}", sql);
    }
}
