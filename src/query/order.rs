// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! `orderBy`, cursor and pagination compilation.

use super::filter::{column_for, compile_unique_where, from_with_base, link_predicate};
use super::QueryCtx;
use crate::schema::Model;
use crate::sql::{Join, JoinKind, NullsOrder, OrderTerm, Select, SqlBinaryOp, SqlExpr};
use anyhow::{bail, ensure, Context as _, Result};
use serde_json::Value as JsonValue;

/// A compiled ordering: the ORDER BY terms, any LEFT JOINs needed for
/// nested to-one ordering, and for each term the root column it reads, when
/// it is a plain root column (the cursor compiler needs those).
#[derive(Debug, Clone, Default)]
pub struct OrderSpec {
    pub terms: Vec<OrderTerm>,
    pub joins: Vec<Join>,
    pub root_columns: Vec<Option<String>>,
}

/// Compiles `orderBy`. With `reverse` every direction flips (negative
/// `take`). When `ensure_id` is set, ascending id columns are appended
/// unless already present, making pagination deterministic.
pub fn compile_order_by(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
    order_by: Option<&JsonValue>,
    reverse: bool,
    ensure_id: bool,
) -> Result<OrderSpec> {
    let mut spec = OrderSpec::default();
    if let Some(order_by) = order_by {
        let entries: Vec<&JsonValue> = match order_by {
            JsonValue::Array(items) => items.iter().collect(),
            single => vec![single],
        };
        for entry in entries {
            compile_entry(ctx, model, alias, entry, reverse, &mut spec)?;
        }
    }
    if ensure_id {
        for id in model.id_fields() {
            let already = spec
                .root_columns
                .iter()
                .any(|c| c.as_deref() == Some(id.as_str()));
            if !already {
                let (column, _) = column_for(ctx, model, alias, id)?;
                spec.terms.push(OrderTerm {
                    expr: column,
                    descending: reverse,
                    nulls: None,
                });
                spec.root_columns.push(Some(id.clone()));
            }
        }
    }
    Ok(spec)
}

fn compile_entry(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
    entry: &JsonValue,
    reverse: bool,
    spec: &mut OrderSpec,
) -> Result<()> {
    let map = entry.as_object().context("`orderBy` entries must be objects")?;
    for (key, value) in map {
        if let Some(fn_name) = aggregate_fn(key) {
            // groupBy result ordering, eg `_count: { id: "asc" }`.
            let inner = value.as_object().context("expected an object")?;
            for (field_name, dir) in inner {
                let (column, _) = column_for(ctx, model, alias, field_name)?;
                spec.terms.push(OrderTerm {
                    expr: SqlExpr::Fn {
                        name: fn_name.into(),
                        args: vec![column],
                    },
                    descending: parse_direction(dir)? != reverse,
                    nulls: None,
                });
                spec.root_columns.push(None);
            }
            continue;
        }
        let (_, field) = ctx.resolve_field(model, key)?;
        if field.is_to_many() {
            // `{ _count: asc|desc }` over the relation.
            let dir = value
                .get("_count")
                .context("to-many ordering must be `{ _count: … }`")?;
            let target = ctx.schema.relation_model(field)?;
            let child_alias = ctx.fresh_alias("o");
            let (from, joins) = from_with_base(ctx, target, &child_alias)?;
            let mut count = Select {
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
            count.column(SqlExpr::CountStar, None);
            count.and_where(link_predicate(ctx, model, field, alias, &child_alias)?);
            spec.terms.push(OrderTerm {
                expr: SqlExpr::Subquery(Box::new(count)),
                descending: parse_direction(dir)? != reverse,
                nulls: None,
            });
            spec.root_columns.push(None);
        } else if field.is_relation() {
            // Nested to-one ordering through a LEFT JOIN.
            let target = ctx.schema.relation_model(field)?;
            let child_alias = ctx.fresh_alias("o");
            let on = link_predicate(ctx, model, field, alias, &child_alias)?;
            spec.joins.push(Join {
                kind: JoinKind::Left,
                from: crate::sql::FromItem::Table {
                    name: target.db_table().to_owned(),
                    alias: child_alias.clone(),
                    model: Some(target.name().to_owned()),
                },
                on,
            });
            let before = spec.root_columns.len();
            compile_entry(ctx, target, &child_alias, value, reverse, spec)?;
            // Nested terms are not root columns of `model`.
            for root in spec.root_columns.iter_mut().skip(before) {
                *root = None;
            }
        } else {
            let (column, field) = column_for(ctx, model, alias, key)?;
            let (descending, nulls) = match value {
                JsonValue::String(_) => (parse_direction(value)?, None),
                JsonValue::Object(opts) => {
                    let dir = opts.get("sort").map(parse_direction).transpose()?.unwrap_or(false);
                    let nulls = match opts.get("nulls").and_then(|n| n.as_str()) {
                        Some("first") => Some(NullsOrder::First),
                        Some("last") => Some(NullsOrder::Last),
                        _ => None,
                    };
                    ensure!(
                        nulls.is_none() || field.optional,
                        "`nulls` ordering requires an optional field"
                    );
                    (dir, nulls)
                }
                _ => bail!("expected `asc`, `desc` or `{{ sort, nulls }}`"),
            };
            let descending = descending != reverse;
            let nulls = if reverse {
                nulls.map(|n| match n {
                    NullsOrder::First => NullsOrder::Last,
                    NullsOrder::Last => NullsOrder::First,
                })
            } else {
                nulls
            };
            spec.terms.push(OrderTerm {
                expr: column,
                descending,
                nulls,
            });
            spec.root_columns.push(Some(key.clone()));
        }
    }
    Ok(())
}

fn aggregate_fn(key: &str) -> Option<&'static str> {
    match key {
        "_count" => Some("COUNT"),
        "_avg" => Some("AVG"),
        "_sum" => Some("SUM"),
        "_min" => Some("MIN"),
        "_max" => Some("MAX"),
        _ => None,
    }
}

fn parse_direction(value: &JsonValue) -> Result<bool> {
    match value.as_str() {
        Some("asc") => Ok(false),
        Some("desc") => Ok(true),
        _ => bail!("expected `asc` or `desc`"),
    }
}

/// Compiles a cursor into the lexicographic tuple predicate over the order
/// columns: `(c1 > v1) OR (c1 = v1 AND c2 > v2) OR … OR (= … AND cn >= vn)`.
/// The final column compares inclusively, so the cursor row itself is
/// returned (and dropped again by `skip` when the caller asks for that).
/// The `vi` are correlated subselects against the unique cursor row.
pub fn compile_cursor(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
    cursor: &JsonValue,
    order: &OrderSpec,
) -> Result<SqlExpr> {
    ensure!(
        !order.terms.is_empty(),
        "cursor pagination requires an ordering"
    );
    let mut axes: Vec<(SqlExpr, SqlExpr, bool)> = vec![];
    for (term, root) in order.terms.iter().zip(order.root_columns.iter()) {
        let Some(field_name) = root else {
            bail!("cursor pagination requires plain column ordering");
        };
        let cursor_alias = ctx.fresh_alias("c");
        let (from, joins) = from_with_base(ctx, model, &cursor_alias)?;
        let (value_col, _) = column_for(ctx, model, &cursor_alias, field_name)?;
        let mut row = Select {
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
        row.column(value_col, None);
        row.and_where(compile_unique_where(ctx, model, &cursor_alias, cursor)?);
        axes.push((
            term.expr.clone(),
            SqlExpr::Subquery(Box::new(row)),
            term.descending,
        ));
    }

    let last = axes.len() - 1;
    let mut disjuncts = vec![];
    for i in 0..axes.len() {
        let mut clause = SqlExpr::Bool(true);
        for (col, value, _) in axes.iter().take(i) {
            clause = SqlExpr::and(
                clause,
                SqlExpr::binary(col.clone(), SqlBinaryOp::Eq, value.clone()),
            );
        }
        let (col, value, descending) = &axes[i];
        let op = match (i == last, *descending) {
            (true, false) => SqlBinaryOp::GtEq,
            (true, true) => SqlBinaryOp::LtEq,
            (false, false) => SqlBinaryOp::Gt,
            (false, true) => SqlBinaryOp::Lt,
        };
        clause = SqlExpr::and(clause, SqlExpr::binary(col.clone(), op, value.clone()));
        disjuncts.push(clause);
    }
    Ok(disjuncts
        .into_iter()
        .reduce(SqlExpr::or)
        .unwrap_or(SqlExpr::Bool(true)))
}

/// Interprets `take`: negative values reverse the scan.
pub fn take_params(args: &JsonValue) -> (Option<u64>, bool) {
    match args.get("take").and_then(|t| t.as_i64()) {
        Some(n) if n < 0 => (Some(n.unsigned_abs()), true),
        Some(n) => (Some(n as u64), false),
        None => (None, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{ComputedFields, ExprSlots};
    use crate::schema::tests::blog_schema;
    use crate::sql::{SqlWriter, SqliteDialect, Statement};
    use serde_json::json;

    fn order_sql(model: &str, order: serde_json::Value, reverse: bool) -> String {
        let schema = blog_schema();
        let dialect = SqliteDialect;
        let slots = ExprSlots::new();
        let computed = ComputedFields::new();
        let ctx = QueryCtx::new(&schema, &dialect, &slots, &computed);
        let model = schema.model(model).unwrap();
        let spec = compile_order_by(&ctx, model, "t", Some(&order), reverse, true).unwrap();
        let mut select = Select::from_table(model.db_table(), "t", Some(model.name()));
        select.column(SqlExpr::column("t", "id"), Some("id"));
        select.joins = spec.joins;
        select.order_by = spec.terms;
        SqlWriter::compile(&dialect, &Statement::Select(select))
            .unwrap()
            .sql
    }

    #[test]
    fn test_scalar_order_appends_id() {
        let sql = order_sql("Post", json!({ "title": "desc" }), false);
        assert!(
            sql.contains(r#"ORDER BY "t"."title" DESC, "t"."id" ASC"#),
            "{}",
            sql
        );
    }

    #[test]
    fn test_reverse_flips_everything() {
        let sql = order_sql("Post", json!({ "title": "desc" }), true);
        assert!(
            sql.contains(r#"ORDER BY "t"."title" ASC, "t"."id" DESC"#),
            "{}",
            sql
        );
    }

    #[test]
    fn test_relation_count_ordering() {
        let sql = order_sql("User", json!({ "posts": { "_count": "desc" } }), false);
        assert!(sql.contains("(SELECT COUNT(*) FROM \"Post\""), "{}", sql);
        assert!(sql.contains("DESC"), "{}", sql);
    }

    #[test]
    fn test_nested_to_one_ordering_left_joins() {
        let sql = order_sql("Post", json!({ "author": { "email": "asc" } }), false);
        assert!(sql.contains("LEFT JOIN \"User\""), "{}", sql);
    }

    #[test]
    fn test_cursor_predicate() {
        let schema = blog_schema();
        let dialect = SqliteDialect;
        let slots = ExprSlots::new();
        let computed = ComputedFields::new();
        let ctx = QueryCtx::new(&schema, &dialect, &slots, &computed);
        let model = schema.model("Post").unwrap();
        let order =
            compile_order_by(&ctx, model, "t", Some(&json!({ "id": "asc" })), false, false)
                .unwrap();
        let predicate =
            compile_cursor(&ctx, model, "t", &json!({ "id": "p2" }), &order).unwrap();
        let mut select = Select::from_table("Post", "t", Some("Post"));
        select.column(SqlExpr::column("t", "id"), Some("id"));
        select.and_where(predicate);
        let sql = SqlWriter::compile(&dialect, &Statement::Select(select))
            .unwrap()
            .sql;
        // Single axis: inclusive comparison against the cursor row subselect.
        assert!(sql.contains(">="), "{}", sql);
        assert!(sql.contains("(SELECT \"c0\".\"id\" FROM \"Post\" AS \"c0\""), "{}", sql);
    }

    #[test]
    fn test_take_params() {
        assert_eq!(take_params(&json!({ "take": 5 })), (Some(5), false));
        assert_eq!(take_params(&json!({ "take": -2 })), (Some(2), true));
        assert_eq!(take_params(&json!({})), (None, false));
    }
}
