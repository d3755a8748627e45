// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! Row-level policy enforcement. A pass over the compiled SQL tree injects
//! the combined allow/deny predicate of every policy-bearing model into each
//! SELECT that reads it; the mutation planner uses the same compiler for its
//! write-time checks.

use crate::expr::{BinaryOp, CollectionOp, Expr, Literal, UnaryOp};
use crate::query::{filter, QueryCtx};
use crate::schema::{Model, PolicyKind, PolicyOperation};
use crate::sql::{FromItem, Select, SqlBinaryOp, SqlExpr};
use crate::value::Value;
use anyhow::{bail, ensure, Result};
use serde_json::Value as JsonValue;

/// The folded `(OR allows) AND (AND NOT denies)` expression for `model` and
/// `op`. `None` when the model carries no policies at all; a model with
/// policies but no allow for `op` folds to constant `false` (nothing
/// visible). `post-update` has no implicit allow-all either, but only
/// applies when such policies exist.
pub fn combined_policy(model: &Model, op: PolicyOperation) -> Option<Expr> {
    if !model.has_policies() {
        return None;
    }
    if op == PolicyOperation::PostUpdate
        && !model.policies().iter().any(|p| p.applies_to(op))
    {
        return None;
    }
    let allows: Vec<Expr> = model
        .policies()
        .iter()
        .filter(|p| p.kind == PolicyKind::Allow && p.applies_to(op))
        .map(|p| p.expression.clone())
        .collect();
    let denies: Vec<Expr> = model
        .policies()
        .iter()
        .filter(|p| p.kind == PolicyKind::Deny && p.applies_to(op))
        .map(|p| p.expression.clone())
        .collect();
    let allowed = Expr::disjoin(allows);
    let denied = Expr::conjoin(denies.into_iter().map(Expr::not));
    Some(crate::expr::BinaryExpr::and(allowed, denied).fold())
}

/// Injects policy predicates into `select` and every SELECT nested under
/// it. LEFT-JOINed tables get the predicate in their join condition so the
/// join stays outer; the FROM table gets it in WHERE.
pub fn apply_policies(
    ctx: &QueryCtx<'_>,
    auth: &JsonValue,
    select: &mut Select,
    op: PolicyOperation,
) -> Result<()> {
    // Depth first, so injected predicates (whose tables are untagged) are
    // never revisited.
    if let FromItem::Subquery { select: inner, .. } = &mut select.from {
        apply_policies(ctx, auth, inner, op)?;
    }
    for join in &mut select.joins {
        if let FromItem::Subquery { select: inner, .. } = &mut join.from {
            apply_policies(ctx, auth, inner, op)?;
        }
    }
    let mut columns = std::mem::take(&mut select.columns);
    for column in &mut columns {
        walk_expr(ctx, auth, &mut column.expr, op)?;
    }
    select.columns = columns;
    if let Some(where_) = &mut select.where_ {
        walk_expr(ctx, auth, where_, op)?;
    }
    if let Some(having) = &mut select.having {
        walk_expr(ctx, auth, having, op)?;
    }
    let mut order_by = std::mem::take(&mut select.order_by);
    for term in &mut order_by {
        walk_expr(ctx, auth, &mut term.expr, op)?;
    }
    select.order_by = order_by;

    if let FromItem::Table {
        model: Some(model_name),
        alias,
        ..
    } = &select.from
    {
        let model = ctx.schema.model(model_name)?;
        if let Some(predicate) = policy_condition(ctx, auth, model, alias, op)? {
            select.and_where(predicate);
        }
    }
    let mut joins = std::mem::take(&mut select.joins);
    for join in &mut joins {
        walk_expr(ctx, auth, &mut join.on, op)?;
        if let FromItem::Table {
            model: Some(model_name),
            alias,
            ..
        } = &join.from
        {
            let model = ctx.schema.model(model_name)?;
            if let Some(predicate) = policy_condition(ctx, auth, model, alias, op)? {
                let on = std::mem::replace(&mut join.on, SqlExpr::Bool(true));
                join.on = SqlExpr::and(on, predicate);
            }
        }
    }
    select.joins = joins;
    Ok(())
}

fn walk_expr(
    ctx: &QueryCtx<'_>,
    auth: &JsonValue,
    expr: &mut SqlExpr,
    op: PolicyOperation,
) -> Result<()> {
    match expr {
        SqlExpr::Binary { left, right, .. } => {
            walk_expr(ctx, auth, left, op)?;
            walk_expr(ctx, auth, right, op)?;
        }
        SqlExpr::Not(inner)
        | SqlExpr::IsNull(inner)
        | SqlExpr::IsNotNull(inner)
        | SqlExpr::JsonAgg(inner) => walk_expr(ctx, auth, inner, op)?,
        SqlExpr::Like { expr, pattern, .. } => {
            walk_expr(ctx, auth, expr, op)?;
            walk_expr(ctx, auth, pattern, op)?;
        }
        SqlExpr::In { expr, list, .. } => {
            walk_expr(ctx, auth, expr, op)?;
            for item in list {
                walk_expr(ctx, auth, item, op)?;
            }
        }
        SqlExpr::InSelect { expr, select, .. } => {
            walk_expr(ctx, auth, expr, op)?;
            apply_policies(ctx, auth, select, op)?;
        }
        SqlExpr::Exists(select) | SqlExpr::Subquery(select) => {
            apply_policies(ctx, auth, select, op)?
        }
        SqlExpr::Fn { args, .. } => {
            for arg in args {
                walk_expr(ctx, auth, arg, op)?;
            }
        }
        SqlExpr::JsonObject(pairs) => {
            for (_, value) in pairs {
                walk_expr(ctx, auth, value, op)?;
            }
        }
        SqlExpr::Tuple(items) | SqlExpr::ArrayLiteral(items) => {
            for item in items {
                walk_expr(ctx, auth, item, op)?;
            }
        }
        SqlExpr::Cast { expr, .. } => walk_expr(ctx, auth, expr, op)?,
        SqlExpr::Column { .. }
        | SqlExpr::Param(_)
        | SqlExpr::Bool(_)
        | SqlExpr::Int(_)
        | SqlExpr::Null
        | SqlExpr::CountStar => {}
    }
    Ok(())
}

/// The compiled policy predicate for rows of `model` under `alias`, or
/// `None` when no policies apply.
pub fn policy_condition(
    ctx: &QueryCtx<'_>,
    auth: &JsonValue,
    model: &Model,
    alias: &str,
    op: PolicyOperation,
) -> Result<Option<SqlExpr>> {
    match combined_policy(model, op) {
        None => Ok(None),
        Some(expr) => Ok(Some(compile_policy_expr(ctx, auth, model, alias, &expr)?)),
    }
}

/// Compiles a policy expression against the current table alias. Field
/// references become column refs, `auth()` becomes bound constants, member
/// chains across to-one relations become correlated subselects, collection
/// predicates become EXISTS subqueries.
pub fn compile_policy_expr(
    ctx: &QueryCtx<'_>,
    auth: &JsonValue,
    model: &Model,
    alias: &str,
    expr: &Expr,
) -> Result<SqlExpr> {
    let compiled = match expr {
        Expr::Literal { value } => match value {
            Literal::Bool(b) => SqlExpr::Bool(*b),
            Literal::I64(i) => SqlExpr::Param(Value::Int(*i)),
            Literal::F64(f) => SqlExpr::Param(Value::Float(*f)),
            Literal::String(s) => SqlExpr::Param(Value::String(s.clone())),
        },
        Expr::Null => SqlExpr::Null,
        Expr::This => bail!("`this` can only be used in member access"),
        Expr::Field { name } => field_value(ctx, auth, model, alias, &[name.clone()])?,
        Expr::Member { .. } => {
            let chain = member_chain(expr)?;
            match chain {
                Chain::Auth(path) => auth_value(auth, &path)?,
                Chain::Row(path) => field_value(ctx, auth, model, alias, &path)?,
            }
        }
        Expr::Call { function, args } => {
            ensure!(
                function == "auth" && args.is_empty(),
                "unknown function `{}` in policy expression",
                function
            );
            // Bare `auth()` only makes sense in null comparisons; bind its
            // id-ish presence as a constant.
            if auth.is_null() {
                SqlExpr::Null
            } else {
                SqlExpr::Bool(true)
            }
        }
        Expr::Unary { op, expr } => match op {
            UnaryOp::Not => compile_policy_expr(ctx, auth, model, alias, expr)?.not(),
            UnaryOp::Neg => SqlExpr::binary(
                SqlExpr::Int(0),
                SqlBinaryOp::Sub,
                compile_policy_expr(ctx, auth, model, alias, expr)?,
            ),
        },
        Expr::Binary(binary) => {
            let op = match binary.op {
                BinaryOp::And => SqlBinaryOp::And,
                BinaryOp::Or => SqlBinaryOp::Or,
                BinaryOp::Eq => SqlBinaryOp::Eq,
                BinaryOp::NotEq => SqlBinaryOp::NotEq,
                BinaryOp::Lt => SqlBinaryOp::Lt,
                BinaryOp::LtEq => SqlBinaryOp::LtEq,
                BinaryOp::Gt => SqlBinaryOp::Gt,
                BinaryOp::GtEq => SqlBinaryOp::GtEq,
                BinaryOp::In => {
                    let left = compile_policy_expr(ctx, auth, model, alias, &binary.left)?;
                    let Expr::Array { elements } = &*binary.right else {
                        bail!("`in` expects an array literal on the right");
                    };
                    let list = elements
                        .iter()
                        .map(|e| compile_policy_expr(ctx, auth, model, alias, e))
                        .collect::<Result<Vec<_>>>()?;
                    return Ok(SqlExpr::In {
                        expr: Box::new(left),
                        list,
                        negated: false,
                    });
                }
            };
            let left = compile_policy_expr(ctx, auth, model, alias, &binary.left)?;
            let right = compile_policy_expr(ctx, auth, model, alias, &binary.right)?;
            // Null comparisons read as IS NULL / IS NOT NULL.
            let null_compare = matches!(op, SqlBinaryOp::Eq | SqlBinaryOp::NotEq)
                && (matches!(left, SqlExpr::Null) || matches!(right, SqlExpr::Null));
            if null_compare {
                let operand = if matches!(left, SqlExpr::Null) {
                    right
                } else {
                    left
                };
                if op == SqlBinaryOp::Eq {
                    SqlExpr::IsNull(Box::new(operand))
                } else {
                    SqlExpr::IsNotNull(Box::new(operand))
                }
            } else {
                SqlExpr::binary(left, op, right)
            }
        }
        Expr::Array { .. } => bail!("array literals are only valid on the right of `in`"),
        Expr::Collection {
            op,
            field,
            predicate,
        } => {
            let Expr::Field { name } = &**field else {
                bail!("collection predicates apply to relation fields");
            };
            let rel = model.field_or_err(name)?;
            ensure!(
                rel.is_to_many(),
                "collection predicate on `{}`, which is not a to-many relation",
                name
            );
            let target = ctx.schema.relation_model(rel)?;
            let child_alias = ctx.fresh_alias("p");
            let link = filter::link_predicate(ctx, model, rel, alias, &child_alias)?;
            let inner = compile_policy_expr(ctx, auth, target, &child_alias, predicate)?;
            let exists = |condition: SqlExpr| {
                let mut select = Select::from_table(target.db_table(), &child_alias, None);
                select.column(SqlExpr::Int(1), None);
                select.and_where(condition);
                SqlExpr::Exists(Box::new(select))
            };
            match op {
                CollectionOp::Some => exists(SqlExpr::and(link, inner)),
                CollectionOp::Every => exists(SqlExpr::and(link, inner.not())).not(),
                CollectionOp::None => exists(SqlExpr::and(link, inner)).not(),
            }
        }
    };
    Ok(compiled)
}

enum Chain {
    /// `auth().a.b` — resolved from the auth context.
    Auth(Vec<String>),
    /// `this.a.b` / `a.b` — resolved across the row's relations.
    Row(Vec<String>),
}

fn member_chain(expr: &Expr) -> Result<Chain> {
    let mut path = vec![];
    let mut cursor = expr;
    loop {
        match cursor {
            Expr::Member { object, member } => {
                path.push(member.clone());
                cursor = object;
            }
            Expr::Field { name } => {
                path.push(name.clone());
                path.reverse();
                return Ok(Chain::Row(path));
            }
            Expr::This => {
                path.reverse();
                return Ok(Chain::Row(path));
            }
            Expr::Call { function, .. } if function == "auth" => {
                path.reverse();
                return Ok(Chain::Auth(path));
            }
            _ => bail!("unsupported member access base in policy expression"),
        }
    }
}

fn auth_value(auth: &JsonValue, path: &[String]) -> Result<SqlExpr> {
    let mut cursor = auth;
    for segment in path {
        cursor = match cursor.get(segment) {
            Some(v) => v,
            None => return Ok(SqlExpr::Null),
        };
    }
    Ok(match cursor {
        JsonValue::Null => SqlExpr::Null,
        JsonValue::Bool(b) => SqlExpr::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlExpr::Param(Value::Int(i))
            } else {
                SqlExpr::Param(Value::Float(n.as_f64().unwrap_or_default()))
            }
        }
        JsonValue::String(s) => SqlExpr::Param(Value::String(s.clone())),
        other => bail!("auth context value `{}` cannot be bound", other),
    })
}

/// Resolves a member chain across the row: leading segments traverse to-one
/// relations through correlated subselects, the final segment is a column.
fn field_value(
    ctx: &QueryCtx<'_>,
    auth: &JsonValue,
    model: &Model,
    alias: &str,
    path: &[String],
) -> Result<SqlExpr> {
    ensure!(!path.is_empty(), "empty member chain");
    let field = model.field_or_err(&path[0])?;
    if path.len() == 1 {
        ensure!(
            !field.is_relation(),
            "`{}` is a relation; use a collection predicate or member access",
            field.name
        );
        return Ok(SqlExpr::column(alias, &field.name));
    }
    ensure!(
        field.is_relation() && !field.is_to_many(),
        "member access traverses to-one relations only (`{}`)",
        field.name
    );
    let target = ctx.schema.relation_model(field)?;
    let child_alias = ctx.fresh_alias("p");
    let link = filter::link_predicate(ctx, model, field, alias, &child_alias)?;
    let value = field_value(ctx, auth, target, &child_alias, &path[1..])?;
    let mut select = Select::from_table(target.db_table(), &child_alias, None);
    select.column(value, None);
    select.and_where(link);
    select.limit = Some(1);
    Ok(SqlExpr::Subquery(Box::new(select)))
}

/// Best-effort in-memory evaluation of a policy expression against a
/// prospective row (used for `create` checks before touching the database).
/// Returns `None` when the expression needs data the row does not carry.
pub fn eval_in_memory(auth: &JsonValue, expr: &Expr, row: &crate::JsonObject) -> Option<bool> {
    eval_value(auth, expr, row).and_then(|v| match v {
        JsonValue::Bool(b) => Some(b),
        _ => None,
    })
}

fn eval_value(auth: &JsonValue, expr: &Expr, row: &crate::JsonObject) -> Option<JsonValue> {
    match expr {
        Expr::Literal { value } => Some(match value {
            Literal::Bool(b) => JsonValue::Bool(*b),
            Literal::I64(i) => serde_json::json!(i),
            Literal::F64(f) => serde_json::json!(f),
            Literal::String(s) => JsonValue::String(s.clone()),
        }),
        Expr::Null => Some(JsonValue::Null),
        Expr::Field { name } => row.get(name).cloned(),
        Expr::Call { function, .. } if function == "auth" => Some(auth.clone()),
        Expr::Member { .. } => {
            let chain = member_chain(expr).ok()?;
            match chain {
                Chain::Auth(path) => {
                    let mut cursor = auth;
                    for segment in &path {
                        cursor = cursor.get(segment)?;
                    }
                    Some(cursor.clone())
                }
                Chain::Row(path) => {
                    if path.len() != 1 {
                        return None;
                    }
                    row.get(&path[0]).cloned()
                }
            }
        }
        Expr::Unary {
            op: UnaryOp::Not,
            expr,
        } => match eval_value(auth, expr, row)? {
            JsonValue::Bool(b) => Some(JsonValue::Bool(!b)),
            _ => None,
        },
        Expr::Binary(binary) => {
            let lhs = eval_value(auth, &binary.left, row);
            let rhs = eval_value(auth, &binary.right, row);
            match binary.op {
                BinaryOp::And => {
                    let (lhs, rhs) = (lhs?, rhs?);
                    Some(JsonValue::Bool(lhs.as_bool()? && rhs.as_bool()?))
                }
                BinaryOp::Or => {
                    let (lhs, rhs) = (lhs?, rhs?);
                    Some(JsonValue::Bool(lhs.as_bool()? || rhs.as_bool()?))
                }
                BinaryOp::Eq => Some(JsonValue::Bool(lhs? == rhs?)),
                BinaryOp::NotEq => Some(JsonValue::Bool(lhs? != rhs?)),
                BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                    let ordering = compare(&lhs?, &rhs?)?;
                    Some(JsonValue::Bool(match binary.op {
                        BinaryOp::Lt => ordering.is_lt(),
                        BinaryOp::LtEq => ordering.is_le(),
                        BinaryOp::Gt => ordering.is_gt(),
                        _ => ordering.is_ge(),
                    }))
                }
                BinaryOp::In => {
                    let needle = lhs?;
                    match rhs? {
                        JsonValue::Array(items) => {
                            Some(JsonValue::Bool(items.contains(&needle)))
                        }
                        _ => None,
                    }
                }
            }
        }
        Expr::Array { elements } => {
            let items = elements
                .iter()
                .map(|e| eval_value(auth, e, row))
                .collect::<Option<Vec<_>>>()?;
            Some(JsonValue::Array(items))
        }
        // Relation traversal needs the database.
        _ => None,
    }
}

fn compare(lhs: &JsonValue, rhs: &JsonValue) -> Option<std::cmp::Ordering> {
    match (lhs, rhs) {
        (JsonValue::Number(a), JsonValue::Number(b)) => {
            a.as_f64()?.partial_cmp(&b.as_f64()?)
        }
        (JsonValue::String(a), JsonValue::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::BinaryExpr;
    use crate::query::{ComputedFields, ExprSlots};
    use crate::schema::{Field, Model, Policy, SchemaBuilder};
    use crate::sql::{SqlWriter, SqliteDialect, Statement};
    use crate::value::ScalarType;
    use serde_json::json;

    fn policy_schema() -> std::sync::Arc<crate::Schema> {
        SchemaBuilder::new()
            .model(
                Model::new("Doc")
                    .field(Field::scalar("id", ScalarType::String).id())
                    .field(Field::scalar("value", ScalarType::Int))
                    .field(Field::scalar("ownerId", ScalarType::String).optional())
                    .policy(Policy::allow(
                        &[PolicyOperation::Read],
                        BinaryExpr::new(BinaryOp::Gt, Expr::field("value"), Expr::literal(1i64)),
                    ))
                    .policy(Policy::deny(
                        &[PolicyOperation::Read],
                        BinaryExpr::new(
                            BinaryOp::Eq,
                            Expr::field("ownerId"),
                            Expr::literal("blocked"),
                        ),
                    )),
            )
            .model(
                Model::new("Secret")
                    .field(Field::scalar("id", ScalarType::String).id())
                    .policy(Policy::deny(&[PolicyOperation::All], Expr::literal(true))),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_combined_policy_folds() {
        let schema = policy_schema();
        let secret = schema.get_model("Secret").unwrap();
        // No allow at all: constant false.
        let combined = combined_policy(secret, PolicyOperation::Read).unwrap();
        assert!(combined.is_false());

        let doc = schema.get_model("Doc").unwrap();
        let combined = combined_policy(doc, PolicyOperation::Read).unwrap();
        assert!(!combined.is_false());
    }

    #[test]
    fn test_injection_into_select() {
        let schema = policy_schema();
        let dialect = SqliteDialect;
        let slots = ExprSlots::new();
        let computed = ComputedFields::new();
        let ctx = QueryCtx::new(&schema, &dialect, &slots, &computed);
        let mut select = Select::from_table("Doc", "t", Some("Doc"));
        select.column(SqlExpr::column("t", "id"), Some("id"));
        apply_policies(&ctx, &JsonValue::Null, &mut select, PolicyOperation::Read).unwrap();
        let sql = SqlWriter::compile(&dialect, &Statement::Select(select))
            .unwrap()
            .sql;
        assert!(sql.contains(r#""t"."value" > "#), "{}", sql);
        assert!(sql.contains("NOT"), "{}", sql);
    }

    #[test]
    fn test_empty_allow_compiles_to_false() {
        let schema = policy_schema();
        let dialect = SqliteDialect;
        let slots = ExprSlots::new();
        let computed = ComputedFields::new();
        let ctx = QueryCtx::new(&schema, &dialect, &slots, &computed);
        let mut select = Select::from_table("Secret", "t", Some("Secret"));
        select.column(SqlExpr::column("t", "id"), Some("id"));
        apply_policies(&ctx, &JsonValue::Null, &mut select, PolicyOperation::Read).unwrap();
        let sql = SqlWriter::compile(&dialect, &Statement::Select(select))
            .unwrap()
            .sql;
        assert!(sql.ends_with("WHERE 0"), "{}", sql);
    }

    #[test]
    fn test_auth_member_binds_constant() {
        let schema = policy_schema();
        let dialect = SqliteDialect;
        let slots = ExprSlots::new();
        let computed = ComputedFields::new();
        let ctx = QueryCtx::new(&schema, &dialect, &slots, &computed);
        let doc = schema.get_model("Doc").unwrap();
        let expr = BinaryExpr::new(
            BinaryOp::Eq,
            Expr::field("ownerId"),
            Expr::auth().member("id"),
        );
        let auth = json!({ "id": "u1" });
        let compiled = compile_policy_expr(&ctx, &auth, doc, "t", &expr).unwrap();
        assert_eq!(
            compiled,
            SqlExpr::binary(
                SqlExpr::column("t", "ownerId"),
                SqlBinaryOp::Eq,
                SqlExpr::Param(Value::String("u1".into()))
            )
        );

        // Absent auth member compares as NULL.
        let compiled = compile_policy_expr(&ctx, &JsonValue::Null, doc, "t", &expr).unwrap();
        assert_eq!(
            compiled,
            SqlExpr::IsNull(Box::new(SqlExpr::column("t", "ownerId")))
        );
    }

    #[test]
    fn test_eval_in_memory() {
        let expr = BinaryExpr::new(BinaryOp::Gt, Expr::field("value"), Expr::literal(1i64));
        let mut row = crate::JsonObject::new();
        row.insert("value".into(), json!(2));
        assert_eq!(eval_in_memory(&JsonValue::Null, &expr, &row), Some(true));
        row.insert("value".into(), json!(0));
        assert_eq!(eval_in_memory(&JsonValue::Null, &expr, &row), Some(false));

        // Unknown field: undecidable.
        let expr = BinaryExpr::new(BinaryOp::Gt, Expr::field("missing"), Expr::literal(1i64));
        assert_eq!(eval_in_memory(&JsonValue::Null, &expr, &row), None);
    }

    #[test]
    fn test_auth_comparison_in_memory() {
        let expr = BinaryExpr::new(
            BinaryOp::Eq,
            Expr::field("ownerId"),
            Expr::auth().member("id"),
        );
        let mut row = crate::JsonObject::new();
        row.insert("ownerId".into(), json!("u1"));
        assert_eq!(eval_in_memory(&json!({ "id": "u1" }), &expr, &row), Some(true));
        assert_eq!(eval_in_memory(&json!({ "id": "u2" }), &expr, &row), Some(false));
    }
}
