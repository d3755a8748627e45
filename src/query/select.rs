// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! Projection compilation: which columns a read selects, how relations are
//! delivered (flat joins or JSON-aggregating subqueries), aggregates and
//! grouping.

use super::filter::{column_for, compile_having, compile_where, from_with_base, link_predicate};
use super::order::{compile_cursor, compile_order_by, take_params};
use super::{
    DelegateShape, EntityShape, ExprContext, FlatRelationShape, JsonRelationShape, QueryCtx,
    ReadQuery, ScalarShape,
};
use crate::schema::{utils, Field, Model};
use crate::sql::{FromItem, Join, JoinKind, Select, SqlExpr};
use crate::value::ScalarType;
use anyhow::{anyhow, bail, ensure, Context as _, Result};
use serde_json::Value as JsonValue;

/// What one entity level selects.
struct Selection<'a> {
    scalars: Vec<(&'a Model, &'a Field)>,
    relations: Vec<(&'a Field, JsonValue)>,
    count: Option<JsonValue>,
}

fn selection_of<'a>(
    ctx: &QueryCtx<'a>,
    model: &'a Model,
    args: &JsonValue,
) -> Result<Selection<'a>> {
    let select = args.get("select").and_then(|s| s.as_object());
    let include = args.get("include").and_then(|s| s.as_object());
    let omit = args.get("omit").and_then(|s| s.as_object());

    let mut selection = Selection {
        scalars: vec![],
        relations: vec![],
        count: None,
    };

    if let Some(select) = select {
        for (key, value) in select {
            if key == "_count" {
                selection.count = Some(value.clone());
                continue;
            }
            let (owner, field) = ctx.resolve_field(model, key)?;
            if field.is_relation() {
                if value.as_bool() != Some(false) {
                    selection.relations.push((field, value.clone()));
                }
            } else if value.as_bool() == Some(true) {
                selection.scalars.push((owner, field));
            }
        }
        return Ok(selection);
    }

    // Default: every scalar of the model and its delegate bases, minus
    // omissions.
    let omitted = |name: &str| {
        omit.map_or(false, |o| o.get(name).and_then(|v| v.as_bool()) == Some(true))
    };
    for field in model.scalar_fields() {
        if !omitted(&field.name) {
            selection.scalars.push((model, field));
        }
    }
    for base in utils::base_chain(ctx.schema, model)? {
        for field in base.scalar_fields() {
            let shadowed = selection.scalars.iter().any(|(_, f)| f.name == field.name);
            if !shadowed && !omitted(&field.name) {
                selection.scalars.push((base, field));
            }
        }
    }
    if let Some(include) = include {
        for (key, value) in include {
            if key == "_count" {
                selection.count = Some(value.clone());
                continue;
            }
            let (_, field) = ctx.resolve_field(model, key)?;
            ensure!(
                field.is_relation(),
                "`include` only accepts relations, `{}` is not one",
                key
            );
            if value.as_bool() != Some(false) {
                selection.relations.push((field, value.clone()));
            }
        }
    }
    Ok(selection)
}

/// Wraps a JSON-producing subquery so it embeds as JSON rather than text.
fn reparse_json(ctx: &QueryCtx<'_>, expr: SqlExpr) -> SqlExpr {
    if ctx.dialect.json_needs_reparse() {
        SqlExpr::Fn {
            name: "json".into(),
            args: vec![expr],
        }
    } else {
        expr
    }
}

fn scalar_expr(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
    owner: &Model,
    field: &Field,
    in_json: bool,
) -> Result<(SqlExpr, ScalarType)> {
    let ty = field
        .type_
        .scalar()
        .ok_or_else(|| anyhow!("`{}` has no scalar type", field.name))?;
    let expr = if field.computed {
        let computed = ctx
            .computed_fields
            .get(&(model.name().to_owned(), field.name.clone()))
            .ok_or_else(|| {
                anyhow!(
                    "no computed-field definition for `{}.{}`",
                    model.name(),
                    field.name
                )
            })?;
        computed(&ExprContext { table_alias: alias })
    } else {
        let table = if owner.name() == model.name() {
            alias.to_owned()
        } else {
            super::filter::base_alias(alias, owner.name())
        };
        SqlExpr::column(table, &field.name)
    };
    let cast = if in_json {
        ctx.dialect.json_scalar_cast(&ty)
    } else {
        ctx.dialect.select_cast(&ty)
    };
    let expr = match cast {
        Some(ty_name) => SqlExpr::Cast {
            expr: Box::new(expr),
            ty: ty_name.to_owned(),
        },
        None => expr,
    };
    Ok((expr, ty))
}

/// Compiles one `findMany`-family read into a `Select` plus its shape.
pub fn compile_entity_select(
    ctx: &QueryCtx<'_>,
    model: &Model,
    args: &JsonValue,
    single: bool,
) -> Result<ReadQuery> {
    let alias = ctx.fresh_alias("t");
    let (from, mut joins) = from_with_base(ctx, model, &alias)?;

    let (take, reverse) = take_params(args);
    let order = compile_order_by(
        ctx,
        model,
        &alias,
        args.get("orderBy"),
        reverse,
        !single || args.get("cursor").is_some(),
    )?;
    joins.extend(order.joins.clone());

    let mut where_ = match args.get("where") {
        Some(w) => compile_where(ctx, model, &alias, w)?,
        None => SqlExpr::Bool(true),
    };
    if let Some(cursor) = args.get("cursor") {
        where_ = SqlExpr::and(where_, compile_cursor(ctx, model, &alias, cursor, &order)?);
    }

    let mut select = Select {
        columns: vec![],
        from,
        joins,
        where_: match where_ {
            SqlExpr::Bool(true) => None,
            other => Some(other),
        },
        group_by: vec![],
        having: None,
        order_by: order.terms.clone(),
        limit: if single { Some(1) } else { take },
        offset: args.get("skip").and_then(|s| s.as_u64()),
        distinct: None,
    };

    if let Some(distinct) = args.get("distinct") {
        ensure!(
            ctx.dialect.supports_distinct_on(),
            "`distinct` requires DISTINCT ON, which this database does not support"
        );
        let names: Vec<&JsonValue> = match distinct {
            JsonValue::Array(items) => items.iter().collect(),
            one => vec![one],
        };
        let mut cols = vec![];
        for name in names {
            let name = name.as_str().context("`distinct` expects field names")?;
            let (column, _) = column_for(ctx, model, &alias, name)?;
            cols.push(column);
        }
        // DISTINCT ON demands its columns lead the ordering.
        let mut order_by = vec![];
        for col in &cols {
            order_by.push(crate::sql::OrderTerm {
                expr: col.clone(),
                descending: false,
                nulls: None,
            });
        }
        order_by.extend(select.order_by.drain(..));
        select.order_by = order_by;
        select.distinct = Some(cols);
    }

    let shape = build_entity_columns(ctx, model, &alias, args, &mut select)?;
    Ok(ReadQuery { select, shape })
}

/// Adds the projection for one entity level as flat top-level columns,
/// returning the shape.
fn build_entity_columns(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
    args: &JsonValue,
    select: &mut Select,
) -> Result<EntityShape> {
    let selection = selection_of(ctx, model, args)?;
    let mut shape = EntityShape {
        model: model.name().to_owned(),
        ..Default::default()
    };

    for (owner, field) in &selection.scalars {
        let (expr, ty) = scalar_expr(ctx, model, alias, owner, field, false)?;
        select.column(expr, Some(field.name.as_str()));
        shape.scalars.push(ScalarShape {
            name: field.name.clone(),
            alias: field.name.clone(),
            ty,
        });
    }

    for (field, rel_args) in &selection.relations {
        if use_flat_strategy(ctx, field, rel_args) {
            let (flat, nested_joins) =
                flat_to_one_columns(ctx, model, alias, field, select)?;
            select.joins.extend(nested_joins);
            shape.flat_relations.push(flat);
        } else {
            let (expr, rel_shape) = relation_json_column(ctx, model, alias, field, rel_args)?;
            let expr = match ctx.dialect.json_column_cast() {
                Some(ty) => SqlExpr::Cast {
                    expr: Box::new(expr),
                    ty: ty.to_owned(),
                },
                None => expr,
            };
            select.column(expr, Some(field.name.as_str()));
            shape.json_relations.push(rel_shape);
        }
    }

    if let Some(count_args) = &selection.count {
        let expr = count_json_column(ctx, model, alias, count_args)?;
        let expr = match ctx.dialect.json_column_cast() {
            Some(ty) => SqlExpr::Cast {
                expr: Box::new(expr),
                ty: ty.to_owned(),
            },
            None => expr,
        };
        select.column(expr, Some("_count"));
        shape.count_alias = Some("_count".to_owned());
    }

    // A delegate base packages each descendant's own fields into a synthetic
    // JSON column so the concrete type can be reconstructed.
    for descendant_name in model.descendants() {
        let descendant = ctx.schema.model(descendant_name)?;
        let d_alias = ctx.fresh_alias("d");
        let mut on = SqlExpr::Bool(true);
        for id in model.id_fields() {
            on = SqlExpr::and(
                on,
                SqlExpr::binary(
                    SqlExpr::column(alias, id),
                    crate::sql::SqlBinaryOp::Eq,
                    SqlExpr::column(&d_alias, id),
                ),
            );
        }
        select.joins.push(Join {
            kind: JoinKind::Left,
            from: FromItem::Table {
                name: descendant.db_table().to_owned(),
                alias: d_alias.clone(),
                model: Some(descendant.name().to_owned()),
            },
            on,
        });
        let mut pairs = vec![];
        let mut nested = EntityShape {
            model: descendant.name().to_owned(),
            ..Default::default()
        };
        for field in descendant.scalar_fields() {
            let ty = field
                .type_
                .scalar()
                .ok_or_else(|| anyhow!("`{}` has no scalar type", field.name))?;
            let (expr, _) = scalar_expr(ctx, descendant, &d_alias, descendant, field, true)?;
            pairs.push((field.name.clone(), expr));
            nested.scalars.push(ScalarShape {
                name: field.name.clone(),
                alias: field.name.clone(),
                ty,
            });
        }
        let column_alias = format!("$delegate${}", descendant.name());
        let expr = SqlExpr::JsonObject(pairs);
        let expr = match ctx.dialect.json_column_cast() {
            Some(ty) => SqlExpr::Cast {
                expr: Box::new(expr),
                ty: ty.to_owned(),
            },
            None => expr,
        };
        select.column(expr, Some(column_alias.as_str()));
        shape.delegates.push(DelegateShape {
            model: descendant.name().to_owned(),
            alias: column_alias,
            nested,
        });
    }

    Ok(shape)
}

/// The flat strategy applies to argument-less to-one relations of plain
/// models; everything else goes through JSON aggregation.
fn use_flat_strategy(ctx: &QueryCtx<'_>, field: &Field, rel_args: &JsonValue) -> bool {
    if field.is_to_many() || !rel_args.is_boolean() {
        return false;
    }
    match ctx.schema.relation_model(field) {
        Ok(target) => target.base_model().is_none() && target.descendants().is_empty(),
        Err(_) => false,
    }
}

/// Left-joins a to-one relation and selects its default scalars with
/// `name$field` aliases.
fn flat_to_one_columns(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
    field: &Field,
    select: &mut Select,
) -> Result<(FlatRelationShape, Vec<Join>)> {
    let target = ctx.schema.relation_model(field)?;
    let child_alias = ctx.fresh_alias("j");
    let on = link_predicate(ctx, model, field, alias, &child_alias)?;
    let joins = vec![Join {
        kind: JoinKind::Left,
        from: FromItem::Table {
            name: target.db_table().to_owned(),
            alias: child_alias.clone(),
            model: Some(target.name().to_owned()),
        },
        on,
    }];

    let mut nested = EntityShape {
        model: target.name().to_owned(),
        ..Default::default()
    };
    let mut id_aliases = vec![];
    for scalar in target.scalar_fields() {
        let ty = scalar
            .type_
            .scalar()
            .ok_or_else(|| anyhow!("`{}` has no scalar type", scalar.name))?;
        let (expr, _) = scalar_expr(ctx, target, &child_alias, target, scalar, false)?;
        let column_alias = format!("{}${}", field.name, scalar.name);
        select.column(expr, Some(column_alias.as_str()));
        nested.scalars.push(ScalarShape {
            name: scalar.name.clone(),
            alias: column_alias.clone(),
            ty,
        });
        if target.id_fields().contains(&scalar.name) {
            id_aliases.push(column_alias);
        }
    }
    Ok((
        FlatRelationShape {
            name: field.name.clone(),
            optional: field.optional,
            id_aliases,
            nested,
        },
        joins,
    ))
}

/// Whether relation arguments force an inner ordered select before
/// aggregation.
fn needs_inner_wrap(rel_args: &JsonValue) -> bool {
    ["take", "skip", "orderBy", "cursor", "distinct"]
        .iter()
        .any(|k| rel_args.get(k).is_some())
}

/// Builds the JSON-strategy column for a relation: a correlated subquery
/// aggregating the related rows into a JSON array (to-many) or object
/// (to-one).
fn relation_json_column(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
    field: &Field,
    rel_args: &JsonValue,
) -> Result<(SqlExpr, JsonRelationShape)> {
    let target = ctx.schema.relation_model(field)?;
    let default_args = JsonValue::Null;
    let args = if rel_args.is_boolean() {
        &default_args
    } else {
        rel_args
    };

    let child_alias = ctx.fresh_alias("r");
    let link = link_predicate(ctx, model, field, alias, &child_alias)?;

    let (select, nested_shape) = if field.is_to_many() && needs_inner_wrap(args) {
        wrapped_relation_select(ctx, target, &child_alias, link, args)?
    } else {
        plain_relation_select(ctx, target, &child_alias, link, args, field.is_to_many())?
    };

    let shape = JsonRelationShape {
        name: field.name.clone(),
        alias: field.name.clone(),
        to_many: field.is_to_many(),
        optional: field.optional,
        nested: nested_shape,
    };
    Ok((SqlExpr::Subquery(Box::new(select)), shape))
}

/// The unwrapped form: aggregate (or project) straight off the target table.
fn plain_relation_select(
    ctx: &QueryCtx<'_>,
    target: &Model,
    child_alias: &str,
    link: SqlExpr,
    args: &JsonValue,
    to_many: bool,
) -> Result<(Select, EntityShape)> {
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
    select.and_where(link);
    if let Some(where_) = args.get("where") {
        let nested = compile_where(ctx, target, child_alias, where_)?;
        select.and_where(nested);
    }
    let (object, shape) = json_entity_object(ctx, target, child_alias, args)?;
    if to_many {
        select.column(SqlExpr::JsonAgg(Box::new(object)), None);
    } else {
        select.column(object, None);
        select.limit = Some(1);
    }
    Ok((select, shape))
}

/// The wrapped form: an inner ordered/paginated select of the scalar
/// columns, aggregated by the outer query.
fn wrapped_relation_select(
    ctx: &QueryCtx<'_>,
    target: &Model,
    child_alias: &str,
    link: SqlExpr,
    args: &JsonValue,
) -> Result<(Select, EntityShape)> {
    let inner_read = {
        // Reuse the entity compiler for ordering/pagination/distinct, but
        // project every scalar so the outer JSON constructor and nested
        // relations can reference them.
        let mut inner_args = serde_json::Map::new();
        for key in ["where", "orderBy", "take", "skip", "cursor", "distinct"] {
            if let Some(v) = args.get(key) {
                inner_args.insert(key.to_owned(), v.clone());
            }
        }
        compile_entity_select(ctx, target, &JsonValue::Object(inner_args), false)?
    };
    let mut inner = inner_read.select;
    // The inner select was compiled against its own alias; correlate it to
    // the parent through the link predicate rewritten onto that alias.
    let inner_alias = inner.from.alias().to_owned();
    let link = rename_alias(link, child_alias, &inner_alias);
    inner.and_where(link);

    let sub_alias = ctx.fresh_alias("s");
    let mut outer = Select {
        columns: vec![],
        from: FromItem::Subquery {
            select: Box::new(inner),
            alias: sub_alias.clone(),
        },
        joins: vec![],
        where_: None,
        group_by: vec![],
        having: None,
        order_by: vec![],
        limit: None,
        offset: None,
        distinct: None,
    };
    let (object, shape) = json_entity_object_over(ctx, target, &sub_alias, args, &inner_read.shape)?;
    outer.column(SqlExpr::JsonAgg(Box::new(object)), None);
    Ok((outer, shape))
}

/// Renames every column reference under `from` to `to`.
fn rename_alias(expr: SqlExpr, from: &str, to: &str) -> SqlExpr {
    match expr {
        SqlExpr::Column { table, name } if table == from => SqlExpr::Column {
            table: to.to_owned(),
            name,
        },
        SqlExpr::Binary { left, op, right } => SqlExpr::Binary {
            left: Box::new(rename_alias(*left, from, to)),
            op,
            right: Box::new(rename_alias(*right, from, to)),
        },
        SqlExpr::Not(inner) => SqlExpr::Not(Box::new(rename_alias(*inner, from, to))),
        SqlExpr::InSelect {
            expr,
            mut select,
            negated,
        } => {
            if let Some(where_) = select.where_.take() {
                select.where_ = Some(rename_alias(where_, from, to));
            }
            SqlExpr::InSelect {
                expr: Box::new(rename_alias(*expr, from, to)),
                select,
                negated,
            }
        }
        other => other,
    }
}

/// Builds the JSON object for one row of `model` at `alias`, recursing into
/// nested relations.
fn json_entity_object(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
    args: &JsonValue,
) -> Result<(SqlExpr, EntityShape)> {
    let selection = selection_of(ctx, model, args)?;
    let mut pairs = vec![];
    let mut shape = EntityShape {
        model: model.name().to_owned(),
        ..Default::default()
    };
    for (owner, field) in &selection.scalars {
        let (expr, ty) = scalar_expr(ctx, model, alias, owner, field, true)?;
        pairs.push((field.name.clone(), expr));
        shape.scalars.push(ScalarShape {
            name: field.name.clone(),
            alias: field.name.clone(),
            ty,
        });
    }
    for (field, rel_args) in &selection.relations {
        let (expr, rel_shape) = relation_json_column(ctx, model, alias, field, rel_args)?;
        pairs.push((field.name.clone(), reparse_json(ctx, expr)));
        shape.json_relations.push(rel_shape);
    }
    if let Some(count_args) = &selection.count {
        let expr = count_json_column(ctx, model, alias, count_args)?;
        pairs.push(("_count".to_owned(), reparse_json(ctx, expr)));
        shape.count_alias = Some("_count".to_owned());
    }
    Ok((SqlExpr::JsonObject(pairs), shape))
}

/// Like [`json_entity_object`], but reading scalars from the columns of an
/// inner select (`sub_alias`) instead of the entity table.
fn json_entity_object_over(
    ctx: &QueryCtx<'_>,
    model: &Model,
    sub_alias: &str,
    args: &JsonValue,
    inner_shape: &EntityShape,
) -> Result<(SqlExpr, EntityShape)> {
    let selection = selection_of(ctx, model, args)?;
    let mut pairs = vec![];
    let mut shape = EntityShape {
        model: model.name().to_owned(),
        ..Default::default()
    };
    for (_, field) in &selection.scalars {
        let inner_has = inner_shape.scalars.iter().any(|s| s.alias == field.name);
        ensure!(
            inner_has,
            "inner select is missing column `{}`",
            field.name
        );
        let ty = field.type_.scalar().expect("scalar selection");
        pairs.push((
            field.name.clone(),
            SqlExpr::column(sub_alias, &field.name),
        ));
        shape.scalars.push(ScalarShape {
            name: field.name.clone(),
            alias: field.name.clone(),
            ty,
        });
    }
    for (field, rel_args) in &selection.relations {
        let (expr, rel_shape) = relation_json_column(ctx, model, sub_alias, field, rel_args)?;
        pairs.push((field.name.clone(), reparse_json(ctx, expr)));
        shape.json_relations.push(rel_shape);
    }
    if let Some(count_args) = &selection.count {
        let expr = count_json_column(ctx, model, sub_alias, count_args)?;
        pairs.push(("_count".to_owned(), reparse_json(ctx, expr)));
        shape.count_alias = Some("_count".to_owned());
    }
    Ok((SqlExpr::JsonObject(pairs), shape))
}

/// `_count` compiles to a JSON object of scalar COUNT subselects, honoring
/// per-relation `where` narrowing.
fn count_json_column(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
    count_args: &JsonValue,
) -> Result<SqlExpr> {
    let entries: Vec<(String, JsonValue)> = match count_args {
        JsonValue::Bool(true) => model
            .relation_fields()
            .filter(|f| f.is_to_many())
            .map(|f| (f.name.clone(), JsonValue::Bool(true)))
            .collect(),
        JsonValue::Object(map) => {
            let select = map
                .get("select")
                .and_then(|s| s.as_object())
                .context("`_count` expects `{ select: … }`")?;
            select
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        }
        _ => bail!("`_count` expects `true` or `{{ select: … }}`"),
    };
    let mut pairs = vec![];
    for (name, value) in entries {
        let (_, field) = ctx.resolve_field(model, &name)?;
        ensure!(
            field.is_to_many(),
            "`_count` only counts to-many relations"
        );
        let target = ctx.schema.relation_model(field)?;
        let child_alias = ctx.fresh_alias("n");
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
        if let Some(where_) = value.get("where") {
            let nested = compile_where(ctx, target, &child_alias, where_)?;
            count.and_where(nested);
        }
        pairs.push((name, SqlExpr::Subquery(Box::new(count))));
    }
    Ok(SqlExpr::JsonObject(pairs))
}

/// `count`: COUNT(*) over the filtered (and possibly paginated) row set.
pub fn compile_count(ctx: &QueryCtx<'_>, model: &Model, args: &JsonValue) -> Result<Select> {
    let inner_needed = args.get("take").is_some() || args.get("skip").is_some();
    if !inner_needed {
        let alias = ctx.fresh_alias("t");
        let (from, joins) = from_with_base(ctx, model, &alias)?;
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
        select.column(SqlExpr::CountStar, Some("_count"));
        if let Some(where_) = args.get("where") {
            let predicate = compile_where(ctx, model, &alias, where_)?;
            select.and_where(predicate);
        }
        return Ok(select);
    }
    // take/skip narrow the counted window; count over an inner select.
    let mut inner_args = serde_json::Map::new();
    for key in ["where", "orderBy", "take", "skip", "cursor"] {
        if let Some(v) = args.get(key) {
            inner_args.insert(key.to_owned(), v.clone());
        }
    }
    let mut id_select = serde_json::Map::new();
    for id in model.id_fields() {
        id_select.insert(id.clone(), JsonValue::Bool(true));
    }
    inner_args.insert("select".to_owned(), JsonValue::Object(id_select));
    let inner = compile_entity_select(ctx, model, &JsonValue::Object(inner_args), false)?;
    let sub_alias = ctx.fresh_alias("s");
    let mut outer = Select {
        columns: vec![],
        from: FromItem::Subquery {
            select: Box::new(inner.select),
            alias: sub_alias,
        },
        joins: vec![],
        where_: None,
        group_by: vec![],
        having: None,
        order_by: vec![],
        limit: None,
        offset: None,
        distinct: None,
    };
    outer.column(SqlExpr::CountStar, Some("_count"));
    Ok(outer)
}

const AGGREGATE_KEYS: &[(&str, &str)] = &[
    ("_count", "COUNT"),
    ("_avg", "AVG"),
    ("_sum", "SUM"),
    ("_min", "MIN"),
    ("_max", "MAX"),
];

fn aggregate_result_type(op: &str, field_ty: Option<ScalarType>) -> ScalarType {
    match op {
        "_count" => ScalarType::Int,
        "_avg" => ScalarType::Float,
        _ => field_ty.unwrap_or(ScalarType::Float),
    }
}

/// Adds the aggregate selections of `args` to `select`, returning their
/// shapes. Column aliases use `op$field` so the assembler can nest them.
fn push_aggregate_columns(
    ctx: &QueryCtx<'_>,
    model: &Model,
    alias: &str,
    args: &JsonValue,
    select: &mut Select,
) -> Result<Vec<ScalarShape>> {
    let mut shapes = vec![];
    for (key, fn_name) in AGGREGATE_KEYS {
        let Some(fields) = args.get(*key) else {
            continue;
        };
        if *key == "_count" && fields.as_bool() == Some(true) {
            let column_alias = "_count$_all".to_owned();
            select.column(SqlExpr::CountStar, Some(column_alias.as_str()));
            shapes.push(ScalarShape {
                name: column_alias.clone(),
                alias: column_alias,
                ty: ScalarType::Int,
            });
            continue;
        }
        let fields = fields
            .as_object()
            .context("aggregate selections must be objects")?;
        for field_name in fields.keys() {
            let column_alias = format!("{}${}", key, field_name);
            if field_name == "_all" {
                select.column(SqlExpr::CountStar, Some(column_alias.as_str()));
                shapes.push(ScalarShape {
                    name: column_alias.clone(),
                    alias: column_alias,
                    ty: ScalarType::Int,
                });
                continue;
            }
            let (column, field) = column_for(ctx, model, alias, field_name)?;
            let expr = SqlExpr::Fn {
                name: (*fn_name).to_owned(),
                args: vec![column],
            };
            // Averages and sums of decimals come back as text to keep
            // precision.
            let ty = aggregate_result_type(key, field.type_.scalar());
            let expr = match ctx.dialect.select_cast(&ty) {
                Some(cast) => SqlExpr::Cast {
                    expr: Box::new(expr),
                    ty: cast.to_owned(),
                },
                None => expr,
            };
            select.column(expr, Some(column_alias.as_str()));
            shapes.push(ScalarShape {
                name: column_alias.clone(),
                alias: column_alias,
                ty,
            });
        }
    }
    Ok(shapes)
}

/// `aggregate`: aggregate functions over the filtered rows.
pub fn compile_aggregate(
    ctx: &QueryCtx<'_>,
    model: &Model,
    args: &JsonValue,
) -> Result<(Select, Vec<ScalarShape>)> {
    let alias = ctx.fresh_alias("t");
    let (from, joins) = from_with_base(ctx, model, &alias)?;
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
    if let Some(where_) = args.get("where") {
        let predicate = compile_where(ctx, model, &alias, where_)?;
        select.and_where(predicate);
    }
    let shapes = push_aggregate_columns(ctx, model, &alias, args, &mut select)?;
    ensure!(!shapes.is_empty(), "`aggregate` needs at least one selection");
    Ok((select, shapes))
}

/// `groupBy`: grouped columns plus aggregates, with `having` and result
/// ordering.
pub fn compile_group_by(
    ctx: &QueryCtx<'_>,
    model: &Model,
    args: &JsonValue,
) -> Result<(Select, Vec<ScalarShape>)> {
    let alias = ctx.fresh_alias("t");
    let (from, joins) = from_with_base(ctx, model, &alias)?;
    let by: Vec<&str> = args
        .get("by")
        .and_then(|b| b.as_array())
        .context("`by` must be an array")?
        .iter()
        .filter_map(|v| v.as_str())
        .collect();

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
    let mut shapes = vec![];
    for name in &by {
        let (column, field) = column_for(ctx, model, &alias, name)?;
        let ty = field.type_.scalar().expect("grouped fields are scalars");
        let expr = match ctx.dialect.select_cast(&ty) {
            Some(cast) => SqlExpr::Cast {
                expr: Box::new(column.clone()),
                ty: cast.to_owned(),
            },
            None => column.clone(),
        };
        select.column(expr, Some(*name));
        select.group_by.push(column);
        shapes.push(ScalarShape {
            name: (*name).to_owned(),
            alias: (*name).to_owned(),
            ty,
        });
    }
    if let Some(where_) = args.get("where") {
        let predicate = compile_where(ctx, model, &alias, where_)?;
        select.and_where(predicate);
    }
    if let Some(having) = args.get("having") {
        select.having = Some(compile_having(ctx, model, &alias, having)?);
    }
    shapes.extend(push_aggregate_columns(ctx, model, &alias, args, &mut select)?);
    let order = compile_order_by(ctx, model, &alias, args.get("orderBy"), false, false)?;
    select.order_by = order.terms;
    let (take, _) = take_params(args);
    select.limit = take;
    select.offset = args.get("skip").and_then(|s| s.as_u64());
    Ok((select, shapes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{ComputedFields, ExprSlots};
    use crate::schema::tests::blog_schema;
    use crate::sql::{SqlWriter, SqliteDialect, Statement};
    use serde_json::json;

    fn find_sql(model: &str, args: serde_json::Value) -> String {
        let schema = blog_schema();
        let dialect = SqliteDialect;
        let slots = ExprSlots::new();
        let computed = ComputedFields::new();
        let ctx = QueryCtx::new(&schema, &dialect, &slots, &computed);
        let model = schema.model(model).unwrap();
        let read = compile_entity_select(&ctx, model, &args, false).unwrap();
        SqlWriter::compile(&dialect, &Statement::Select(read.select))
            .unwrap()
            .sql
    }

    #[test]
    fn test_default_projection_selects_all_scalars() {
        let sql = find_sql("User", json!({}));
        for col in ["id", "email", "name"] {
            assert!(sql.contains(&format!("\"{}\"", col)), "{}", sql);
        }
        assert!(!sql.contains("json_group_array"), "{}", sql);
        // Deterministic default ordering by id.
        assert!(sql.contains("ORDER BY"), "{}", sql);
    }

    #[test]
    fn test_include_to_many_aggregates_json() {
        let sql = find_sql("User", json!({ "include": { "posts": true } }));
        assert!(sql.contains("json_group_array(json_object("), "{}", sql);
        assert!(sql.contains(r#""authorId" = "#), "{}", sql);
    }

    #[test]
    fn test_included_relation_with_take_wraps_inner_select() {
        let sql = find_sql(
            "User",
            json!({ "include": { "posts": { "take": 2, "orderBy": { "title": "asc" } } } }),
        );
        assert!(sql.contains("LIMIT 2"), "{}", sql);
        // The aggregation runs over an inner, ordered select.
        assert!(sql.contains("FROM (SELECT"), "{}", sql);
    }

    #[test]
    fn test_select_narrows_projection() {
        let sql = find_sql("User", json!({ "select": { "email": true } }));
        assert!(sql.contains(r#""email""#), "{}", sql);
        assert!(!sql.contains(r#""name""#), "{}", sql);
    }

    #[test]
    fn test_count_selection() {
        let sql = find_sql("User", json!({ "include": { "_count": true } }));
        assert!(sql.contains(r#"'posts', "#), "{}", sql);
        assert!(sql.contains("COUNT(*)"), "{}", sql);
    }

    #[test]
    fn test_flat_strategy_for_plain_to_one() {
        // An argument-less to-one include left-joins and aliases columns
        // with the `relation$field` prefix instead of aggregating JSON.
        let sql = find_sql("Post", json!({ "include": { "author": true } }));
        assert!(sql.contains(r#"LEFT JOIN "User""#), "{}", sql);
        assert!(sql.contains(r#" AS "author$email""#), "{}", sql);
        assert!(!sql.contains("json_object("), "{}", sql);
    }

    #[test]
    fn test_to_one_with_args_uses_json() {
        let sql = find_sql(
            "Post",
            json!({ "include": { "author": { "select": { "email": true } } } }),
        );
        assert!(sql.contains("json_object("), "{}", sql);
    }

    #[test]
    fn test_group_by() {
        let schema = blog_schema();
        let dialect = SqliteDialect;
        let slots = ExprSlots::new();
        let computed = ComputedFields::new();
        let ctx = QueryCtx::new(&schema, &dialect, &slots, &computed);
        let model = schema.model("Post").unwrap();
        let (select, shapes) = compile_group_by(
            &ctx,
            model,
            &json!({ "by": ["authorId"], "_count": { "_all": true } }),
        )
        .unwrap();
        let sql = SqlWriter::compile(&dialect, &Statement::Select(select))
            .unwrap()
            .sql;
        assert!(sql.contains("GROUP BY"), "{}", sql);
        assert!(sql.contains(r#""_count$_all""#), "{}", sql);
        assert_eq!(shapes.len(), 2);
    }

    #[test]
    fn test_distinct_rejected_on_sqlite() {
        let schema = blog_schema();
        let dialect = SqliteDialect;
        let slots = ExprSlots::new();
        let computed = ComputedFields::new();
        let ctx = QueryCtx::new(&schema, &dialect, &slots, &computed);
        let model = schema.model("User").unwrap();
        let err = compile_entity_select(&ctx, model, &json!({ "distinct": ["email"] }), false);
        assert!(err.is_err());
    }
}
