// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! Folds flat rows and JSON-aggregated columns back into the nested entity
//! trees the caller asked for, applying the dialect's output transforms to
//! every embedded scalar.

use crate::query::{EntityShape, ScalarShape};
use crate::sql::Dialect;
use crate::JsonObject;
use anyhow::{Context as _, Result};
use serde_json::Value as JsonValue;

/// Assembles one raw row (column alias → raw value) into an entity object.
pub fn assemble_row(
    dialect: &dyn Dialect,
    shape: &EntityShape,
    raw: &JsonObject,
) -> Result<JsonValue> {
    let mut out = JsonObject::new();

    for scalar in &shape.scalars {
        let value = raw.get(&scalar.alias).cloned().unwrap_or(JsonValue::Null);
        out.insert(
            scalar.name.clone(),
            dialect.transform_output(&scalar.ty, value)?,
        );
    }

    for flat in &shape.flat_relations {
        // All id columns NULL means there was no related row.
        let absent = flat
            .id_aliases
            .iter()
            .all(|alias| raw.get(alias).map_or(true, JsonValue::is_null));
        if absent {
            out.insert(flat.name.clone(), JsonValue::Null);
            continue;
        }
        let mut nested = JsonObject::new();
        for scalar in &flat.nested.scalars {
            let value = raw.get(&scalar.alias).cloned().unwrap_or(JsonValue::Null);
            nested.insert(
                scalar.name.clone(),
                dialect.transform_output(&scalar.ty, value)?,
            );
        }
        out.insert(flat.name.clone(), JsonValue::Object(nested));
    }

    for rel in &shape.json_relations {
        let value = parse_json_column(raw.get(&rel.alias))?;
        let value = transform_tree(dialect, &rel.nested, value, rel.to_many)?;
        out.insert(rel.name.clone(), value);
    }

    if let Some(alias) = &shape.count_alias {
        let value = parse_json_column(raw.get(alias))?;
        out.insert("_count".to_owned(), value);
    }

    // `$delegate$<Model>` columns spread into the parent object when the
    // descendant row exists.
    for delegate in &shape.delegates {
        let value = parse_json_column(raw.get(&delegate.alias))?;
        let JsonValue::Object(fields) = value else {
            continue;
        };
        let present = fields.values().any(|v| !v.is_null());
        if !present {
            continue;
        }
        let transformed =
            transform_object(dialect, &delegate.nested, JsonValue::Object(fields))?;
        if let JsonValue::Object(fields) = transformed {
            for (key, value) in fields {
                out.insert(key, value);
            }
        }
    }

    Ok(JsonValue::Object(out))
}

pub fn assemble_rows(
    dialect: &dyn Dialect,
    shape: &EntityShape,
    rows: &[JsonObject],
) -> Result<Vec<JsonValue>> {
    rows.iter().map(|row| assemble_row(dialect, shape, row)).collect()
}

/// JSON-strategy columns arrive as text on some providers.
fn parse_json_column(value: Option<&JsonValue>) -> Result<JsonValue> {
    match value {
        None => Ok(JsonValue::Null),
        Some(JsonValue::String(text)) => {
            serde_json::from_str(text).context("malformed JSON column content")
        }
        Some(other) => Ok(other.clone()),
    }
}

/// Applies output transforms through a parsed JSON tree.
fn transform_tree(
    dialect: &dyn Dialect,
    shape: &EntityShape,
    value: JsonValue,
    to_many: bool,
) -> Result<JsonValue> {
    if to_many {
        let JsonValue::Array(items) = value else {
            // No rows aggregate to an empty array.
            return Ok(JsonValue::Array(vec![]));
        };
        let items = items
            .into_iter()
            .map(|item| transform_object(dialect, shape, item))
            .collect::<Result<Vec<_>>>()?;
        return Ok(JsonValue::Array(items));
    }
    if value.is_null() {
        return Ok(JsonValue::Null);
    }
    transform_object(dialect, shape, value)
}

fn transform_object(
    dialect: &dyn Dialect,
    shape: &EntityShape,
    value: JsonValue,
) -> Result<JsonValue> {
    let JsonValue::Object(mut fields) = value else {
        return Ok(value);
    };
    for scalar in &shape.scalars {
        if let Some(raw) = fields.remove(&scalar.name) {
            fields.insert(scalar.name.clone(), dialect.transform_output(&scalar.ty, raw)?);
        }
    }
    for rel in &shape.json_relations {
        if let Some(raw) = fields.remove(&rel.name) {
            let parsed = match raw {
                JsonValue::String(text) => serde_json::from_str(&text)
                    .context("malformed nested JSON relation content")?,
                other => other,
            };
            fields.insert(
                rel.name.clone(),
                transform_tree(dialect, &rel.nested, parsed, rel.to_many)?,
            );
        }
    }
    Ok(JsonValue::Object(fields))
}

/// Folds an `aggregate`/`groupBy` row: `op$field` aliases nest into
/// `{ op: { field: value } }`, plain aliases stay top-level.
pub fn nest_aggregate_row(
    dialect: &dyn Dialect,
    shapes: &[ScalarShape],
    raw: &JsonObject,
) -> Result<JsonValue> {
    let mut out = JsonObject::new();
    for shape in shapes {
        let value = raw.get(&shape.alias).cloned().unwrap_or(JsonValue::Null);
        let value = dialect.transform_output(&shape.ty, value)?;
        match shape.alias.split_once('$') {
            Some((op, field)) => {
                let entry = out
                    .entry(op.to_owned())
                    .or_insert_with(|| JsonValue::Object(JsonObject::new()));
                if let JsonValue::Object(map) = entry {
                    map.insert(field.to_owned(), value);
                }
            }
            None => {
                out.insert(shape.name.clone(), value);
            }
        }
    }
    Ok(JsonValue::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{EntityShape, FlatRelationShape, JsonRelationShape, ScalarShape};
    use crate::sql::SqliteDialect;
    use crate::value::ScalarType;
    use serde_json::json;

    fn user_shape() -> EntityShape {
        EntityShape {
            model: "User".into(),
            scalars: vec![
                ScalarShape {
                    name: "id".into(),
                    alias: "id".into(),
                    ty: ScalarType::String,
                },
                ScalarShape {
                    name: "active".into(),
                    alias: "active".into(),
                    ty: ScalarType::Boolean,
                },
            ],
            json_relations: vec![JsonRelationShape {
                name: "posts".into(),
                alias: "posts".into(),
                to_many: true,
                optional: false,
                nested: EntityShape {
                    model: "Post".into(),
                    scalars: vec![
                        ScalarShape {
                            name: "title".into(),
                            alias: "title".into(),
                            ty: ScalarType::String,
                        },
                        ScalarShape {
                            name: "published".into(),
                            alias: "published".into(),
                            ty: ScalarType::Boolean,
                        },
                    ],
                    ..Default::default()
                },
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_json_relation_parsing_and_transforms() {
        let dialect = SqliteDialect;
        let mut raw = crate::JsonObject::new();
        raw.insert("id".into(), json!("u1"));
        raw.insert("active".into(), json!(1));
        raw.insert(
            "posts".into(),
            json!(r#"[{"title":"a","published":1},{"title":"b","published":0}]"#),
        );
        let out = assemble_row(&dialect, &user_shape(), &raw).unwrap();
        assert_eq!(
            out,
            json!({
                "id": "u1",
                "active": true,
                "posts": [
                    { "title": "a", "published": true },
                    { "title": "b", "published": false }
                ]
            })
        );
    }

    #[test]
    fn test_empty_to_many_is_empty_array() {
        let dialect = SqliteDialect;
        let mut raw = crate::JsonObject::new();
        raw.insert("id".into(), json!("u1"));
        raw.insert("active".into(), json!(0));
        raw.insert("posts".into(), JsonValue::Null);
        let out = assemble_row(&dialect, &user_shape(), &raw).unwrap();
        assert_eq!(out["posts"], json!([]));
    }

    #[test]
    fn test_flat_to_one_null_detection() {
        let dialect = SqliteDialect;
        let shape = EntityShape {
            model: "Post".into(),
            scalars: vec![ScalarShape {
                name: "id".into(),
                alias: "id".into(),
                ty: ScalarType::String,
            }],
            flat_relations: vec![FlatRelationShape {
                name: "author".into(),
                optional: true,
                id_aliases: vec!["author$id".into()],
                nested: EntityShape {
                    model: "User".into(),
                    scalars: vec![
                        ScalarShape {
                            name: "id".into(),
                            alias: "author$id".into(),
                            ty: ScalarType::String,
                        },
                        ScalarShape {
                            name: "email".into(),
                            alias: "author$email".into(),
                            ty: ScalarType::String,
                        },
                    ],
                    ..Default::default()
                },
            }],
            ..Default::default()
        };

        let mut raw = crate::JsonObject::new();
        raw.insert("id".into(), json!("p1"));
        raw.insert("author$id".into(), JsonValue::Null);
        raw.insert("author$email".into(), JsonValue::Null);
        let out = assemble_row(&dialect, &shape, &raw).unwrap();
        assert_eq!(out["author"], JsonValue::Null);

        raw.insert("author$id".into(), json!("u1"));
        raw.insert("author$email".into(), json!("a@b.c"));
        let out = assemble_row(&dialect, &shape, &raw).unwrap();
        assert_eq!(out["author"], json!({ "id": "u1", "email": "a@b.c" }));
    }

    #[test]
    fn test_nest_aggregate_row() {
        let dialect = SqliteDialect;
        let shapes = vec![
            ScalarShape {
                name: "authorId".into(),
                alias: "authorId".into(),
                ty: ScalarType::String,
            },
            ScalarShape {
                name: "_count$_all".into(),
                alias: "_count$_all".into(),
                ty: ScalarType::Int,
            },
            ScalarShape {
                name: "_avg$score".into(),
                alias: "_avg$score".into(),
                ty: ScalarType::Float,
            },
        ];
        let mut raw = crate::JsonObject::new();
        raw.insert("authorId".into(), json!("u1"));
        raw.insert("_count$_all".into(), json!(3));
        raw.insert("_avg$score".into(), json!(1.5));
        let out = nest_aggregate_row(&dialect, &shapes, &raw).unwrap();
        assert_eq!(
            out,
            json!({ "authorId": "u1", "_count": { "_all": 3 }, "_avg": { "score": 1.5 } })
        );
    }

    #[test]
    fn test_delegate_columns_spread() {
        let dialect = SqliteDialect;
        let shape = EntityShape {
            model: "Content".into(),
            scalars: vec![ScalarShape {
                name: "id".into(),
                alias: "id".into(),
                ty: ScalarType::String,
            }],
            delegates: vec![crate::query::DelegateShape {
                model: "Video".into(),
                alias: "$delegate$Video".into(),
                nested: EntityShape {
                    model: "Video".into(),
                    scalars: vec![ScalarShape {
                        name: "duration".into(),
                        alias: "duration".into(),
                        ty: ScalarType::Int,
                    }],
                    ..Default::default()
                },
            }],
            ..Default::default()
        };
        let mut raw = crate::JsonObject::new();
        raw.insert("id".into(), json!("c1"));
        raw.insert("$delegate$Video".into(), json!(r#"{"duration":120}"#));
        let out = assemble_row(&dialect, &shape, &raw).unwrap();
        assert_eq!(out, json!({ "id": "c1", "duration": 120 }));

        raw.insert("$delegate$Video".into(), json!(r#"{"duration":null}"#));
        let out = assemble_row(&dialect, &shape, &raw).unwrap();
        assert_eq!(out, json!({ "id": "c1" }));
    }
}
