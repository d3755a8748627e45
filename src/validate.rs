// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! Structural validation of query arguments. Rejects unknown keys and shape
//! mismatches before any SQL is built; errors carry the operation name and a
//! dotted path into the argument tree.

use crate::error::Error;
use crate::schema::{utils, Field, FieldType, Model, Schema};
use crate::value::{ScalarType, Value};
use crate::Operation;
use serde_json::Value as JsonValue;

const AGGREGATE_OPS: &[&str] = &["_count", "_avg", "_sum", "_min", "_max"];

pub struct Validator<'a> {
    schema: &'a Schema,
    operation: Operation,
}

struct Path {
    segments: Vec<String>,
}

impl Path {
    fn new(root: &str) -> Self {
        Self {
            segments: vec![root.to_owned()],
        }
    }

    fn push(&mut self, segment: impl Into<String>) {
        self.segments.push(segment.into());
    }

    fn pop(&mut self) {
        self.segments.pop();
    }

    fn render(&self) -> String {
        self.segments.join(".")
    }
}

impl<'a> Validator<'a> {
    pub fn new(schema: &'a Schema, operation: Operation) -> Self {
        Self { schema, operation }
    }

    pub fn validate(&self, model: &Model, args: &JsonValue) -> Result<(), Error> {
        let mut path = Path::new(model.name());
        let args = match args {
            JsonValue::Null => return self.check_required_keys(model, None, &mut path),
            JsonValue::Object(map) => map,
            _ => return Err(self.fail(&path, "expected an object")),
        };

        let allowed = self.top_level_keys();
        for key in args.keys() {
            if !allowed.contains(&key.as_str()) {
                path.push(key.clone());
                let err = self.fail(&path, "unknown argument");
                return Err(err);
            }
        }
        if args.contains_key("select") && args.contains_key("include") {
            return Err(self.fail(&path, "`select` and `include` cannot be used together"));
        }
        if args.contains_key("select") && args.contains_key("omit") {
            return Err(self.fail(&path, "`select` and `omit` cannot be used together"));
        }

        self.check_required_keys(model, Some(args), &mut path)?;

        for (key, value) in args {
            path.push(key.clone());
            match key.as_str() {
                "where" => {
                    if self.operation.requires_unique_where() {
                        self.check_where_unique(model, value, &mut path)?;
                    }
                    self.check_where(model, value, &mut path, false)?;
                }
                "select" => self.check_selection(model, value, &mut path, true)?,
                "include" => self.check_selection(model, value, &mut path, false)?,
                "omit" => self.check_omit(model, value, &mut path)?,
                "orderBy" => self.check_order_by(model, value, &mut path, &[])?,
                "cursor" => self.check_cursor(model, value, &mut path)?,
                "take" => self.check_int(value, &mut path, true)?,
                "skip" | "limit" => self.check_int(value, &mut path, false)?,
                "distinct" => self.check_distinct(model, value, &mut path)?,
                "data" => match self.operation {
                    Operation::Create => {
                        self.check_create_data(model, value, &mut path, &[])?
                    }
                    Operation::CreateMany | Operation::CreateManyAndReturn => {
                        self.check_create_many_data(model, value, &mut path, &[])?
                    }
                    _ => self.check_update_data(model, value, &mut path, &[])?,
                },
                "create" => self.check_create_data(model, value, &mut path, &[])?,
                "update" => self.check_update_data(model, value, &mut path, &[])?,
                "skipDuplicates" => self.check_bool(value, &mut path)?,
                "by" => self.check_group_by_fields(model, value, &mut path)?,
                "having" => self.check_where(model, value, &mut path, true)?,
                "_count" | "_avg" | "_sum" | "_min" | "_max" => {
                    self.check_aggregate_selection(model, key, value, &mut path)?
                }
                _ => {}
            }
            path.pop();
        }

        // groupBy may only order by grouped fields or aggregates.
        if self.operation == Operation::GroupBy {
            if let (Some(by), Some(order)) = (args.get("by"), args.get("orderBy")) {
                let by: Vec<&str> = by
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
                    .unwrap_or_default();
                path.push("orderBy");
                self.check_order_by(model, order, &mut path, &by)?;
                path.pop();
            }
        }
        Ok(())
    }

    fn top_level_keys(&self) -> Vec<&'static str> {
        use Operation::*;
        match self.operation {
            FindMany | FindFirst | FindFirstOrThrow => vec![
                "where", "orderBy", "select", "include", "omit", "take", "skip", "cursor",
                "distinct",
            ],
            FindUnique | FindUniqueOrThrow => vec!["where", "select", "include", "omit"],
            Create => vec!["data", "select", "include", "omit"],
            CreateMany => vec!["data", "skipDuplicates"],
            CreateManyAndReturn => vec!["data", "skipDuplicates", "select", "omit"],
            Update => vec!["where", "data", "select", "include", "omit"],
            UpdateMany => vec!["where", "data", "limit"],
            Upsert => vec!["where", "create", "update", "select", "include", "omit"],
            Delete => vec!["where", "select", "include", "omit"],
            DeleteMany => vec!["where", "limit"],
            Count => vec!["where", "take", "skip", "orderBy", "cursor"],
            Aggregate => vec![
                "where", "orderBy", "take", "skip", "cursor", "_count", "_avg", "_sum", "_min",
                "_max",
            ],
            GroupBy => vec![
                "by", "where", "having", "orderBy", "take", "skip", "_count", "_avg", "_sum",
                "_min", "_max",
            ],
        }
    }

    fn check_required_keys(
        &self,
        _model: &Model,
        args: Option<&serde_json::Map<String, JsonValue>>,
        path: &mut Path,
    ) -> Result<(), Error> {
        use Operation::*;
        let required: &[&str] = match self.operation {
            FindUnique | FindUniqueOrThrow | Delete => &["where"],
            Create | CreateMany | CreateManyAndReturn => &["data"],
            Update => &["where", "data"],
            UpdateMany => &["data"],
            Upsert => &["where", "create", "update"],
            GroupBy => &["by"],
            _ => &[],
        };
        for key in required {
            if args.map_or(true, |a| !a.contains_key(*key)) {
                path.push(*key);
                let err = self.fail(path, "missing required argument");
                return Err(err);
            }
        }
        Ok(())
    }

    /// `findUnique`-style wheres must contain at least one whole unique set.
    fn check_where_unique(
        &self,
        model: &Model,
        value: &JsonValue,
        path: &mut Path,
    ) -> Result<(), Error> {
        let Some(map) = value.as_object() else {
            return Err(self.fail(path, "expected an object"));
        };
        let keys: Vec<&str> = map
            .keys()
            .map(String::as_str)
            .filter(|k| !matches!(*k, "AND" | "OR" | "NOT" | "$expr"))
            .collect();
        utils::match_unique_set(model, &keys)
            .map_err(|e| self.fail(path, &e.to_string()))?;
        Ok(())
    }

    fn check_where(
        &self,
        model: &Model,
        value: &JsonValue,
        path: &mut Path,
        aggregates: bool,
    ) -> Result<(), Error> {
        let Some(map) = value.as_object() else {
            return Err(self.fail(path, "expected an object"));
        };
        for (key, value) in map {
            path.push(key.clone());
            match key.as_str() {
                "AND" | "OR" | "NOT" => match value {
                    JsonValue::Array(items) => {
                        for (i, item) in items.iter().enumerate() {
                            path.push(i.to_string());
                            self.check_where(model, item, path, aggregates)?;
                            path.pop();
                        }
                    }
                    JsonValue::Object(_) => self.check_where(model, value, path, aggregates)?,
                    _ => return Err(self.fail(path, "expected an object or an array")),
                },
                "$expr" => {
                    if !value.is_string() {
                        return Err(self.fail(path, "expected the name of a registered predicate"));
                    }
                }
                key if aggregates && AGGREGATE_OPS.contains(&key) => {
                    // eg `_count: { value: { gt: 2 } }` in a having clause.
                    let Some(inner) = value.as_object() else {
                        return Err(self.fail(path, "expected an object"));
                    };
                    for (field_name, filter) in inner {
                        path.push(field_name.clone());
                        let field = self.field(model, field_name, path)?;
                        self.check_scalar_filter(field, filter, path)?;
                        path.pop();
                    }
                }
                field_name => {
                    let field = self.field(model, field_name, path)?;
                    match &field.type_ {
                        FieldType::Relation(_) => {
                            self.check_relation_filter(field, value, path)?
                        }
                        _ => self.check_scalar_filter(field, value, path)?,
                    }
                }
            }
            path.pop();
        }
        Ok(())
    }

    fn check_relation_filter(
        &self,
        field: &Field,
        value: &JsonValue,
        path: &mut Path,
    ) -> Result<(), Error> {
        let target = self
            .schema
            .relation_model(field)
            .map_err(|e| self.fail(path, &e.to_string()))?;
        let Some(map) = value.as_object() else {
            return Err(self.fail(path, "expected an object"));
        };
        if field.is_to_many() {
            for (key, nested) in map {
                path.push(key.clone());
                match key.as_str() {
                    "some" | "every" | "none" => {
                        self.check_where(target, nested, path, false)?
                    }
                    _ => return Err(self.fail(path, "expected `some`, `every` or `none`")),
                }
                path.pop();
            }
        } else {
            let quantified = map.keys().any(|k| k == "is" || k == "isNot");
            if quantified {
                for (key, nested) in map {
                    path.push(key.clone());
                    match key.as_str() {
                        "is" | "isNot" => {
                            if !nested.is_null() {
                                self.check_where(target, nested, path, false)?
                            }
                        }
                        _ => return Err(self.fail(path, "expected `is` or `isNot`")),
                    }
                    path.pop();
                }
            } else {
                // A bare nested where on the related model.
                self.check_where(target, value, path, false)?;
            }
        }
        Ok(())
    }

    fn check_scalar_filter(
        &self,
        field: &Field,
        value: &JsonValue,
        path: &mut Path,
    ) -> Result<(), Error> {
        let Some(map) = value.as_object() else {
            // A literal means implicit equals.
            return self.check_scalar_value(field, value, path);
        };
        let is_string = matches!(field.type_.scalar(), Some(ScalarType::String));
        for (key, inner) in map {
            path.push(key.clone());
            match key.as_str() {
                "equals" => self.check_scalar_value(field, inner, path)?,
                "not" => {
                    if !inner.is_null() {
                        self.check_scalar_filter(field, inner, path)?
                    }
                }
                "in" | "notIn" => {
                    let Some(items) = inner.as_array() else {
                        return Err(self.fail(path, "expected an array"));
                    };
                    for (i, item) in items.iter().enumerate() {
                        path.push(i.to_string());
                        self.check_scalar_value(field, item, path)?;
                        path.pop();
                    }
                }
                "lt" | "lte" | "gt" | "gte" => self.check_scalar_value(field, inner, path)?,
                "contains" | "startsWith" | "endsWith" => {
                    if !is_string {
                        return Err(self.fail(path, "string filter on a non-string field"));
                    }
                    if !inner.is_string() {
                        return Err(self.fail(path, "expected a string"));
                    }
                }
                "mode" => {
                    if inner.as_str() != Some("insensitive") && inner.as_str() != Some("default") {
                        return Err(self.fail(path, "expected `default` or `insensitive`"));
                    }
                }
                "has" | "hasEvery" | "hasSome" | "isEmpty" => {
                    if !field.array {
                        return Err(self.fail(path, "list filter on a non-list field"));
                    }
                }
                _ => return Err(self.fail(path, "unknown filter operator")),
            }
            path.pop();
        }
        Ok(())
    }

    fn check_scalar_value(
        &self,
        field: &Field,
        value: &JsonValue,
        path: &mut Path,
    ) -> Result<(), Error> {
        if value.is_null() {
            if field.optional {
                return Ok(());
            }
            return Err(self.fail(path, "null is not valid for a required field"));
        }
        match &field.type_ {
            FieldType::Enum(name) => {
                let Some(variant) = value.as_str() else {
                    return Err(self.fail(path, "expected an enum variant string"));
                };
                let def = self.schema.get_enum(name);
                if def.map_or(true, |d| !d.variants.iter().any(|v| v == variant)) {
                    return Err(self.fail(path, &format!("`{}` is not a variant of `{}`", variant, name)));
                }
                Ok(())
            }
            FieldType::Scalar(ty) => Value::from_json(ty, value)
                .map(|_| ())
                .map_err(|e| self.fail(path, &e.to_string())),
            FieldType::Relation(_) => Err(self.fail(path, "expected a scalar value")),
        }
    }

    fn check_selection(
        &self,
        model: &Model,
        value: &JsonValue,
        path: &mut Path,
        is_select: bool,
    ) -> Result<(), Error> {
        let Some(map) = value.as_object() else {
            return Err(self.fail(path, "expected an object"));
        };
        for (key, inner) in map {
            path.push(key.clone());
            if key == "_count" {
                self.check_count_selection(model, inner, path)?;
                path.pop();
                continue;
            }
            let field = self.field(model, key, path)?;
            match &field.type_ {
                FieldType::Relation(_) => {
                    let target = self
                        .schema
                        .relation_model(field)
                        .map_err(|e| self.fail(path, &e.to_string()))?;
                    match inner {
                        JsonValue::Bool(_) => {}
                        JsonValue::Object(nested) => {
                            if nested.contains_key("select") && nested.contains_key("include") {
                                return Err(self.fail(
                                    path,
                                    "`select` and `include` cannot be used together",
                                ));
                            }
                            for (nkey, nvalue) in nested {
                                path.push(nkey.clone());
                                match nkey.as_str() {
                                    "select" => {
                                        self.check_selection(target, nvalue, path, true)?
                                    }
                                    "include" => {
                                        self.check_selection(target, nvalue, path, false)?
                                    }
                                    "omit" => self.check_omit(target, nvalue, path)?,
                                    "where" => self.check_where(target, nvalue, path, false)?,
                                    "orderBy" => {
                                        self.check_order_by(target, nvalue, path, &[])?
                                    }
                                    "take" => self.check_int(nvalue, path, true)?,
                                    "skip" => self.check_int(nvalue, path, false)?,
                                    "cursor" => self.check_cursor(target, nvalue, path)?,
                                    "distinct" => self.check_distinct(target, nvalue, path)?,
                                    _ => return Err(self.fail(path, "unknown argument")),
                                }
                                path.pop();
                            }
                        }
                        _ => return Err(self.fail(path, "expected `true` or an object")),
                    }
                }
                _ => {
                    if !is_select {
                        return Err(self.fail(path, "`include` only accepts relations"));
                    }
                    if !inner.is_boolean() {
                        return Err(self.fail(path, "expected a boolean"));
                    }
                }
            }
            path.pop();
        }
        Ok(())
    }

    fn check_count_selection(
        &self,
        model: &Model,
        value: &JsonValue,
        path: &mut Path,
    ) -> Result<(), Error> {
        match value {
            JsonValue::Bool(_) => Ok(()),
            JsonValue::Object(map) => {
                let Some(select) = map.get("select") else {
                    return Err(self.fail(path, "expected `{ select: … }`"));
                };
                let Some(select) = select.as_object() else {
                    return Err(self.fail(path, "expected an object"));
                };
                for (key, inner) in select {
                    path.push(key.clone());
                    let field = self.field(model, key, path)?;
                    if !field.is_to_many() {
                        return Err(self.fail(path, "`_count` only accepts to-many relations"));
                    }
                    let target = self
                        .schema
                        .relation_model(field)
                        .map_err(|e| self.fail(path, &e.to_string()))?;
                    match inner {
                        JsonValue::Bool(_) => {}
                        JsonValue::Object(nested) => {
                            if let Some(where_) = nested.get("where") {
                                path.push("where");
                                self.check_where(target, where_, path, false)?;
                                path.pop();
                            }
                        }
                        _ => return Err(self.fail(path, "expected `true` or an object")),
                    }
                    path.pop();
                }
                Ok(())
            }
            _ => Err(self.fail(path, "expected `true` or an object")),
        }
    }

    fn check_omit(&self, model: &Model, value: &JsonValue, path: &mut Path) -> Result<(), Error> {
        let Some(map) = value.as_object() else {
            return Err(self.fail(path, "expected an object"));
        };
        for (key, inner) in map {
            path.push(key.clone());
            let field = self.field(model, key, path)?;
            if field.is_relation() {
                return Err(self.fail(path, "`omit` only accepts scalar fields"));
            }
            if !inner.is_boolean() {
                return Err(self.fail(path, "expected a boolean"));
            }
            path.pop();
        }
        Ok(())
    }

    fn check_order_by(
        &self,
        model: &Model,
        value: &JsonValue,
        path: &mut Path,
        restrict_to: &[&str],
    ) -> Result<(), Error> {
        match value {
            JsonValue::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    path.push(i.to_string());
                    self.check_order_by(model, item, path, restrict_to)?;
                    path.pop();
                }
                Ok(())
            }
            JsonValue::Object(map) => {
                for (key, inner) in map {
                    path.push(key.clone());
                    if AGGREGATE_OPS.contains(&key.as_str()) {
                        // groupBy result ordering, eg `_count: { id: "asc" }`.
                        if !inner.is_object() {
                            return Err(self.fail(path, "expected an object"));
                        }
                        path.pop();
                        continue;
                    }
                    let field = self.field(model, key, path)?;
                    if !restrict_to.is_empty()
                        && !field.is_relation()
                        && !restrict_to.contains(&key.as_str())
                    {
                        return Err(self.fail(path, "orderBy must use grouped fields"));
                    }
                    match &field.type_ {
                        FieldType::Relation(_) if field.is_to_many() => {
                            let ok = inner
                                .as_object()
                                .map(|m| {
                                    m.len() == 1
                                        && m.get("_count")
                                            .and_then(|v| v.as_str())
                                            .map_or(false, |s| s == "asc" || s == "desc")
                                })
                                .unwrap_or(false);
                            if !ok {
                                return Err(
                                    self.fail(path, "expected `{ _count: \"asc\" | \"desc\" }`")
                                );
                            }
                        }
                        FieldType::Relation(_) => {
                            let target = self
                                .schema
                                .relation_model(field)
                                .map_err(|e| self.fail(path, &e.to_string()))?;
                            self.check_order_by(target, inner, path, &[])?;
                        }
                        _ => self.check_sort_order(field, inner, path)?,
                    }
                    path.pop();
                }
                Ok(())
            }
            _ => Err(self.fail(path, "expected an object or an array")),
        }
    }

    fn check_sort_order(
        &self,
        field: &Field,
        value: &JsonValue,
        path: &mut Path,
    ) -> Result<(), Error> {
        match value {
            JsonValue::String(s) if s == "asc" || s == "desc" => Ok(()),
            JsonValue::Object(map) => {
                for (key, inner) in map {
                    path.push(key.clone());
                    match key.as_str() {
                        "sort" => {
                            if inner.as_str() != Some("asc") && inner.as_str() != Some("desc") {
                                return Err(self.fail(path, "expected `asc` or `desc`"));
                            }
                        }
                        "nulls" => {
                            if !field.optional {
                                return Err(
                                    self.fail(path, "`nulls` requires an optional field")
                                );
                            }
                            if inner.as_str() != Some("first") && inner.as_str() != Some("last") {
                                return Err(self.fail(path, "expected `first` or `last`"));
                            }
                        }
                        _ => return Err(self.fail(path, "unknown argument")),
                    }
                    path.pop();
                }
                Ok(())
            }
            _ => Err(self.fail(path, "expected `asc`, `desc` or `{ sort, nulls }`")),
        }
    }

    fn check_cursor(&self, model: &Model, value: &JsonValue, path: &mut Path) -> Result<(), Error> {
        let Some(map) = value.as_object() else {
            return Err(self.fail(path, "expected an object"));
        };
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        utils::match_unique_set(model, &keys).map_err(|e| self.fail(path, &e.to_string()))?;
        for (key, inner) in map {
            path.push(key.clone());
            let field = self.field(model, key, path)?;
            self.check_scalar_value(field, inner, path)?;
            path.pop();
        }
        Ok(())
    }

    fn check_distinct(
        &self,
        model: &Model,
        value: &JsonValue,
        path: &mut Path,
    ) -> Result<(), Error> {
        let names: Vec<&JsonValue> = match value {
            JsonValue::Array(items) => items.iter().collect(),
            single => vec![single],
        };
        for name in names {
            let Some(name) = name.as_str() else {
                return Err(self.fail(path, "expected field names"));
            };
            path.push(name);
            let field = self.field(model, name, path)?;
            if field.is_relation() {
                return Err(self.fail(path, "`distinct` only accepts scalar fields"));
            }
            path.pop();
        }
        Ok(())
    }

    fn check_group_by_fields(
        &self,
        model: &Model,
        value: &JsonValue,
        path: &mut Path,
    ) -> Result<(), Error> {
        let Some(items) = value.as_array() else {
            return Err(self.fail(path, "expected an array of field names"));
        };
        if items.is_empty() {
            return Err(self.fail(path, "`by` cannot be empty"));
        }
        for item in items {
            let Some(name) = item.as_str() else {
                return Err(self.fail(path, "expected field names"));
            };
            path.push(name);
            let field = self.field(model, name, path)?;
            if field.is_relation() {
                return Err(self.fail(path, "cannot group by a relation"));
            }
            path.pop();
        }
        Ok(())
    }

    fn check_aggregate_selection(
        &self,
        model: &Model,
        op: &str,
        value: &JsonValue,
        path: &mut Path,
    ) -> Result<(), Error> {
        if op == "_count" && value.as_bool() == Some(true) {
            return Ok(());
        }
        let Some(map) = value.as_object() else {
            return Err(self.fail(path, "expected an object of field selections"));
        };
        for (key, inner) in map {
            path.push(key.clone());
            if key != "_all" {
                let field = self.field(model, key, path)?;
                if field.is_relation() {
                    return Err(self.fail(path, "cannot aggregate a relation"));
                }
                let numeric = field
                    .type_
                    .scalar()
                    .map_or(false, |t| t.is_numeric());
                if matches!(op, "_avg" | "_sum") && !numeric {
                    return Err(self.fail(path, "expected a numeric field"));
                }
            }
            if inner.as_bool() != Some(true) {
                return Err(self.fail(path, "expected `true`"));
            }
            path.pop();
        }
        Ok(())
    }

    fn check_create_many_data(
        &self,
        model: &Model,
        value: &JsonValue,
        path: &mut Path,
        exclude: &[String],
    ) -> Result<(), Error> {
        let Some(items) = value.as_array() else {
            return Err(self.fail(path, "expected an array"));
        };
        for (i, item) in items.iter().enumerate() {
            path.push(i.to_string());
            self.check_create_data_shallow(model, item, path, exclude)?;
            path.pop();
        }
        Ok(())
    }

    /// createMany rows may not contain relation manipulations.
    fn check_create_data_shallow(
        &self,
        model: &Model,
        value: &JsonValue,
        path: &mut Path,
        exclude: &[String],
    ) -> Result<(), Error> {
        let Some(map) = value.as_object() else {
            return Err(self.fail(path, "expected an object"));
        };
        for (key, inner) in map {
            path.push(key.clone());
            if exclude.contains(key) {
                return Err(self.fail(path, "field is implied by the parent relation"));
            }
            let field = self.field(model, key, path)?;
            if field.is_relation() {
                return Err(self.fail(path, "relation operations are not allowed here"));
            }
            self.check_scalar_value(field, inner, path)?;
            path.pop();
        }
        Ok(())
    }

    fn check_create_data(
        &self,
        model: &Model,
        value: &JsonValue,
        path: &mut Path,
        exclude: &[String],
    ) -> Result<(), Error> {
        let Some(map) = value.as_object() else {
            return Err(self.fail(path, "expected an object"));
        };
        for (key, inner) in map {
            path.push(key.clone());
            if exclude.contains(key) {
                return Err(self.fail(path, "field is implied by the parent relation"));
            }
            let field = self.field(model, key, path)?;
            match &field.type_ {
                FieldType::Relation(_) => self.check_nested_relation_write(
                    field,
                    inner,
                    path,
                    &["create", "createMany", "connect", "connectOrCreate"],
                )?,
                _ => self.check_scalar_value(field, inner, path)?,
            }
            path.pop();
        }
        Ok(())
    }

    fn check_update_data(
        &self,
        model: &Model,
        value: &JsonValue,
        path: &mut Path,
        exclude: &[String],
    ) -> Result<(), Error> {
        let Some(map) = value.as_object() else {
            return Err(self.fail(path, "expected an object"));
        };
        for (key, inner) in map {
            path.push(key.clone());
            if exclude.contains(key) {
                return Err(self.fail(path, "field is implied by the parent relation"));
            }
            let field = self.field(model, key, path)?;
            match &field.type_ {
                FieldType::Relation(_) => self.check_nested_relation_write(
                    field,
                    inner,
                    path,
                    &[
                        "create",
                        "createMany",
                        "connect",
                        "connectOrCreate",
                        "disconnect",
                        "set",
                        "update",
                        "updateMany",
                        "upsert",
                        "delete",
                        "deleteMany",
                    ],
                )?,
                _ => self.check_update_scalar(field, inner, path)?,
            }
            path.pop();
        }
        Ok(())
    }

    /// A scalar update: a plain value or exactly one atomic updater.
    fn check_update_scalar(
        &self,
        field: &Field,
        value: &JsonValue,
        path: &mut Path,
    ) -> Result<(), Error> {
        let Some(map) = value.as_object() else {
            return self.check_scalar_value(field, value, path);
        };
        // Json fields take objects verbatim.
        if matches!(field.type_.scalar(), Some(ScalarType::Json)) {
            return Ok(());
        }
        let updaters = ["set", "increment", "decrement", "multiply", "divide"];
        let present: Vec<&str> = map
            .keys()
            .map(String::as_str)
            .filter(|k| updaters.contains(k))
            .collect();
        if present.len() != 1 || map.len() != 1 {
            return Err(self.fail(
                path,
                "expected exactly one of `set`, `increment`, `decrement`, `multiply`, `divide`",
            ));
        }
        let op = present[0];
        let inner = &map[op];
        if op == "set" {
            return self.check_scalar_value(field, inner, path);
        }
        let numeric = field.type_.scalar().map_or(false, |t| t.is_numeric());
        if !numeric {
            return Err(self.fail(path, "atomic updaters require a numeric field"));
        }
        if !inner.is_number() {
            return Err(self.fail(path, "expected a number"));
        }
        Ok(())
    }

    fn check_nested_relation_write(
        &self,
        field: &Field,
        value: &JsonValue,
        path: &mut Path,
        allowed: &[&str],
    ) -> Result<(), Error> {
        let target = self
            .schema
            .relation_model(field)
            .map_err(|e| self.fail(path, &e.to_string()))?;
        let Some(map) = value.as_object() else {
            return Err(self.fail(path, "expected a relation operation object"));
        };
        // Exclude the opposite relation field and any FK fields pointing back
        // from nested inputs; the parent linkage decides them.
        let mut exclude: Vec<String> = vec![];
        if let Some(opposite) = field.opposite.as_ref() {
            exclude.push(opposite.clone());
            if let Ok(opposite) = self.schema.opposite_field(field) {
                exclude.extend(opposite.fk_fields().iter().cloned());
            }
        }
        let to_many = field.is_to_many();
        for (key, inner) in map {
            path.push(key.clone());
            if !allowed.contains(&key.as_str()) {
                return Err(self.fail(path, "unknown relation operation"));
            }
            match key.as_str() {
                "create" => match inner {
                    JsonValue::Array(items) if to_many => {
                        for (i, item) in items.iter().enumerate() {
                            path.push(i.to_string());
                            self.check_create_data(target, item, path, &exclude)?;
                            path.pop();
                        }
                    }
                    _ => self.check_create_data(target, inner, path, &exclude)?,
                },
                "createMany" => {
                    let Some(data) = inner.get("data") else {
                        return Err(self.fail(path, "expected `{ data: […] }`"));
                    };
                    path.push("data");
                    self.check_create_many_data(target, data, path, &exclude)?;
                    path.pop();
                }
                "connect" | "disconnect" => match inner {
                    JsonValue::Bool(_) if key == "disconnect" && !to_many => {}
                    JsonValue::Array(items) if to_many => {
                        for (i, item) in items.iter().enumerate() {
                            path.push(i.to_string());
                            self.check_where_unique(target, item, path)?;
                            path.pop();
                        }
                    }
                    _ => self.check_where_unique(target, inner, path)?,
                },
                "set" => {
                    let items: Vec<&JsonValue> = match inner {
                        JsonValue::Array(items) => items.iter().collect(),
                        single => vec![single],
                    };
                    for (i, item) in items.into_iter().enumerate() {
                        path.push(i.to_string());
                        self.check_where_unique(target, item, path)?;
                        path.pop();
                    }
                }
                "connectOrCreate" => {
                    let items: Vec<&JsonValue> = match inner {
                        JsonValue::Array(items) if to_many => items.iter().collect(),
                        single => vec![single],
                    };
                    for (i, item) in items.into_iter().enumerate() {
                        path.push(i.to_string());
                        let (Some(where_), Some(create)) = (item.get("where"), item.get("create"))
                        else {
                            return Err(self.fail(path, "expected `{ where, create }`"));
                        };
                        path.push("where");
                        self.check_where_unique(target, where_, path)?;
                        path.pop();
                        path.push("create");
                        self.check_create_data(target, create, path, &exclude)?;
                        path.pop();
                        path.pop();
                    }
                }
                "update" => {
                    let items: Vec<&JsonValue> = match inner {
                        JsonValue::Array(items) if to_many => items.iter().collect(),
                        single => vec![single],
                    };
                    for (i, item) in items.into_iter().enumerate() {
                        path.push(i.to_string());
                        if to_many {
                            let (Some(where_), Some(data)) = (item.get("where"), item.get("data"))
                            else {
                                return Err(self.fail(path, "expected `{ where, data }`"));
                            };
                            path.push("where");
                            self.check_where_unique(target, where_, path)?;
                            path.pop();
                            path.push("data");
                            self.check_update_data(target, data, path, &exclude)?;
                            path.pop();
                        } else {
                            // To-one nested update takes the patch directly,
                            // or `{ where?, data }`.
                            let data = item.get("data").unwrap_or(item);
                            self.check_update_data(target, data, path, &exclude)?;
                        }
                        path.pop();
                    }
                }
                "updateMany" => {
                    let items: Vec<&JsonValue> = match inner {
                        JsonValue::Array(items) => items.iter().collect(),
                        single => vec![single],
                    };
                    for (i, item) in items.into_iter().enumerate() {
                        path.push(i.to_string());
                        let Some(data) = item.get("data") else {
                            return Err(self.fail(path, "expected `{ where?, data }`"));
                        };
                        if let Some(where_) = item.get("where") {
                            path.push("where");
                            self.check_where(target, where_, path, false)?;
                            path.pop();
                        }
                        path.push("data");
                        self.check_update_data(target, data, path, &exclude)?;
                        path.pop();
                        path.pop();
                    }
                }
                "upsert" => {
                    let items: Vec<&JsonValue> = match inner {
                        JsonValue::Array(items) if to_many => items.iter().collect(),
                        single => vec![single],
                    };
                    for (i, item) in items.into_iter().enumerate() {
                        path.push(i.to_string());
                        let (Some(create), Some(update)) =
                            (item.get("create"), item.get("update"))
                        else {
                            return Err(self.fail(path, "expected `{ where?, create, update }`"));
                        };
                        if to_many {
                            let Some(where_) = item.get("where") else {
                                return Err(self.fail(path, "expected `{ where, create, update }`"));
                            };
                            path.push("where");
                            self.check_where_unique(target, where_, path)?;
                            path.pop();
                        }
                        path.push("create");
                        self.check_create_data(target, create, path, &exclude)?;
                        path.pop();
                        path.push("update");
                        self.check_update_data(target, update, path, &exclude)?;
                        path.pop();
                        path.pop();
                    }
                }
                "delete" => match inner {
                    JsonValue::Bool(_) if !to_many => {}
                    JsonValue::Array(items) if to_many => {
                        for (i, item) in items.iter().enumerate() {
                            path.push(i.to_string());
                            self.check_where_unique(target, item, path)?;
                            path.pop();
                        }
                    }
                    _ => self.check_where_unique(target, inner, path)?,
                },
                "deleteMany" => {
                    let items: Vec<&JsonValue> = match inner {
                        JsonValue::Array(items) => items.iter().collect(),
                        single => vec![single],
                    };
                    for (i, item) in items.into_iter().enumerate() {
                        path.push(i.to_string());
                        self.check_where(target, item, path, false)?;
                        path.pop();
                    }
                }
                _ => {}
            }
            path.pop();
        }
        Ok(())
    }

    fn check_int(&self, value: &JsonValue, path: &mut Path, allow_negative: bool) -> Result<(), Error> {
        let Some(n) = value.as_i64() else {
            return Err(self.fail(path, "expected an integer"));
        };
        if !allow_negative && n < 0 {
            return Err(self.fail(path, "expected a non-negative integer"));
        }
        Ok(())
    }

    fn check_bool(&self, value: &JsonValue, path: &mut Path) -> Result<(), Error> {
        if !value.is_boolean() {
            return Err(self.fail(path, "expected a boolean"));
        }
        Ok(())
    }

    fn field<'m>(&self, model: &'m Model, name: &str, path: &Path) -> Result<&'m Field, Error> {
        model
            .get_field(name)
            .ok_or_else(|| self.fail(path, &format!("`{}` has no field `{}`", model.name(), name)))
    }

    fn fail(&self, path: &Path, message: &str) -> Error {
        Error::validation(self.operation.name(), path.render(), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::blog_schema;
    use serde_json::json;

    fn validate(op: Operation, model: &str, args: serde_json::Value) -> Result<(), Error> {
        let schema = blog_schema();
        let validator = Validator::new(&schema, op);
        validator.validate(schema.model(model).unwrap(), &args)
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = validate(Operation::FindMany, "User", json!({ "wherex": {} })).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("findMany"), "{}", text);
        assert!(text.contains("User.wherex"), "{}", text);
    }

    #[test]
    fn test_unknown_field_in_where() {
        let err = validate(
            Operation::FindMany,
            "User",
            json!({ "where": { "nope": 1 } }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("User.where.nope"));
    }

    #[test]
    fn test_select_include_conflict() {
        let err = validate(
            Operation::FindMany,
            "User",
            json!({ "select": { "id": true }, "include": { "posts": true } }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot be used together"));
    }

    #[test]
    fn test_find_unique_requires_unique_set() {
        assert!(validate(
            Operation::FindUnique,
            "User",
            json!({ "where": { "name": "x" } })
        )
        .is_err());
        assert!(validate(
            Operation::FindUnique,
            "User",
            json!({ "where": { "email": "x@y.z" } })
        )
        .is_ok());
        assert!(validate(Operation::FindUnique, "User", json!({})).is_err());
    }

    #[test]
    fn test_relation_filter_shape() {
        assert!(validate(
            Operation::FindMany,
            "User",
            json!({ "where": { "posts": { "some": { "title": "t" } } } })
        )
        .is_ok());
        assert!(validate(
            Operation::FindMany,
            "User",
            json!({ "where": { "posts": { "any": {} } } })
        )
        .is_err());
        // To-one accepts a bare nested where.
        assert!(validate(
            Operation::FindMany,
            "Post",
            json!({ "where": { "author": { "email": "a@b.c" } } })
        )
        .is_ok());
    }

    #[test]
    fn test_scalar_filter_types() {
        assert!(validate(
            Operation::FindMany,
            "Post",
            json!({ "where": { "published": { "equals": "yes" } } })
        )
        .is_err());
        assert!(validate(
            Operation::FindMany,
            "Post",
            json!({ "where": { "published": true } })
        )
        .is_ok());
        // String operators rejected on booleans.
        assert!(validate(
            Operation::FindMany,
            "Post",
            json!({ "where": { "published": { "contains": "x" } } })
        )
        .is_err());
    }

    #[test]
    fn test_order_by() {
        assert!(validate(
            Operation::FindMany,
            "User",
            json!({ "orderBy": { "email": "asc" } })
        )
        .is_ok());
        assert!(validate(
            Operation::FindMany,
            "User",
            json!({ "orderBy": { "posts": { "_count": "desc" } } })
        )
        .is_ok());
        assert!(validate(
            Operation::FindMany,
            "User",
            json!({ "orderBy": { "email": "upwards" } })
        )
        .is_err());
        // `nulls` needs an optional field.
        assert!(validate(
            Operation::FindMany,
            "User",
            json!({ "orderBy": { "name": { "sort": "asc", "nulls": "last" } } })
        )
        .is_ok());
        assert!(validate(
            Operation::FindMany,
            "User",
            json!({ "orderBy": { "email": { "sort": "asc", "nulls": "last" } } })
        )
        .is_err());
    }

    #[test]
    fn test_atomic_updaters() {
        assert!(validate(
            Operation::Update,
            "Post",
            json!({ "where": { "id": "p1" }, "data": { "title": { "set": "t" } } })
        )
        .is_ok());
        assert!(validate(
            Operation::Update,
            "Post",
            json!({ "where": { "id": "p1" }, "data": { "title": { "set": "a", "increment": 1 } } })
        )
        .is_err());
        assert!(validate(
            Operation::Update,
            "Post",
            json!({ "where": { "id": "p1" }, "data": { "title": { "increment": 1 } } })
        )
        .is_err());
    }

    #[test]
    fn test_nested_create_excludes_backlink() {
        // `authorId` is implied by the parent relation and must be rejected.
        let err = validate(
            Operation::Create,
            "User",
            json!({
                "data": {
                    "email": "a@b.c",
                    "posts": { "create": { "title": "t", "authorId": "u1" } }
                }
            }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("implied by the parent relation"));
    }

    #[test]
    fn test_group_by_order_restriction() {
        assert!(validate(
            Operation::GroupBy,
            "Post",
            json!({ "by": ["authorId"], "orderBy": { "authorId": "asc" } })
        )
        .is_ok());
        assert!(validate(
            Operation::GroupBy,
            "Post",
            json!({ "by": ["authorId"], "orderBy": { "title": "asc" } })
        )
        .is_err());
    }

    #[test]
    fn test_empty_in_is_structurally_fine() {
        assert!(validate(
            Operation::FindMany,
            "Post",
            json!({ "where": { "title": { "in": [] } } })
        )
        .is_ok());
    }
}
