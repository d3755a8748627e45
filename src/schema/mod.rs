// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

pub mod utils;

use crate::expr::Expr;
use crate::value::ScalarType;
use anyhow::{anyhow, ensure, Result};
use indexmap::IndexMap;
use std::sync::Arc;

/// The in-memory model of the data schema: entities, fields, relations,
/// unique keys, enums, access policies. Built once at startup by the code
/// that consumes the schema definition language, immutable afterwards.
#[derive(Debug)]
pub struct Schema {
    models: IndexMap<String, Model>,
    enums: IndexMap<String, EnumDef>,
}

#[derive(Debug, Clone)]
pub struct EnumDef {
    pub name: String,
    pub variants: Vec<String>,
}

#[derive(Debug)]
pub struct Model {
    name: String,
    db_table: String,
    fields: IndexMap<String, Field>,
    id_fields: Vec<String>,
    /// Unique alternatives beyond the id: each entry is a whole field set.
    unique_sets: Vec<Vec<String>>,
    policies: Vec<Policy>,
    base_model: Option<String>,
    is_delegate: bool,
    /// Transitive closure of models that declare this one as their base.
    descendants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Scalar(ScalarType),
    Enum(String),
    Relation(String),
}

impl FieldType {
    pub fn name(&self) -> &str {
        match self {
            FieldType::Scalar(s) => s.name(),
            FieldType::Enum(name) | FieldType::Relation(name) => name,
        }
    }

    /// The scalar type used at the value layer; enums travel as text.
    pub fn scalar(&self) -> Option<ScalarType> {
        match self {
            FieldType::Scalar(s) => Some(s.clone()),
            FieldType::Enum(_) => Some(ScalarType::Enum),
            FieldType::Relation(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generator {
    Cuid,
    Cuid2,
    Uuid4,
    Uuid7,
    Nanoid,
    Autoincrement,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    /// A literal, in the JSON surface representation of the field type.
    Literal(serde_json::Value),
    /// `now()` at insert time.
    Now,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationInfo {
    /// Disambiguates multiple relations between the same pair of models.
    pub name: Option<String>,
    /// FK fields on this model. Non-empty iff this side owns the FK.
    pub fields: Vec<String>,
    /// Referenced fields on the target, pairwise with `fields`.
    pub references: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub type_: FieldType,
    pub optional: bool,
    pub array: bool,
    pub is_id: bool,
    pub unique: bool,
    pub updated_at: bool,
    pub default: Option<DefaultValue>,
    pub generator: Option<Generator>,
    pub relation: Option<RelationInfo>,
    pub computed: bool,
    /// Name of the matching relation field on the target model. Filled in
    /// when the schema is built.
    pub opposite: Option<String>,
}

impl Field {
    pub fn scalar(name: impl Into<String>, ty: ScalarType) -> Self {
        Self::new(name, FieldType::Scalar(ty))
    }

    pub fn enum_(name: impl Into<String>, enum_name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Enum(enum_name.into()))
    }

    pub fn relation(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, FieldType::Relation(target.into()))
    }

    fn new(name: impl Into<String>, type_: FieldType) -> Self {
        Self {
            name: name.into(),
            type_,
            optional: false,
            array: false,
            is_id: false,
            unique: false,
            updated_at: false,
            default: None,
            generator: None,
            relation: None,
            computed: false,
            opposite: None,
        }
    }

    pub fn id(mut self) -> Self {
        self.is_id = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn array(mut self) -> Self {
        self.array = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn updated_at(mut self) -> Self {
        self.updated_at = true;
        self
    }

    pub fn computed(mut self) -> Self {
        self.computed = true;
        self
    }

    pub fn default(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }

    pub fn generator(mut self, generator: Generator) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Declares this side the FK owner: `fields` on this model reference
    /// `references` on the target.
    pub fn references(mut self, fields: &[&str], references: &[&str]) -> Self {
        let info = self.relation.get_or_insert_with(Default::default);
        info.fields = fields.iter().map(|s| s.to_string()).collect();
        info.references = references.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn relation_name(mut self, name: impl Into<String>) -> Self {
        self.relation.get_or_insert_with(Default::default).name = Some(name.into());
        self
    }

    pub fn is_relation(&self) -> bool {
        matches!(self.type_, FieldType::Relation(_))
    }

    pub fn is_to_many(&self) -> bool {
        self.is_relation() && self.array
    }

    pub fn relation_target(&self) -> Option<&str> {
        match &self.type_ {
            FieldType::Relation(target) => Some(target),
            _ => None,
        }
    }

    /// FK fields this side declares, if it owns the FK.
    pub fn fk_fields(&self) -> &[String] {
        self.relation.as_ref().map(|r| &r.fields[..]).unwrap_or(&[])
    }
}

/// Allow grants visibility, deny takes it away; deny wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOperation {
    Create,
    Read,
    Update,
    PostUpdate,
    Delete,
    All,
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub kind: PolicyKind,
    pub operations: Vec<PolicyOperation>,
    pub expression: Expr,
}

impl Policy {
    pub fn allow(operations: &[PolicyOperation], expression: Expr) -> Self {
        Self {
            kind: PolicyKind::Allow,
            operations: operations.to_vec(),
            expression,
        }
    }

    pub fn deny(operations: &[PolicyOperation], expression: Expr) -> Self {
        Self {
            kind: PolicyKind::Deny,
            operations: operations.to_vec(),
            expression,
        }
    }

    pub fn applies_to(&self, op: PolicyOperation) -> bool {
        self.operations.iter().any(|o| {
            *o == op || (*o == PolicyOperation::All && op != PolicyOperation::PostUpdate)
        })
    }
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            db_table: name.clone(),
            name,
            fields: IndexMap::new(),
            id_fields: vec![],
            unique_sets: vec![],
            policies: vec![],
            base_model: None,
            is_delegate: false,
            descendants: vec![],
        }
    }

    pub fn table(mut self, db_table: impl Into<String>) -> Self {
        self.db_table = db_table.into();
        self
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.insert(field.name.clone(), field);
        self
    }

    pub fn compound_unique(mut self, fields: &[&str]) -> Self {
        self.unique_sets
            .push(fields.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn base(mut self, base_model: impl Into<String>) -> Self {
        self.base_model = Some(base_model.into());
        self
    }

    pub fn delegate(mut self) -> Self {
        self.is_delegate = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db_table(&self) -> &str {
        &self.db_table
    }

    pub fn all_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.values()
    }

    pub fn scalar_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.values().filter(|f| !f.is_relation())
    }

    pub fn relation_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.values().filter(|f| f.is_relation())
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn get_field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn field_or_err(&self, name: &str) -> Result<&Field> {
        self.get_field(name)
            .ok_or_else(|| anyhow!("model `{}` has no field `{}`", self.name, name))
    }

    pub fn id_fields(&self) -> &[String] {
        &self.id_fields
    }

    pub fn unique_sets(&self) -> &[Vec<String>] {
        &self.unique_sets
    }

    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    pub fn has_policies(&self) -> bool {
        !self.policies.is_empty()
    }

    pub fn base_model(&self) -> Option<&str> {
        self.base_model.as_deref()
    }

    pub fn is_delegate(&self) -> bool {
        self.is_delegate
    }

    pub fn descendants(&self) -> &[String] {
        &self.descendants
    }

    /// Whether a scalar field belongs to some FK of a relation on this model.
    pub fn is_foreign_key(&self, field_name: &str) -> bool {
        self.relation_fields()
            .any(|rel| rel.fk_fields().iter().any(|f| f == field_name))
    }
}

pub struct SchemaBuilder {
    models: Vec<Model>,
    enums: Vec<EnumDef>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self {
            models: vec![],
            enums: vec![],
        }
    }

    pub fn model(mut self, model: Model) -> Self {
        self.models.push(model);
        self
    }

    pub fn enum_def(mut self, name: impl Into<String>, variants: &[&str]) -> Self {
        self.enums.push(EnumDef {
            name: name.into(),
            variants: variants.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// Validates cross-model consistency and freezes the schema.
    pub fn build(self) -> Result<Arc<Schema>> {
        let mut models: IndexMap<String, Model> = IndexMap::new();
        for model in self.models {
            ensure!(
                !models.contains_key(model.name()),
                "duplicate model `{}`",
                model.name()
            );
            models.insert(model.name.clone(), model);
        }
        let enums: IndexMap<String, EnumDef> = self
            .enums
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect();

        // Derive id field lists and check that every model is addressable.
        for model in models.values_mut() {
            model.id_fields = model
                .fields
                .values()
                .filter(|f| f.is_id)
                .map(|f| f.name.clone())
                .collect();
            ensure!(
                !model.id_fields.is_empty() || !model.unique_sets.is_empty(),
                "model `{}` has neither an id field nor a compound unique key",
                model.name
            );
            for set in &model.unique_sets {
                for name in set {
                    ensure!(
                        model.fields.contains_key(name),
                        "unique key of `{}` names unknown field `{}`",
                        model.name,
                        name
                    );
                }
            }
        }

        Self::check_types(&models, &enums)?;
        Self::link_relations(&mut models)?;
        Self::link_delegates(&mut models)?;

        Ok(Arc::new(Schema { models, enums }))
    }

    fn check_types(models: &IndexMap<String, Model>, enums: &IndexMap<String, EnumDef>) -> Result<()> {
        for model in models.values() {
            for field in model.fields.values() {
                match &field.type_ {
                    FieldType::Enum(name) => ensure!(
                        enums.contains_key(name),
                        "field `{}.{}` references unknown enum `{}`",
                        model.name,
                        field.name,
                        name
                    ),
                    FieldType::Relation(target) => ensure!(
                        models.contains_key(target),
                        "field `{}.{}` references unknown model `{}`",
                        model.name,
                        field.name,
                        target
                    ),
                    FieldType::Scalar(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Pairs every relation field with its opposite and checks FK shapes.
    fn link_relations(models: &mut IndexMap<String, Model>) -> Result<()> {
        let mut links: Vec<(String, String, String)> = vec![];
        for model in models.values() {
            for field in model.fields.values() {
                let Some(target_name) = field.relation_target() else {
                    continue;
                };
                if let Some(info) = &field.relation {
                    ensure!(
                        info.fields.len() == info.references.len(),
                        "relation `{}.{}`: `fields` and `references` differ in length",
                        model.name,
                        field.name
                    );
                    for fk in &info.fields {
                        ensure!(
                            model.fields.contains_key(fk),
                            "relation `{}.{}` names unknown FK field `{}`",
                            model.name,
                            field.name,
                            fk
                        );
                    }
                }
                let target = &models[target_name];
                let rel_name = field.relation.as_ref().and_then(|r| r.name.clone());
                let candidates: Vec<&Field> = target
                    .relation_fields()
                    .filter(|f| f.relation_target() == Some(model.name.as_str()))
                    .filter(|f| {
                        // Self-relations pair a field with the *other* one.
                        model.name != target.name || f.name != field.name
                    })
                    .filter(|f| {
                        rel_name.is_none()
                            || f.relation.as_ref().and_then(|r| r.name.as_deref())
                                == rel_name.as_deref()
                    })
                    .collect();
                let opposite = match candidates.len() {
                    1 => candidates[0],
                    0 => {
                        return Err(anyhow!(
                            "relation `{}.{}` has no opposite field on `{}`",
                            model.name,
                            field.name,
                            target_name
                        ))
                    }
                    _ => {
                        return Err(anyhow!(
                            "relation `{}.{}` is ambiguous; disambiguate with a relation name",
                            model.name,
                            field.name
                        ))
                    }
                };
                // Exactly one side owns the FK, except implicit many-to-many
                // where neither does.
                let this_owns = !field.fk_fields().is_empty();
                let that_owns = !opposite.fk_fields().is_empty();
                ensure!(
                    !(this_owns && that_owns),
                    "relation `{}.{}`: both sides declare FK fields",
                    model.name,
                    field.name
                );
                if !this_owns && !that_owns {
                    ensure!(
                        field.array && opposite.array,
                        "relation `{}.{}`: neither side declares FK fields and it is not many-to-many",
                        model.name,
                        field.name
                    );
                }
                links.push((
                    model.name.clone(),
                    field.name.clone(),
                    opposite.name.clone(),
                ));
            }
        }
        for (model, field, opposite) in links {
            let field = models
                .get_mut(&model)
                .and_then(|m| m.fields.get_mut(&field))
                .expect("link target vanished");
            field.opposite = Some(opposite);
        }
        Ok(())
    }

    fn link_delegates(models: &mut IndexMap<String, Model>) -> Result<()> {
        let names: Vec<String> = models.keys().cloned().collect();
        for name in &names {
            let mut seen = vec![name.clone()];
            let mut base = models[name].base_model.clone();
            while let Some(base_name) = base {
                let base_model = models.get_mut(&base_name).ok_or_else(|| {
                    anyhow!("model `{}` declares unknown base `{}`", name, base_name)
                })?;
                ensure!(
                    !seen.contains(&base_name),
                    "delegate cycle through `{}`",
                    base_name
                );
                ensure!(
                    base_model.is_delegate,
                    "model `{}` declares base `{}`, which is not a delegate",
                    name,
                    base_name
                );
                base_model.descendants.push(name.clone());
                seen.push(base_name.clone());
                base = base_model.base_model.clone();
            }
        }
        Ok(())
    }
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Schema {
    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    pub fn get_model(&self, name: &str) -> Option<&Model> {
        self.models.get(name)
    }

    pub fn model(&self, name: &str) -> Result<&Model> {
        self.models
            .get(name)
            .ok_or_else(|| anyhow!("no such model: `{}`", name))
    }

    pub fn get_enum(&self, name: &str) -> Option<&EnumDef> {
        self.enums.get(name)
    }

    /// The target model of a relation field.
    pub fn relation_model(&self, field: &Field) -> Result<&Model> {
        let target = field
            .relation_target()
            .ok_or_else(|| anyhow!("field `{}` is not a relation", field.name))?;
        self.model(target)
    }

    /// The opposite relation field of `field`, on the target model.
    pub fn opposite_field<'a>(&'a self, field: &Field) -> Result<&'a Field> {
        let target = self.relation_model(field)?;
        let opposite = field
            .opposite
            .as_deref()
            .ok_or_else(|| anyhow!("relation `{}` was not linked", field.name))?;
        target.field_or_err(opposite)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::expr::{BinaryExpr, BinaryOp, Expr};

    pub fn blog_schema() -> Arc<Schema> {
        SchemaBuilder::new()
            .model(
                Model::new("User")
                    .field(Field::scalar("id", ScalarType::String).id().generator(Generator::Cuid))
                    .field(Field::scalar("email", ScalarType::String).unique())
                    .field(Field::scalar("name", ScalarType::String).optional())
                    .field(Field::relation("posts", "Post").array()),
            )
            .model(
                Model::new("Post")
                    .field(Field::scalar("id", ScalarType::String).id().generator(Generator::Cuid))
                    .field(Field::scalar("title", ScalarType::String))
                    .field(Field::scalar("published", ScalarType::Boolean))
                    .field(Field::scalar("authorId", ScalarType::String))
                    .field(Field::relation("author", "User").references(&["authorId"], &["id"]))
                    .field(Field::relation("tags", "Tag").array()),
            )
            .model(
                Model::new("Tag")
                    .field(Field::scalar("id", ScalarType::String).id().generator(Generator::Cuid))
                    .field(Field::scalar("label", ScalarType::String).unique())
                    .field(Field::relation("posts", "Post").array()),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_links_opposites() {
        let schema = blog_schema();
        let posts = schema.get_model("User").unwrap().get_field("posts").unwrap();
        assert_eq!(posts.opposite.as_deref(), Some("author"));
        let author = schema.get_model("Post").unwrap().get_field("author").unwrap();
        assert_eq!(author.opposite.as_deref(), Some("posts"));
    }

    #[test]
    fn test_missing_opposite_rejected() {
        let result = SchemaBuilder::new()
            .model(
                Model::new("A")
                    .field(Field::scalar("id", ScalarType::String).id())
                    .field(Field::relation("b", "B").references(&["bId"], &["id"]))
                    .field(Field::scalar("bId", ScalarType::String)),
            )
            .model(Model::new("B").field(Field::scalar("id", ScalarType::String).id()))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_model_without_identity_rejected() {
        let result = SchemaBuilder::new()
            .model(Model::new("Orphan").field(Field::scalar("x", ScalarType::Int)))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_fk_reference_length_mismatch_rejected() {
        let result = SchemaBuilder::new()
            .model(
                Model::new("A")
                    .field(Field::scalar("id", ScalarType::String).id())
                    .field(Field::scalar("bId", ScalarType::String))
                    .field(Field::relation("b", "B").references(&["bId"], &["id", "extra"])),
            )
            .model(
                Model::new("B")
                    .field(Field::scalar("id", ScalarType::String).id())
                    .field(Field::relation("as_", "A").array()),
            )
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_delegate_descendants() {
        let schema = SchemaBuilder::new()
            .model(
                Model::new("Content")
                    .delegate()
                    .field(Field::scalar("id", ScalarType::String).id())
                    .field(Field::scalar("contentType", ScalarType::String)),
            )
            .model(
                Model::new("Video")
                    .base("Content")
                    .field(Field::scalar("id", ScalarType::String).id())
                    .field(Field::scalar("duration", ScalarType::Int)),
            )
            .model(
                Model::new("Image")
                    .base("Content")
                    .field(Field::scalar("id", ScalarType::String).id())
                    .field(Field::scalar("format", ScalarType::String)),
            )
            .build()
            .unwrap();
        let content = schema.get_model("Content").unwrap();
        assert_eq!(content.descendants(), &["Video".to_owned(), "Image".to_owned()]);
    }

    #[test]
    fn test_policy_applies_to() {
        let policy = Policy::allow(
            &[PolicyOperation::All],
            BinaryExpr::new(BinaryOp::Gt, Expr::field("value"), Expr::literal(1i64)),
        );
        assert!(policy.applies_to(PolicyOperation::Read));
        assert!(policy.applies_to(PolicyOperation::Delete));
        // `all` does not include post-update; that one must be explicit.
        assert!(!policy.applies_to(PolicyOperation::PostUpdate));
    }
}
