// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! Shared relation-graph helpers used by the query compiler, the mutation
//! planner and the policy transformer.

use super::{Field, Model, Schema};
use anyhow::{anyhow, ensure, Result};

/// One FK/PK column pair of a relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    /// Column on the FK-owning side.
    pub fk: String,
    /// Referenced column on the other side.
    pub pk: String,
}

/// How a relation field maps to columns.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationKeys {
    pub key_pairs: Vec<KeyPair>,
    /// True when the model holding the relation field owns the FK columns.
    /// This dictates join direction everywhere downstream.
    pub owned_by_model: bool,
}

/// Returns the FK/PK pairing for relation field `field` on `model`.
/// Errors on implicit many-to-many relations, which have no FK columns;
/// those are resolved by [`implicit_join_table`] instead.
pub fn relation_keys(schema: &Schema, model: &Model, field: &Field) -> Result<RelationKeys> {
    if !field.fk_fields().is_empty() {
        let info = field.relation.as_ref().unwrap();
        return Ok(RelationKeys {
            key_pairs: info
                .fields
                .iter()
                .zip(info.references.iter())
                .map(|(fk, pk)| KeyPair {
                    fk: fk.clone(),
                    pk: pk.clone(),
                })
                .collect(),
            owned_by_model: true,
        });
    }
    let opposite = schema.opposite_field(field)?;
    ensure!(
        !opposite.fk_fields().is_empty(),
        "relation `{}.{}` has no FK columns on either side (many-to-many?)",
        model.name(),
        field.name
    );
    let info = opposite.relation.as_ref().unwrap();
    Ok(RelationKeys {
        key_pairs: info
            .fields
            .iter()
            .zip(info.references.iter())
            .map(|(fk, pk)| KeyPair {
                fk: fk.clone(),
                pk: pk.clone(),
            })
            .collect(),
        owned_by_model: false,
    })
}

/// Whether the relation is an implicit many-to-many: two opposing array
/// relations without FK fields on either side.
pub fn is_many_to_many(schema: &Schema, field: &Field) -> bool {
    if !field.is_to_many() || !field.fk_fields().is_empty() {
        return false;
    }
    match schema.opposite_field(field) {
        Ok(opposite) => opposite.array && opposite.fk_fields().is_empty(),
        Err(_) => false,
    }
}

/// The implicit join table of a many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTable {
    pub table: String,
    /// Column holding ids of the model the traversal starts from.
    pub parent_fk: String,
    /// Column holding ids of the target model.
    pub other_fk: String,
}

/// Resolves the implicit join table for many-to-many relation `field` on
/// `model`. The table is named `_{A}To{B}` with the models in lexicographic
/// order; column `A` stores ids of the first model, `B` of the second.
pub fn implicit_join_table(schema: &Schema, model: &Model, field: &Field) -> Result<JoinTable> {
    ensure!(
        is_many_to_many(schema, field),
        "relation `{}.{}` is not an implicit many-to-many",
        model.name(),
        field.name
    );
    let target = schema.relation_model(field)?;
    let rel_name = field
        .relation
        .as_ref()
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| {
            let (a, b) = if model.name() <= target.name() {
                (model.name(), target.name())
            } else {
                (target.name(), model.name())
            };
            format!("{}To{}", a, b)
        });
    let parent_is_a = if model.name() == target.name() {
        // Self m2m: the A column belongs to the lexicographically-smaller
        // field name so both sides agree.
        field.name <= field.opposite.clone().unwrap_or_default()
    } else {
        model.name() < target.name()
    };
    let (parent_fk, other_fk) = if parent_is_a {
        ("A", "B")
    } else {
        ("B", "A")
    };
    Ok(JoinTable {
        table: format!("_{}", rel_name),
        parent_fk: parent_fk.to_owned(),
        other_fk: other_fk.to_owned(),
    })
}

/// Enumerates the unique-field alternatives of a model, each as an ordered
/// field-name sequence. The id set comes first, then singular `@unique`
/// fields, then compound unique sets. Used by the validator and by
/// connect/set/upsert targeting.
pub fn unique_sets(model: &Model) -> Vec<Vec<String>> {
    let mut sets = vec![];
    if !model.id_fields().is_empty() {
        sets.push(model.id_fields().to_vec());
    }
    for field in model.scalar_fields() {
        if field.unique && !field.is_id {
            sets.push(vec![field.name.clone()]);
        }
    }
    for set in model.unique_sets() {
        sets.push(set.clone());
    }
    sets
}

/// The chain of delegate bases of `model`, closest first.
pub fn base_chain<'a>(schema: &'a Schema, model: &Model) -> Result<Vec<&'a Model>> {
    let mut chain = vec![];
    let mut base = model.base_model();
    while let Some(name) = base {
        let base_model = schema.model(name)?;
        chain.push(base_model);
        base = base_model.base_model();
    }
    Ok(chain)
}

/// Finds which unique set of `model` the keys of `where` cover completely.
/// Returns the matched set, or an error naming the model when none matches.
pub fn match_unique_set<'a>(
    model: &'a Model,
    keys: &[&str],
) -> Result<Vec<String>> {
    for set in unique_sets(model) {
        if set.iter().all(|f| keys.contains(&f.as_str())) {
            return Ok(set);
        }
    }
    Err(anyhow!(
        "arguments for `{}` must contain a full unique key",
        model.name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::blog_schema;
    use crate::schema::{Field as SchemaField, Model, SchemaBuilder};
    use crate::value::ScalarType;

    #[test]
    fn test_relation_keys_owned_side() {
        let schema = blog_schema();
        let post = schema.get_model("Post").unwrap();
        let author = post.get_field("author").unwrap();
        let keys = relation_keys(&schema, post, author).unwrap();
        assert!(keys.owned_by_model);
        assert_eq!(
            keys.key_pairs,
            vec![KeyPair {
                fk: "authorId".into(),
                pk: "id".into()
            }]
        );
    }

    #[test]
    fn test_relation_keys_unowned_side() {
        let schema = blog_schema();
        let user = schema.get_model("User").unwrap();
        let posts = user.get_field("posts").unwrap();
        let keys = relation_keys(&schema, user, posts).unwrap();
        assert!(!keys.owned_by_model);
        assert_eq!(keys.key_pairs[0].fk, "authorId");
    }

    #[test]
    fn test_many_to_many_detection() {
        let schema = blog_schema();
        let post = schema.get_model("Post").unwrap();
        let tags = post.get_field("tags").unwrap();
        assert!(is_many_to_many(&schema, tags));

        let join = implicit_join_table(&schema, post, tags).unwrap();
        assert_eq!(join.table, "_PostToTag");
        assert_eq!(join.parent_fk, "A");
        assert_eq!(join.other_fk, "B");

        // And the reverse traversal swaps the columns.
        let tag = schema.get_model("Tag").unwrap();
        let posts = tag.get_field("posts").unwrap();
        let join = implicit_join_table(&schema, tag, posts).unwrap();
        assert_eq!(join.table, "_PostToTag");
        assert_eq!(join.parent_fk, "B");
        assert_eq!(join.other_fk, "A");
    }

    #[test]
    fn test_unique_sets_ordering() {
        let model = Model::new("Account")
            .field(SchemaField::scalar("id", ScalarType::String).id())
            .field(SchemaField::scalar("email", ScalarType::String).unique())
            .field(SchemaField::scalar("org", ScalarType::String))
            .field(SchemaField::scalar("slug", ScalarType::String))
            .compound_unique(&["org", "slug"]);
        let schema = SchemaBuilder::new().model(model).build().unwrap();
        let account = schema.get_model("Account").unwrap();
        assert_eq!(
            unique_sets(account),
            vec![
                vec!["id".to_owned()],
                vec!["email".to_owned()],
                vec!["org".to_owned(), "slug".to_owned()],
            ]
        );
    }

    #[test]
    fn test_match_unique_set() {
        let schema = blog_schema();
        let user = schema.get_model("User").unwrap();
        assert_eq!(
            match_unique_set(user, &["email", "name"]).unwrap(),
            vec!["email".to_owned()]
        );
        assert!(match_unique_set(user, &["name"]).is_err());
    }
}
