// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! End-to-end behavior against SQLite: nested writes, policies, pagination,
//! relation filters.

use chisel_orm::client::{Client, ClientOptions};
use chisel_orm::expr::{BinaryExpr, BinaryOp, Expr};
use chisel_orm::schema::{
    Field, Model, Policy, PolicyOperation, Schema, SchemaBuilder,
};
use chisel_orm::value::ScalarType;
use chisel_orm::Error;
use futures::FutureExt;
use serde_json::json;
use std::sync::Arc;
use tempfile::NamedTempFile;

fn blog_schema() -> Arc<Schema> {
    SchemaBuilder::new()
        .model(
            Model::new("User")
                .field(Field::scalar("id", ScalarType::String).id())
                .field(Field::scalar("email", ScalarType::String).unique())
                .field(Field::scalar("name", ScalarType::String).optional())
                .field(Field::relation("posts", "Post").array()),
        )
        .model(
            Model::new("Post")
                .field(Field::scalar("id", ScalarType::String).id())
                .field(Field::scalar("title", ScalarType::String))
                .field(Field::scalar("authorId", ScalarType::String).optional())
                .field(
                    Field::relation("author", "User")
                        .optional()
                        .references(&["authorId"], &["id"]),
                )
                .field(Field::relation("tags", "Tag").array()),
        )
        .model(
            Model::new("Tag")
                .field(Field::scalar("id", ScalarType::String).id())
                .field(Field::scalar("label", ScalarType::String).unique())
                .field(Field::relation("posts", "Post").array()),
        )
        .build()
        .unwrap()
}

fn policy_schema() -> Arc<Schema> {
    SchemaBuilder::new()
        .model(
            Model::new("Item")
                .field(Field::scalar("id", ScalarType::Int).id())
                .field(Field::scalar("value", ScalarType::Int))
                .policy(Policy::allow(
                    &[PolicyOperation::Read],
                    BinaryExpr::new(BinaryOp::Gt, Expr::field("value"), Expr::literal(1i64)),
                )),
        )
        .model(
            Model::new("Gauge")
                .field(Field::scalar("id", ScalarType::Int).id())
                .field(Field::scalar("value", ScalarType::Int))
                .policy(Policy::allow(&[PolicyOperation::Read], Expr::literal(true)))
                .policy(Policy::allow(
                    &[PolicyOperation::Update],
                    BinaryExpr::new(BinaryOp::Gt, Expr::field("value"), Expr::literal(1i64)),
                ))
                .policy(Policy::allow(
                    &[PolicyOperation::PostUpdate],
                    BinaryExpr::new(BinaryOp::Gt, Expr::field("value"), Expr::literal(2i64)),
                )),
        )
        .build()
        .unwrap()
}

async fn connect(schema: Arc<Schema>) -> (Client, NamedTempFile) {
    let db_file = NamedTempFile::new().unwrap();
    let url = format!("sqlite://{}?mode=rwc", db_file.path().to_string_lossy());
    let client = Client::connect(schema.clone(), ClientOptions::new(url))
        .await
        .unwrap();
    let tr = client.engine().begin().await.unwrap();
    client.engine().create_tables(&tr, &schema).await.unwrap();
    chisel_orm::engine::ExecutionEngine::commit(tr).await.unwrap();
    (client, db_file)
}

async fn seed_users(client: &Client) {
    for (id, email) in [("u1", "one@x.io"), ("u2", "two@x.io")] {
        client
            .model("User")
            .create(json!({ "data": { "id": id, "email": email } }))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_nested_create_with_include() {
    let (client, _db) = connect(blog_schema()).await;
    let user = client
        .model("User")
        .create(json!({
            "data": {
                "id": "u1",
                "email": "a",
                "posts": { "create": [ { "id": "p1", "title": "p1" }, { "id": "p2", "title": "p2" } ] }
            },
            "include": { "posts": true }
        }))
        .await
        .unwrap();

    assert_eq!(user["email"], json!("a"));
    let posts = user["posts"].as_array().unwrap();
    assert_eq!(posts.len(), 2);
    for post in posts {
        assert_eq!(post["authorId"], user["id"]);
    }
    let titles: Vec<&str> = posts.iter().map(|p| p["title"].as_str().unwrap()).collect();
    assert!(titles.contains(&"p1") && titles.contains(&"p2"));
}

#[tokio::test]
async fn test_create_then_find_unique_roundtrip() {
    let (client, _db) = connect(blog_schema()).await;
    client
        .model("User")
        .create(json!({ "data": { "id": "u1", "email": "a@b.c", "name": "Ann" } }))
        .await
        .unwrap();
    let found = client
        .model("User")
        .find_unique(json!({ "where": { "id": "u1" } }))
        .await
        .unwrap();
    assert_eq!(found["email"], json!("a@b.c"));
    assert_eq!(found["name"], json!("Ann"));

    let missing = client
        .model("User")
        .find_unique(json!({ "where": { "id": "nope" } }))
        .await
        .unwrap();
    assert!(missing.is_null());

    let err = client
        .model("User")
        .find_unique_or_throw(json!({ "where": { "id": "nope" } }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }), "{:?}", err);
}

#[tokio::test]
async fn test_policy_filters_reads() {
    let (client, _db) = connect(policy_schema()).await;
    let raw = client.raw();
    for (id, value) in [(1, 1), (2, 2)] {
        raw.model("Item")
            .create(json!({ "data": { "id": id, "value": value } }))
            .await
            .unwrap();
    }

    let visible = client.model("Item").find_many(json!({})).await.unwrap();
    assert_eq!(visible, json!([{ "id": 2, "value": 2 }]));

    // Policy rejection on reads surfaces as absence, not as an error.
    let hidden = client
        .model("Item")
        .find_unique(json!({ "where": { "id": 1 } }))
        .await
        .unwrap();
    assert!(hidden.is_null());

    let count = client.model("Item").count(json!({})).await.unwrap();
    assert_eq!(count, json!(1));
}

#[tokio::test]
async fn test_post_update_policy_rolls_back() {
    let (client, _db) = connect(policy_schema()).await;
    client
        .raw()
        .model("Gauge")
        .create(json!({ "data": { "id": 1, "value": 2 } }))
        .await
        .unwrap();

    // value > 1 allows the update, but the post-update check (value > 2)
    // fails against the new row, so nothing sticks.
    let err = client
        .model("Gauge")
        .update(json!({ "where": { "id": 1 }, "data": { "value": 1 } }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Policy { .. }), "{:?}", err);

    let row = client
        .raw()
        .model("Gauge")
        .find_unique(json!({ "where": { "id": 1 } }))
        .await
        .unwrap();
    assert_eq!(row["value"], json!(2));
}

#[tokio::test]
async fn test_cursor_pagination() {
    let (client, _db) = connect(policy_schema()).await;
    let raw = client.raw();
    for id in [1, 2, 3] {
        raw.model("Item")
            .create(json!({ "data": { "id": id, "value": 10 } }))
            .await
            .unwrap();
    }

    let page = raw
        .model("Item")
        .find_many(json!({ "cursor": { "id": 2 }, "orderBy": { "id": "asc" } }))
        .await
        .unwrap();
    let ids: Vec<i64> = page
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![2, 3]);

    // skip drops the cursor row itself.
    let page = raw
        .model("Item")
        .find_many(json!({ "skip": 1, "cursor": { "id": 1 }, "orderBy": { "id": "asc" } }))
        .await
        .unwrap();
    let ids: Vec<i64> = page
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![2, 3]);
}

#[tokio::test]
async fn test_negative_take_reverses() {
    let (client, _db) = connect(policy_schema()).await;
    let raw = client.raw();
    for id in [1, 2, 3] {
        raw.model("Item")
            .create(json!({ "data": { "id": id, "value": 10 } }))
            .await
            .unwrap();
    }
    let page = raw
        .model("Item")
        .find_many(json!({ "take": -2 }))
        .await
        .unwrap();
    let ids: Vec<i64> = page
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![3, 2]);
}

#[tokio::test]
async fn test_take_and_skip() {
    let (client, _db) = connect(policy_schema()).await;
    let raw = client.raw();
    for id in 1..=5 {
        raw.model("Item")
            .create(json!({ "data": { "id": id, "value": id } }))
            .await
            .unwrap();
    }
    let page = raw
        .model("Item")
        .find_many(json!({ "take": 2, "skip": 1 }))
        .await
        .unwrap();
    let ids: Vec<i64> = page
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![2, 3]);
}

#[tokio::test]
async fn test_to_many_quantifiers() {
    let (client, _db) = connect(blog_schema()).await;
    seed_users(&client).await;
    client
        .model("Post")
        .create(json!({ "data": { "id": "p1", "title": "p1", "author": { "connect": { "id": "u1" } } } }))
        .await
        .unwrap();
    client
        .model("Post")
        .create(json!({ "data": { "id": "p2", "title": "p2", "author": { "connect": { "id": "u1" } } } }))
        .await
        .unwrap();

    let first = client
        .model("User")
        .find_first(json!({
            "where": { "posts": { "every": { "authorId": "u1" } } },
            "orderBy": { "id": "asc" }
        }))
        .await
        .unwrap();
    assert_eq!(first["id"], json!("u1"));

    let none = client
        .model("User")
        .find_first(json!({
            "where": { "posts": { "none": { "title": "p1" } } },
            "orderBy": { "id": "asc" }
        }))
        .await
        .unwrap();
    assert_eq!(none["id"], json!("u2"));

    let some = client
        .model("User")
        .find_many(json!({ "where": { "posts": { "some": { "title": "p2" } } } }))
        .await
        .unwrap();
    assert_eq!(some.as_array().unwrap().len(), 1);
    assert_eq!(some[0]["id"], json!("u1"));
}

#[tokio::test]
async fn test_count_matches_find_many() {
    let (client, _db) = connect(blog_schema()).await;
    seed_users(&client).await;
    for (id, title, author) in [("p1", "a", "u1"), ("p2", "b", "u1"), ("p3", "a", "u2")] {
        client
            .model("Post")
            .create(json!({
                "data": { "id": id, "title": title, "author": { "connect": { "id": author } } }
            }))
            .await
            .unwrap();
    }
    let where_ = json!({ "title": "a" });
    let found = client
        .model("Post")
        .find_many(json!({ "where": where_ }))
        .await
        .unwrap();
    let count = client
        .model("Post")
        .count(json!({ "where": where_ }))
        .await
        .unwrap();
    assert_eq!(count.as_i64().unwrap() as usize, found.as_array().unwrap().len());
}

#[tokio::test]
async fn test_update_changes_only_named_fields() {
    let (client, _db) = connect(blog_schema()).await;
    client
        .model("User")
        .create(json!({ "data": { "id": "u1", "email": "a@b.c", "name": "Ann" } }))
        .await
        .unwrap();
    let updated = client
        .model("User")
        .update(json!({ "where": { "id": "u1" }, "data": { "name": "Bea" } }))
        .await
        .unwrap();
    assert_eq!(updated["name"], json!("Bea"));
    assert_eq!(updated["email"], json!("a@b.c"));
    assert_eq!(updated["id"], json!("u1"));
}

#[tokio::test]
async fn test_connect_disconnect_idempotence() {
    let (client, _db) = connect(blog_schema()).await;
    seed_users(&client).await;
    client
        .model("Post")
        .create(json!({ "data": { "id": "p1", "title": "t" } }))
        .await
        .unwrap();

    // Connecting twice leaves one link.
    for _ in 0..2 {
        client
            .model("User")
            .update(json!({
                "where": { "id": "u1" },
                "data": { "posts": { "connect": { "id": "p1" } } }
            }))
            .await
            .unwrap();
    }
    let user = client
        .model("User")
        .find_unique(json!({ "where": { "id": "u1" }, "include": { "posts": true } }))
        .await
        .unwrap();
    assert_eq!(user["posts"].as_array().unwrap().len(), 1);

    // Disconnecting an unrelated row is a no-op.
    client
        .model("User")
        .update(json!({
            "where": { "id": "u2" },
            "data": { "posts": { "disconnect": { "id": "p1" } } }
        }))
        .await
        .unwrap();
    let user = client
        .model("User")
        .find_unique(json!({ "where": { "id": "u1" }, "include": { "posts": true } }))
        .await
        .unwrap();
    assert_eq!(user["posts"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_set_replaces_links() {
    let (client, _db) = connect(blog_schema()).await;
    seed_users(&client).await;
    for id in ["p1", "p2", "p3"] {
        client
            .model("Post")
            .create(json!({
                "data": { "id": id, "title": id, "author": { "connect": { "id": "u1" } } }
            }))
            .await
            .unwrap();
    }
    client
        .model("User")
        .update(json!({
            "where": { "id": "u1" },
            "data": { "posts": { "set": [ { "id": "p1" }, { "id": "p3" } ] } }
        }))
        .await
        .unwrap();
    let user = client
        .model("User")
        .find_unique(json!({ "where": { "id": "u1" }, "include": { "posts": true } }))
        .await
        .unwrap();
    let ids: Vec<&str> = user["posts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"p1") && ids.contains(&"p3"));

    // `set` with the current set of ids changes nothing.
    client
        .model("User")
        .update(json!({
            "where": { "id": "u1" },
            "data": { "posts": { "set": [ { "id": "p1" }, { "id": "p3" } ] } }
        }))
        .await
        .unwrap();
    let user = client
        .model("User")
        .find_unique(json!({ "where": { "id": "u1" }, "include": { "posts": true } }))
        .await
        .unwrap();
    assert_eq!(user["posts"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_many_to_many_connect_and_read() {
    let (client, _db) = connect(blog_schema()).await;
    client
        .model("Tag")
        .create(json!({ "data": { "id": "t1", "label": "rust" } }))
        .await
        .unwrap();
    client
        .model("Post")
        .create(json!({
            "data": { "id": "p1", "title": "t", "tags": { "connect": { "id": "t1" } } },
            "include": { "tags": true }
        }))
        .await
        .unwrap();
    let post = client
        .model("Post")
        .find_unique(json!({ "where": { "id": "p1" }, "include": { "tags": true } }))
        .await
        .unwrap();
    let tags = post["tags"].as_array().unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0]["label"], json!("rust"));

    // And filtering across the join table.
    let posts = client
        .model("Post")
        .find_many(json!({ "where": { "tags": { "some": { "label": "rust" } } } }))
        .await
        .unwrap();
    assert_eq!(posts.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unique_violation_is_constraint_error() {
    let (client, _db) = connect(blog_schema()).await;
    client
        .model("User")
        .create(json!({ "data": { "id": "u1", "email": "same@x.io" } }))
        .await
        .unwrap();
    let err = client
        .model("User")
        .create(json!({ "data": { "id": "u2", "email": "same@x.io" } }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Constraint { .. }), "{:?}", err);
}

#[tokio::test]
async fn test_transaction_rolls_back_on_error() {
    let (client, _db) = connect(blog_schema()).await;
    let result: Result<(), Error> = client
        .transaction(|tx| {
            let tx = tx.clone();
            async move {
                tx.model("User")
                    .create(json!({ "data": { "id": "u1", "email": "a@b.c" } }))
                    .await?;
                Err(Error::Internal(anyhow::anyhow!("abort")))
            }
            .boxed()
        })
        .await;
    assert!(result.is_err());

    let users = client.model("User").find_many(json!({})).await.unwrap();
    assert_eq!(users.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_nested_writes_are_atomic() {
    let (client, _db) = connect(blog_schema()).await;
    client
        .model("Post")
        .create(json!({ "data": { "id": "p1", "title": "taken" } }))
        .await
        .unwrap();

    // The second nested post collides on the primary key; the user insert
    // must roll back with it.
    let err = client
        .model("User")
        .create(json!({
            "data": {
                "id": "u1",
                "email": "a@b.c",
                "posts": { "create": [ { "id": "px", "title": "ok" }, { "id": "p1", "title": "dup" } ] }
            }
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Constraint { .. }), "{:?}", err);

    let users = client.model("User").find_many(json!({})).await.unwrap();
    assert_eq!(users.as_array().unwrap().len(), 0);
    let orphan = client
        .model("Post")
        .find_unique(json!({ "where": { "id": "px" } }))
        .await
        .unwrap();
    assert!(orphan.is_null());
}

#[tokio::test]
async fn test_update_many_and_delete_many() {
    let (client, _db) = connect(policy_schema()).await;
    let raw = client.raw();
    for id in 1..=4 {
        raw.model("Item")
            .create(json!({ "data": { "id": id, "value": id } }))
            .await
            .unwrap();
    }
    let result = raw
        .model("Item")
        .update_many(json!({ "where": { "value": { "lte": 2 } }, "data": { "value": 10 } }))
        .await
        .unwrap();
    assert_eq!(result, json!({ "count": 2 }));

    let result = raw
        .model("Item")
        .delete_many(json!({ "where": { "value": 10 } }))
        .await
        .unwrap();
    assert_eq!(result, json!({ "count": 2 }));

    let left = raw.model("Item").find_many(json!({})).await.unwrap();
    assert_eq!(left.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_upsert_branches() {
    let (client, _db) = connect(blog_schema()).await;
    let created = client
        .model("User")
        .upsert(json!({
            "where": { "email": "a@b.c" },
            "create": { "id": "u1", "email": "a@b.c", "name": "created" },
            "update": { "name": "updated" }
        }))
        .await
        .unwrap();
    assert_eq!(created["name"], json!("created"));

    let updated = client
        .model("User")
        .upsert(json!({
            "where": { "email": "a@b.c" },
            "create": { "id": "u2", "email": "a@b.c", "name": "created" },
            "update": { "name": "updated" }
        }))
        .await
        .unwrap();
    assert_eq!(updated["name"], json!("updated"));
    assert_eq!(updated["id"], json!("u1"));
}

#[tokio::test]
async fn test_create_many_enforces_relation_create_policy() {
    // `owner.active == true` traverses a relation, so the in-memory check
    // cannot decide it; enforcement must come from the re-select inside
    // the transaction, on the createMany path just like on create.
    let schema = SchemaBuilder::new()
        .model(
            Model::new("Owner")
                .field(Field::scalar("id", ScalarType::String).id())
                .field(Field::scalar("active", ScalarType::Boolean))
                .field(Field::relation("notes", "Note").array()),
        )
        .model(
            Model::new("Note")
                .field(Field::scalar("id", ScalarType::String).id())
                .field(Field::scalar("ownerId", ScalarType::String))
                .field(Field::relation("owner", "Owner").references(&["ownerId"], &["id"]))
                .policy(Policy::allow(
                    &[PolicyOperation::Create],
                    BinaryExpr::new(
                        BinaryOp::Eq,
                        Expr::field("owner").member("active"),
                        Expr::literal(true),
                    ),
                )),
        )
        .build()
        .unwrap();
    let (client, _db) = connect(schema).await;
    let raw = client.raw();
    for (id, active) in [("o1", true), ("o2", false)] {
        raw.model("Owner")
            .create(json!({ "data": { "id": id, "active": active } }))
            .await
            .unwrap();
    }

    let result = client
        .model("Note")
        .create_many(json!({ "data": [ { "id": "n1", "ownerId": "o1" } ] }))
        .await
        .unwrap();
    assert_eq!(result, json!({ "count": 1 }));

    let err = client
        .model("Note")
        .create_many(json!({ "data": [ { "id": "n2", "ownerId": "o2" } ] }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Policy { .. }), "{:?}", err);

    // The rejected row rolled back with its transaction.
    let gone = raw
        .model("Note")
        .find_unique(json!({ "where": { "id": "n2" } }))
        .await
        .unwrap();
    assert!(gone.is_null());
}

#[tokio::test]
async fn test_create_many_preserves_order_and_skips_duplicates() {
    let (client, _db) = connect(policy_schema()).await;
    let raw = client.raw();
    let result = raw
        .model("Item")
        .create_many(json!({ "data": [
            { "id": 1, "value": 1 },
            { "id": 2, "value": 2 },
            { "id": 1, "value": 3 }
        ], "skipDuplicates": true }))
        .await
        .unwrap();
    assert_eq!(result, json!({ "count": 2 }));

    let rows = raw
        .model("Item")
        .find_many(json!({ "orderBy": { "id": "asc" } }))
        .await
        .unwrap();
    assert_eq!(rows, json!([{ "id": 1, "value": 1 }, { "id": 2, "value": 2 }]));
}

#[tokio::test]
async fn test_delete_returns_snapshot() {
    let (client, _db) = connect(blog_schema()).await;
    client
        .model("User")
        .create(json!({ "data": { "id": "u1", "email": "a@b.c" } }))
        .await
        .unwrap();
    let deleted = client
        .model("User")
        .delete(json!({ "where": { "id": "u1" } }))
        .await
        .unwrap();
    assert_eq!(deleted["email"], json!("a@b.c"));

    let err = client
        .model("User")
        .delete(json!({ "where": { "id": "u1" } }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }), "{:?}", err);
}

#[tokio::test]
async fn test_group_by_and_aggregate() {
    let (client, _db) = connect(blog_schema()).await;
    seed_users(&client).await;
    for (id, author) in [("p1", "u1"), ("p2", "u1"), ("p3", "u2")] {
        client
            .model("Post")
            .create(json!({
                "data": { "id": id, "title": id, "author": { "connect": { "id": author } } }
            }))
            .await
            .unwrap();
    }
    let groups = client
        .model("Post")
        .group_by(json!({
            "by": ["authorId"],
            "_count": { "_all": true },
            "orderBy": { "authorId": "asc" }
        }))
        .await
        .unwrap();
    assert_eq!(
        groups,
        json!([
            { "authorId": "u1", "_count": { "_all": 2 } },
            { "authorId": "u2", "_count": { "_all": 1 } }
        ])
    );

    let aggregate = client
        .model("Post")
        .aggregate(json!({ "_count": true }))
        .await
        .unwrap();
    assert_eq!(aggregate["_count"]["_all"], json!(3));
}

#[tokio::test]
async fn test_relation_count_selection() {
    let (client, _db) = connect(blog_schema()).await;
    seed_users(&client).await;
    for (id, author) in [("p1", "u1"), ("p2", "u1")] {
        client
            .model("Post")
            .create(json!({
                "data": { "id": id, "title": id, "author": { "connect": { "id": author } } }
            }))
            .await
            .unwrap();
    }
    let users = client
        .model("User")
        .find_many(json!({ "include": { "_count": true }, "orderBy": { "id": "asc" } }))
        .await
        .unwrap();
    assert_eq!(users[0]["_count"]["posts"], json!(2));
    assert_eq!(users[1]["_count"]["posts"], json!(0));
}

#[tokio::test]
async fn test_included_relation_pagination() {
    let (client, _db) = connect(blog_schema()).await;
    seed_users(&client).await;
    for id in ["p1", "p2", "p3"] {
        client
            .model("Post")
            .create(json!({
                "data": { "id": id, "title": id, "author": { "connect": { "id": "u1" } } }
            }))
            .await
            .unwrap();
    }
    let user = client
        .model("User")
        .find_unique(json!({
            "where": { "id": "u1" },
            "include": { "posts": { "orderBy": { "title": "desc" }, "take": 2 } }
        }))
        .await
        .unwrap();
    let titles: Vec<&str> = user["posts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["title"].as_str().unwrap())
        .collect();
    assert_eq!(titles, vec!["p3", "p2"]);
}

#[tokio::test]
async fn test_validation_errors_carry_paths() {
    let (client, _db) = connect(blog_schema()).await;
    let err = client
        .model("User")
        .find_many(json!({ "where": { "nope": 1 } }))
        .await
        .unwrap_err();
    let Error::Validation { operation, path, .. } = err else {
        panic!("expected a validation error");
    };
    assert_eq!(operation, "findMany");
    assert_eq!(path, "User.where.nope");
}
