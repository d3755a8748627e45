// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! An ORM runtime. Takes declarative, nested query objects against a
//! user-defined relational schema, compiles them into provider SQL
//! (PostgreSQL and SQLite), executes them, and reassembles the rows into
//! nested entity trees. A row-level access-control layer transparently
//! rewrites queries so that only records matching policy expressions are
//! returned or mutated.

pub mod assemble;
pub mod client;
pub mod engine;
pub mod error;
pub mod expr;
pub mod mutation;
pub mod policy;
pub mod query;
pub mod schema;
pub mod sql;
pub mod validate;
pub mod value;

pub use client::{Client, ClientOptions, Plugin};
pub use error::{Error, Result};
pub use schema::{Schema, SchemaBuilder};

/// A JSON object; the shape query arguments and entity trees travel in.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

use schema::PolicyOperation;

/// The per-model operations the client dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FindMany,
    FindUnique,
    FindUniqueOrThrow,
    FindFirst,
    FindFirstOrThrow,
    Create,
    CreateMany,
    CreateManyAndReturn,
    Update,
    UpdateMany,
    Upsert,
    Delete,
    DeleteMany,
    Count,
    Aggregate,
    GroupBy,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FindMany => "findMany",
            Self::FindUnique => "findUnique",
            Self::FindUniqueOrThrow => "findUniqueOrThrow",
            Self::FindFirst => "findFirst",
            Self::FindFirstOrThrow => "findFirstOrThrow",
            Self::Create => "create",
            Self::CreateMany => "createMany",
            Self::CreateManyAndReturn => "createManyAndReturn",
            Self::Update => "update",
            Self::UpdateMany => "updateMany",
            Self::Upsert => "upsert",
            Self::Delete => "delete",
            Self::DeleteMany => "deleteMany",
            Self::Count => "count",
            Self::Aggregate => "aggregate",
            Self::GroupBy => "groupBy",
        }
    }

    /// Whether the `where` argument must contain a full unique key.
    pub fn requires_unique_where(&self) -> bool {
        matches!(
            self,
            Self::FindUnique | Self::FindUniqueOrThrow | Self::Update | Self::Upsert | Self::Delete
        )
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::Create
                | Self::CreateMany
                | Self::CreateManyAndReturn
                | Self::Update
                | Self::UpdateMany
                | Self::Upsert
                | Self::Delete
                | Self::DeleteMany
        )
    }

    /// Which policy operation guards this client operation.
    pub fn policy_operation(&self) -> PolicyOperation {
        match self {
            Self::Create | Self::CreateMany | Self::CreateManyAndReturn => PolicyOperation::Create,
            Self::Update | Self::UpdateMany | Self::Upsert => PolicyOperation::Update,
            Self::Delete | Self::DeleteMany => PolicyOperation::Delete,
            _ => PolicyOperation::Read,
        }
    }
}
