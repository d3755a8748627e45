// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

pub mod ast;
pub mod dialect;
pub mod postgres;
pub mod sqlite;
pub mod writer;

pub use ast::{
    Delete, FromItem, Insert, Join, JoinKind, NullsOrder, OnConflict, OrderTerm, Select, SqlBinaryOp,
    SqlExpr, Statement, Update,
};
pub use dialect::{Dialect, DialectKind};
pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;
pub use writer::{CompiledSql, SqlWriter};
