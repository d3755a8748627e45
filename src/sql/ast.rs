// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! A small SQL tree. The query compiler builds these, the policy transformer
//! rewrites them, the writer renders them into provider SQL with bind
//! parameters.

use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    /// A column reference, `"alias"."name"`.
    Column { table: String, name: String },
    /// A bind parameter carrying its value.
    Param(Value),
    /// A boolean constant, rendered per dialect.
    Bool(bool),
    /// An integer literal rendered inline (counts, comparisons against 0).
    Int(i64),
    Null,
    /// `COUNT(*)`.
    CountStar,
    Binary {
        left: Box<SqlExpr>,
        op: SqlBinaryOp,
        right: Box<SqlExpr>,
    },
    Not(Box<SqlExpr>),
    IsNull(Box<SqlExpr>),
    IsNotNull(Box<SqlExpr>),
    /// `expr [NOT] LIKE pattern ESCAPE '\'`; `insensitive` renders as ILIKE
    /// or a lower()-wrapped LIKE depending on the dialect.
    Like {
        expr: Box<SqlExpr>,
        pattern: Box<SqlExpr>,
        insensitive: bool,
        negated: bool,
    },
    In {
        expr: Box<SqlExpr>,
        list: Vec<SqlExpr>,
        negated: bool,
    },
    InSelect {
        expr: Box<SqlExpr>,
        select: Box<Select>,
        negated: bool,
    },
    Exists(Box<Select>),
    /// A scalar subquery.
    Subquery(Box<Select>),
    /// A function call, `name(arg, …)`.
    Fn { name: String, args: Vec<SqlExpr> },
    /// A JSON object constructor; rendered as `jsonb_build_object` or
    /// `json_object` depending on the dialect.
    JsonObject(Vec<(String, SqlExpr)>),
    /// JSON array aggregation over the grouped rows, empty array when there
    /// are none; `jsonb_agg`/`json_group_array` wrapped in COALESCE.
    JsonAgg(Box<SqlExpr>),
    /// A row tuple, `(a, b, …)`; used for multi-column IN.
    Tuple(Vec<SqlExpr>),
    /// `ARRAY[a, b, …]`; Postgres only.
    ArrayLiteral(Vec<SqlExpr>),
    /// `CAST(expr AS type)`.
    Cast { expr: Box<SqlExpr>, ty: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlBinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    /// Array containment, `@>`.
    ArrayContains,
    /// Array overlap, `&&`.
    ArrayOverlaps,
}

impl SqlBinaryOp {
    pub fn to_sql_string(&self) -> &str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::ArrayContains => "@>",
            Self::ArrayOverlaps => "&&",
        }
    }
}

impl SqlExpr {
    pub fn column(table: impl Into<String>, name: impl Into<String>) -> Self {
        SqlExpr::Column {
            table: table.into(),
            name: name.into(),
        }
    }

    pub fn param(value: impl Into<Value>) -> Self {
        SqlExpr::Param(value.into())
    }

    pub fn binary(left: SqlExpr, op: SqlBinaryOp, right: SqlExpr) -> Self {
        SqlExpr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn and(left: SqlExpr, right: SqlExpr) -> Self {
        if matches!(left, SqlExpr::Bool(false)) || matches!(right, SqlExpr::Bool(false)) {
            return SqlExpr::Bool(false);
        }
        if matches!(left, SqlExpr::Bool(true)) {
            return right;
        }
        if matches!(right, SqlExpr::Bool(true)) {
            return left;
        }
        Self::binary(left, SqlBinaryOp::And, right)
    }

    pub fn or(left: SqlExpr, right: SqlExpr) -> Self {
        if matches!(left, SqlExpr::Bool(true)) || matches!(right, SqlExpr::Bool(true)) {
            return SqlExpr::Bool(true);
        }
        if matches!(left, SqlExpr::Bool(false)) {
            return right;
        }
        if matches!(right, SqlExpr::Bool(false)) {
            return left;
        }
        Self::binary(left, SqlBinaryOp::Or, right)
    }

    pub fn not(self) -> Self {
        match self {
            SqlExpr::Bool(b) => SqlExpr::Bool(!b),
            other => SqlExpr::Not(Box::new(other)),
        }
    }

    /// Conjoins, treating `None` as TRUE.
    pub fn and_opt(lhs: Option<SqlExpr>, rhs: SqlExpr) -> SqlExpr {
        match lhs {
            Some(lhs) => SqlExpr::and(lhs, rhs),
            None => rhs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FromItem {
    Table {
        name: String,
        alias: String,
        /// The schema model this table stores, when it stores one; the
        /// policy transformer keys on this.
        model: Option<String>,
    },
    Subquery { select: Box<Select>, alias: String },
}

impl FromItem {
    pub fn alias(&self) -> &str {
        match self {
            FromItem::Table { alias, .. } => alias,
            FromItem::Subquery { alias, .. } => alias,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub from: FromItem,
    pub on: SqlExpr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullsOrder {
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderTerm {
    pub expr: SqlExpr,
    pub descending: bool,
    pub nulls: Option<NullsOrder>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectColumn {
    pub expr: SqlExpr,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub columns: Vec<SelectColumn>,
    pub from: FromItem,
    pub joins: Vec<Join>,
    pub where_: Option<SqlExpr>,
    pub group_by: Vec<SqlExpr>,
    pub having: Option<SqlExpr>,
    pub order_by: Vec<OrderTerm>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// `None`: plain; `Some(vec![])`: DISTINCT; `Some(cols)`: DISTINCT ON.
    pub distinct: Option<Vec<SqlExpr>>,
}

impl Select {
    pub fn from_table(name: impl Into<String>, alias: impl Into<String>, model: Option<&str>) -> Self {
        Select {
            columns: vec![],
            from: FromItem::Table {
                name: name.into(),
                alias: alias.into(),
                model: model.map(str::to_owned),
            },
            joins: vec![],
            where_: None,
            group_by: vec![],
            having: None,
            order_by: vec![],
            limit: None,
            offset: None,
            distinct: None,
        }
    }

    pub fn column(&mut self, expr: SqlExpr, alias: Option<&str>) -> &mut Self {
        self.columns.push(SelectColumn {
            expr,
            alias: alias.map(str::to_owned),
        });
        self
    }

    pub fn and_where(&mut self, predicate: SqlExpr) -> &mut Self {
        // Constant TRUE would render as a redundant `WHERE 1`.
        self.where_ = match SqlExpr::and_opt(self.where_.take(), predicate) {
            SqlExpr::Bool(true) => None,
            other => Some(other),
        };
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OnConflict {
    DoNothing,
    /// Update the listed columns from the given expressions when the
    /// conflict target matches.
    DoUpdate {
        target: Vec<String>,
        sets: Vec<(String, SqlExpr)>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: String,
    pub model: String,
    pub columns: Vec<String>,
    /// One inner vector per row, pairwise with `columns`. `None` entries
    /// render as DEFAULT.
    pub rows: Vec<Vec<Option<SqlExpr>>>,
    pub on_conflict: Option<OnConflict>,
    pub returning: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: String,
    pub model: String,
    pub sets: Vec<(String, SqlExpr)>,
    pub where_: Option<SqlExpr>,
    pub limit: Option<u64>,
    pub returning: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: String,
    pub model: String,
    pub where_: Option<SqlExpr>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(Select),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}
