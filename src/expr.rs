// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use serde_derive::{Deserialize, Serialize};

/// An expression, as used in access policies and computed defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "exprType")]
pub enum Expr {
    /// A literal expression.
    Literal { value: Literal },
    /// The literal `null`.
    Null,
    /// The row the expression is being evaluated against.
    This,
    /// A field of the current row (shorthand for `Member { This, name }`).
    Field { name: String },
    /// Member access, eg `post.author.id`.
    Member { object: Box<Expr>, member: String },
    /// A function call; `auth` is reserved for the authenticated context.
    Call { function: String, args: Vec<Expr> },
    /// A unary expression.
    Unary { op: UnaryOp, expr: Box<Expr> },
    /// A binary expression.
    Binary(BinaryExpr),
    /// An array literal, usable on the right of `in`.
    Array { elements: Vec<Expr> },
    /// A quantified predicate over a to-many relation field.
    Collection {
        op: CollectionOp,
        field: Box<Expr>,
        predicate: Box<Expr>,
    },
}

/// Various literals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    In,
}

/// Quantifiers over collection fields: `?` (some), `!` (every), `^` (none).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionOp {
    Some,
    Every,
    None,
}

/// A binary expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryExpr {
    pub left: Box<Expr>,
    pub op: BinaryOp,
    pub right: Box<Expr>,
}

impl BinaryExpr {
    pub fn new(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary(BinaryExpr {
            left: Box::new(left),
            op,
            right: Box::new(right),
        })
    }

    pub fn eq(left: Expr, right: Expr) -> Expr {
        Self::new(BinaryOp::Eq, left, right)
    }

    pub fn and(left: Expr, right: Expr) -> Expr {
        Self::new(BinaryOp::And, left, right)
    }

    pub fn or(left: Expr, right: Expr) -> Expr {
        Self::new(BinaryOp::Or, left, right)
    }
}

impl Expr {
    pub fn literal(value: impl Into<Literal>) -> Expr {
        Expr::Literal {
            value: value.into(),
        }
    }

    pub fn field(name: impl Into<String>) -> Expr {
        Expr::Field { name: name.into() }
    }

    /// The reserved `auth()` call.
    pub fn auth() -> Expr {
        Expr::Call {
            function: "auth".into(),
            args: vec![],
        }
    }

    pub fn member(self, member: impl Into<String>) -> Expr {
        Expr::Member {
            object: Box::new(self),
            member: member.into(),
        }
    }

    pub fn not(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(self),
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(
            self,
            Expr::Literal {
                value: Literal::Bool(true)
            }
        )
    }

    pub fn is_false(&self) -> bool {
        matches!(
            self,
            Expr::Literal {
                value: Literal::Bool(false)
            }
        )
    }

    /// Collapses constant boolean branches. The policy combiner and the
    /// filter compiler both rely on this to drop redundant clauses.
    pub fn fold(self) -> Expr {
        match self {
            Expr::Binary(BinaryExpr { left, op, right }) => {
                let left = left.fold();
                let right = right.fold();
                match op {
                    BinaryOp::And => {
                        if left.is_false() || right.is_false() {
                            Expr::literal(false)
                        } else if left.is_true() {
                            right
                        } else if right.is_true() {
                            left
                        } else {
                            BinaryExpr::new(op, left, right)
                        }
                    }
                    BinaryOp::Or => {
                        if left.is_true() || right.is_true() {
                            Expr::literal(true)
                        } else if left.is_false() {
                            right
                        } else if right.is_false() {
                            left
                        } else {
                            BinaryExpr::new(op, left, right)
                        }
                    }
                    _ => BinaryExpr::new(op, left, right),
                }
            }
            Expr::Unary {
                op: UnaryOp::Not,
                expr,
            } => {
                let inner = expr.fold();
                if inner.is_true() {
                    Expr::literal(false)
                } else if inner.is_false() {
                    Expr::literal(true)
                } else {
                    inner.not()
                }
            }
            other => other,
        }
    }

    /// Conjoins a list of expressions, folding constants away. An empty list
    /// yields `true`.
    pub fn conjoin(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        exprs
            .into_iter()
            .fold(None, |acc: Option<Expr>, e| match acc {
                None => Some(e),
                Some(acc) => Some(BinaryExpr::and(acc, e)),
            })
            .map(Expr::fold)
            .unwrap_or_else(|| Expr::literal(true))
    }

    /// Disjoins a list of expressions, folding constants away. An empty list
    /// yields `false`: nothing allowed.
    pub fn disjoin(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        exprs
            .into_iter()
            .fold(None, |acc: Option<Expr>, e| match acc {
                None => Some(e),
                Some(acc) => Some(BinaryExpr::or(acc, e)),
            })
            .map(Expr::fold)
            .unwrap_or_else(|| Expr::literal(false))
    }
}

impl From<Literal> for Expr {
    fn from(literal: Literal) -> Self {
        Expr::Literal { value: literal }
    }
}

impl From<BinaryExpr> for Expr {
    fn from(expr: BinaryExpr) -> Self {
        Expr::Binary(expr)
    }
}

impl From<bool> for Literal {
    fn from(val: bool) -> Self {
        Literal::Bool(val)
    }
}

impl From<i64> for Literal {
    fn from(val: i64) -> Self {
        Literal::I64(val)
    }
}

impl From<f64> for Literal {
    fn from(val: f64) -> Self {
        Literal::F64(val)
    }
}

impl From<&str> for Literal {
    fn from(val: &str) -> Self {
        Literal::String(val.to_string())
    }
}

impl From<String> for Literal {
    fn from(val: String) -> Self {
        Literal::String(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parsing_tagged_json() {
        let expr: Expr = serde_json::from_str(
            r#"{
            "exprType": "Binary",
            "left": { "exprType": "Field", "name": "value" },
            "op": "Gt",
            "right": { "exprType": "Literal", "value": 1 }
        }"#,
        )
        .unwrap();

        assert_eq!(
            expr,
            BinaryExpr::new(BinaryOp::Gt, Expr::field("value"), Expr::literal(1i64))
        );
    }

    #[test]
    fn test_fold_and() {
        let e = BinaryExpr::and(Expr::literal(true), Expr::field("x")).fold();
        assert_eq!(e, Expr::field("x"));

        let e = BinaryExpr::and(Expr::field("x"), Expr::literal(false)).fold();
        assert!(e.is_false());
    }

    #[test]
    fn test_fold_or() {
        let e = BinaryExpr::or(Expr::literal(false), Expr::field("x")).fold();
        assert_eq!(e, Expr::field("x"));

        let e = BinaryExpr::or(Expr::field("x"), Expr::literal(true)).fold();
        assert!(e.is_true());
    }

    #[test]
    fn test_fold_not() {
        assert!(Expr::literal(true).not().fold().is_false());
        assert!(Expr::literal(false).not().fold().is_true());
    }

    #[test]
    fn test_disjoin_empty_is_false() {
        assert!(Expr::disjoin(vec![]).is_false());
        assert!(Expr::conjoin(vec![]).is_true());
    }

    #[test]
    fn test_nested_fold() {
        // (true && x) || (false && y)  ==>  x
        let e = BinaryExpr::or(
            BinaryExpr::and(Expr::literal(true), Expr::field("x")),
            BinaryExpr::and(Expr::literal(false), Expr::field("y")),
        )
        .fold();
        assert_eq!(e, Expr::field("x"));
    }
}
