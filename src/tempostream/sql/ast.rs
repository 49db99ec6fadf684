//! Expression AST for aggregation queries.
//!
//! The engine consumes already-parsed conditions from the surrounding query
//! engine, so only the expression shapes the aggregation paths need are
//! modeled here: column references, literals, comparisons and boolean
//! connectives for the `on` join condition and the internal time-range
//! filters, plus the `within`/`per` selector expressions.

use serde::{Deserialize, Serialize};

/// Literal values appearing in conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralValue {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Null,
}

/// Binary operators usable in aggregation conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOperator {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    And,
    Or,
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOperator {
    Not,
}

/// An expression tree over event and aggregate attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Column reference
    Column(String),
    /// Literal value
    Literal(LiteralValue),
    /// Binary operation: expr op expr
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOperator,
        right: Box<Expr>,
    },
    /// Unary operation: op expr
    UnaryOp { op: UnaryOperator, expr: Box<Expr> },
}

impl Expr {
    /// Column reference
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column(name.into())
    }

    /// Integer literal
    pub fn integer(value: i64) -> Self {
        Expr::Literal(LiteralValue::Integer(value))
    }

    /// String literal
    pub fn string(value: impl Into<String>) -> Self {
        Expr::Literal(LiteralValue::String(value.into()))
    }

    /// Boolean literal
    pub fn boolean(value: bool) -> Self {
        Expr::Literal(LiteralValue::Boolean(value))
    }

    /// Comparison between two expressions
    pub fn compare(left: Expr, op: BinaryOperator, right: Expr) -> Self {
        Expr::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// Logical conjunction
    pub fn and(left: Expr, right: Expr) -> Self {
        Expr::BinaryOp {
            left: Box::new(left),
            op: BinaryOperator::And,
            right: Box::new(right),
        }
    }

    /// Logical disjunction
    pub fn or(left: Expr, right: Expr) -> Self {
        Expr::BinaryOp {
            left: Box::new(left),
            op: BinaryOperator::Or,
            right: Box::new(right),
        }
    }

    /// Collect every column name referenced by this expression
    pub fn referenced_columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut Vec<String>) {
        match self {
            Expr::Column(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Literal(_) => {}
            Expr::BinaryOp { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::UnaryOp { expr, .. } => expr.collect_columns(out),
        }
    }
}

/// The `within` clause of an aggregation query: a mandatory range start and
/// an optional range end. When the end is omitted the range is clipped at
/// the query evaluation instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Within {
    pub start: Expr,
    pub end: Option<Expr>,
}

impl Within {
    /// Range with explicit start and end
    pub fn range(start: Expr, end: Expr) -> Self {
        Within {
            start,
            end: Some(end),
        }
    }

    /// Open-ended range clipped at the evaluation instant
    pub fn starting_at(start: Expr) -> Self {
        Within { start, end: None }
    }
}
