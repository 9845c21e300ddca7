// SPDX-License-Identifier: MIT

//! Parsed form of a `when` condition

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    True,
    False,
    /// `path`: holds when the value at `path` is non-empty and non-zero
    Truthy(String),
    /// `path <op> literal`
    Compare {
        left: String,
        op: CompareOp,
        right: Literal,
    },
    Not(Box<Expression>),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Substring of a string, or element of an array
    Contains,
}

impl CompareOp {
    /// Operator as written in a condition
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::NotEq => "!=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Contains => "contains",
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Right-hand side of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
}

impl Expression {
    /// Field paths the expression reads
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Expression::Compare { left, .. } => vec![left.as_str()],
            Expression::Truthy(path) => vec![path.as_str()],
            Expression::And(l, r) | Expression::Or(l, r) => {
                let mut paths = l.paths();
                paths.extend(r.paths());
                paths
            }
            Expression::Not(inner) => inner.paths(),
            Expression::True | Expression::False => vec![],
        }
    }
}
