//! Evaluates parsed conditions against a state snapshot
//!
//! Evaluation never fails: a missing path reads as `null`, and a comparison
//! between mismatched types is simply false.

use std::cmp::Ordering;

use super::ast::{CompareOp, Expression, Literal};
use crate::engine::state::WorkflowState;
use serde_json::Value;

pub fn evaluate(expr: &Expression, state: &WorkflowState) -> bool {
    match expr {
        Expression::True => true,
        Expression::False => false,
        Expression::Truthy(path) => state.get_path(path).map_or(false, truthy),
        Expression::Compare { left, op, right } => {
            let value = state.get_path(left).unwrap_or(&Value::Null);
            holds(value, op, right)
        }
        Expression::Not(inner) => !evaluate(inner, state),
        Expression::And(lhs, rhs) => evaluate(lhs, state) && evaluate(rhs, state),
        Expression::Or(lhs, rhs) => evaluate(lhs, state) || evaluate(rhs, state),
    }
}

fn holds(value: &Value, op: &CompareOp, literal: &Literal) -> bool {
    match op {
        CompareOp::Eq => literal.matches(value),
        CompareOp::NotEq => !literal.matches(value),
        CompareOp::Contains => match value {
            Value::String(text) => {
                matches!(literal, Literal::String(needle) if text.contains(needle.as_str()))
            }
            Value::Array(items) => {
                *literal != Literal::Null && items.iter().any(|item| literal.matches(item))
            }
            _ => false,
        },
        ordering => {
            let Some(order) = numeric_order(value, literal) else {
                return false;
            };
            match ordering {
                CompareOp::Gt => order == Ordering::Greater,
                CompareOp::Gte => order != Ordering::Less,
                CompareOp::Lt => order == Ordering::Less,
                _ => order != Ordering::Greater,
            }
        }
    }
}

/// Ordering of a numeric value against a numeric literal
fn numeric_order(value: &Value, literal: &Literal) -> Option<Ordering> {
    match literal {
        Literal::Number(rhs) => value.as_f64()?.partial_cmp(rhs),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

impl Literal {
    /// Equality against a JSON value; numbers compare within `f64::EPSILON`
    fn matches(&self, value: &Value) -> bool {
        match self {
            Literal::Null => value.is_null(),
            Literal::Boolean(flag) => value.as_bool() == Some(*flag),
            Literal::String(text) => value.as_str() == Some(text.as_str()),
            Literal::Number(n) => value.as_f64().map_or(false, |f| (f - n).abs() < f64::EPSILON),
        }
    }
}
