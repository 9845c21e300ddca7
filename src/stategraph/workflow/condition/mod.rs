// SPDX-License-Identifier: MIT

//! Condition evaluation for conditional edges
//!
//! This module provides parsing and evaluation of `when` conditions.
//! Conditions are simple expressions like:
//! - `grade == 'not supported'`
//! - `confidence > 0.8`
//! - `web_search or (documents contains 'stale' and not retried)`

mod ast;
mod evaluator;
mod parser;
mod router;

pub use ast::{CompareOp, Expression, Literal};
pub use evaluator::evaluate;
pub use parser::{parse, ConditionError};
pub use router::{BranchRule, ConditionRouter};
