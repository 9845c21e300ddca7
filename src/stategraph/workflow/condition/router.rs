// SPDX-License-Identifier: MIT

//! Router driven by ordered `when` rules

use async_trait::async_trait;

use super::ast::Expression;
use super::evaluator::evaluate;
use crate::engine::error::NodeError;
use crate::engine::router::Router;
use crate::engine::state::WorkflowState;

/// One branch rule; a rule without a condition always matches
#[derive(Debug, Clone, PartialEq)]
pub struct BranchRule {
    pub when: Option<Expression>,
    pub routes: Vec<String>,
}

/// Picks the routes of the first matching rule.
///
/// When no rule matches the router returns no route at all, which the executor
/// reports as a routing error.
#[derive(Debug, Clone, Default)]
pub struct ConditionRouter {
    rules: Vec<BranchRule>,
}

impl ConditionRouter {
    pub fn new(rules: Vec<BranchRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[BranchRule] {
        &self.rules
    }
}

#[async_trait]
impl Router for ConditionRouter {
    fn outcomes(&self) -> Vec<String> {
        let mut outcomes: Vec<String> = Vec::new();
        for route in self.rules.iter().flat_map(|r| r.routes.iter()) {
            if !outcomes.contains(route) {
                outcomes.push(route.clone());
            }
        }
        outcomes
    }

    async fn route(&self, state: &WorkflowState) -> Result<Vec<String>, NodeError> {
        let matched = self.rules.iter().find(|rule| match &rule.when {
            Some(condition) => evaluate(condition, state),
            None => true,
        });
        Ok(matched.map(|rule| rule.routes.clone()).unwrap_or_default())
    }
}
