//! Graph type definitions
//!
//! Edges, limits and the values a compiled graph hands back to its callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::engine::router::Router;
use crate::stategraph::checkpoint::RunStatus;

/// Virtual node the run starts from
pub const START: &str = "__start__";
/// Terminal marker; routing here ends a branch
pub const END: &str = "__end__";
/// Node name recorded on manual updates not attributed to a node
pub const OVERRIDE: &str = "__override__";

pub const DEFAULT_MAX_STEPS: u32 = 25;

pub fn is_reserved(name: &str) -> bool {
    matches!(name, START | END | OVERRIDE)
}

/// Conditional edge: a router plus route key -> destination mapping
#[derive(Clone)]
pub struct Branch {
    pub router: Arc<dyn Router>,
    pub mapping: BTreeMap<String, String>,
}

/// Wait-for-all edge: `target` fires once every source completed
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub sources: BTreeSet<String>,
    pub target: String,
}

/// Budget on node executions within one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Total node executions allowed per run
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Per-node execution caps
    #[serde(default)]
    pub visit_limits: BTreeMap<String, u32>,
}

fn default_max_steps() -> u32 {
    DEFAULT_MAX_STEPS
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            visit_limits: BTreeMap::new(),
        }
    }
}

impl ExecutionLimits {
    pub fn max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn visit_limit(mut self, node: impl Into<String>, limit: u32) -> Self {
        self.visit_limits.insert(node.into(), limit);
        self
    }
}

/// State right after a checkpoint was written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub seq: u64,
    pub node: String,
    pub state: Value,
}

/// Result of one `invoke` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub thread_id: String,
    pub run_id: String,
    pub status: RunStatus,
    /// State after the last checkpoint
    pub state: Value,
    /// Nodes that run on resume; empty once completed
    pub next: Vec<String>,
    /// Snapshots produced by this call, in order
    pub snapshots: Vec<StateSnapshot>,
}

/// Progress events emitted while a run streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GraphEvent {
    Step {
        seq: u64,
        node: String,
        update: Value,
        state: Value,
    },
    Paused {
        seq: u64,
        next: Vec<String>,
        state: Value,
    },
    Completed {
        state: Value,
    },
    Failed {
        error: String,
    },
}

/// Inspection view of a thread's latest checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadState {
    pub thread_id: String,
    pub run_id: String,
    pub values: Value,
    pub next: Vec<String>,
    pub status: RunStatus,
    pub seq: u64,
    pub node: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved("__start__"));
        assert!(is_reserved("__end__"));
        assert!(is_reserved("__override__"));
        assert!(!is_reserved("start"));
    }

    #[test]
    fn test_limits_deserialize_with_defaults() {
        let limits: ExecutionLimits = serde_yaml::from_str("visit_limits: { generate: 3 }").unwrap();
        assert_eq!(limits.max_steps, DEFAULT_MAX_STEPS);
        assert_eq!(limits.visit_limits["generate"], 3);

        let limits = ExecutionLimits::default().max_steps(5).visit_limit("a", 1);
        assert_eq!(limits.max_steps, 5);
        assert_eq!(limits.visit_limits.len(), 1);
    }

    #[test]
    fn test_event_wire_format() {
        let event = GraphEvent::Paused {
            seq: 2,
            next: vec!["human_feedback".to_string()],
            state: json!({"input": "hi"}),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "paused", "seq": 2, "next": ["human_feedback"], "state": {"input": "hi"}})
        );

        let failed: GraphEvent =
            serde_json::from_value(json!({"event": "failed", "error": "boom"})).unwrap();
        assert_eq!(failed, GraphEvent::Failed { error: "boom".to_string() });
    }
}
