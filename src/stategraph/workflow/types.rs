// SPDX-License-Identifier: MIT

//! YAML schema types for graph definitions
//!
//! This module contains the data structures used for parsing graph YAML
//! files. They are plain data; `GraphBuilder` turns them into a
//! `CompiledGraph`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::graph::ExecutionLimits;
use crate::engine::state::StateSchema;

/// Top-level graph definition
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GraphDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// State schema for the graph
    #[serde(default)]
    pub state: StateSchema,
    /// Nodes the run pauses before
    #[serde(default)]
    pub interrupt_before: Vec<String>,
    /// Overrides the limits of the execution context
    #[serde(default)]
    pub limits: Option<ExecutionLimits>,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

/// A node in the graph
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NodeDefinition {
    /// Unique node identifier
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// What a node does when it runs
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    /// Constant partial update; string values may embed `{{path}}` templates
    Update { values: Map<String, Value> },
    /// External process fed the state as JSON on stdin
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        /// Kill the process after this many seconds
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Node registered by the host application
    Handler { handler: String },
}

/// Edge specification.
///
/// `from` + `to` gives plain edges; a list in `from` makes a join into a
/// single `to`. `from` + `branches` gives a conditional edge.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EdgeDefinition {
    pub from: NodeRefs,
    #[serde(default)]
    pub to: Option<NodeRefs>,
    #[serde(default)]
    pub branches: Vec<BranchDefinition>,
    /// Route key -> destination; omitted means keys are node names
    #[serde(default)]
    pub map: Option<BTreeMap<String, String>>,
}

/// One conditional branch rule
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BranchDefinition {
    /// Condition expression; absent means "otherwise"
    #[serde(default)]
    pub when: Option<String>,
    pub route: NodeRefs,
}

/// Node reference (single string or array)
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum NodeRefs {
    Single(String),
    Multiple(Vec<String>),
}

impl NodeRefs {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            NodeRefs::Single(s) => vec![s.clone()],
            NodeRefs::Multiple(v) => v.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_refs() {
        assert_eq!(NodeRefs::Single("a".to_string()).to_vec(), vec!["a"]);
        let refs = NodeRefs::Multiple(vec!["b2".to_string(), "c".to_string()]);
        assert_eq!(refs.to_vec(), vec!["b2", "c"]);
    }

    #[test]
    fn test_node_kinds() {
        let node: NodeDefinition = serde_yaml::from_str(
            r#"
id: grade
kind: command
program: ./grade.sh
args: ["--strict"]
timeout_secs: 5
"#,
        )
        .unwrap();
        assert_eq!(node.id, "grade");
        assert_eq!(
            node.kind,
            NodeKind::Command {
                program: "./grade.sh".to_string(),
                args: vec!["--strict".to_string()],
                env: BTreeMap::new(),
                timeout_secs: Some(5),
            }
        );

        let node: NodeDefinition =
            serde_yaml::from_str("{ id: a, kind: update, values: { aggregate: [A] } }").unwrap();
        match node.kind {
            NodeKind::Update { values } => assert_eq!(values["aggregate"], json!(["A"])),
            other => panic!("Expected update node, got {:?}", other),
        }

        let result: Result<NodeDefinition, _> = serde_yaml::from_str("{ id: a, kind: agent }");
        assert!(result.is_err());
    }
}
