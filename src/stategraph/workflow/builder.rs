// SPDX-License-Identifier: MIT

//! Graph builder - turns YAML definitions into compiled graphs
//!
//! Node kinds map to the built-in nodes or to handlers from the
//! `NodeRegistry`; branch rules become a `ConditionRouter`. Structural checks
//! are left to `StateGraph::compile`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::error::{BuildError, GraphError};
use crate::engine::node::Node;
use crate::engine::state::StateSchema;
use crate::stategraph::nodes::{CommandNode, UpdateNode};
use crate::stategraph::workflow::condition::{parse, BranchRule, ConditionRouter};
use crate::stategraph::workflow::graph::{CompiledGraph, GraphContext, StateGraph};
use crate::stategraph::workflow::loader::GraphLoader;
use crate::stategraph::workflow::registry::NodeRegistry;
use crate::stategraph::workflow::types::{
    BranchDefinition, EdgeDefinition, GraphDefinition, NodeDefinition, NodeKind, NodeRefs,
};

/// High-level builder for constructing graphs from YAML definitions
pub struct GraphBuilder {
    loader: GraphLoader,
    registry: NodeRegistry,
}

impl GraphBuilder {
    pub fn new(registry: NodeRegistry) -> Self {
        Self {
            loader: GraphLoader::new(),
            registry,
        }
    }

    /// Build a graph from a YAML file path
    pub async fn build_file<P: AsRef<Path>>(
        &self,
        path: P,
        ctx: GraphContext,
    ) -> Result<CompiledGraph, GraphError> {
        let def = self.loader.load_graph(path)?;
        self.build(&def, ctx).await
    }

    /// Build a graph from a parsed definition
    pub async fn build(
        &self,
        def: &GraphDefinition,
        ctx: GraphContext,
    ) -> Result<CompiledGraph, GraphError> {
        let mut graph = StateGraph::new(def.state.clone());

        for node_def in &def.nodes {
            let node = self.build_node(node_def, &def.state).await?;
            graph = graph.add_shared_node(node_def.id.clone(), node);
        }

        for edge in &def.edges {
            graph = add_edge(graph, edge, &def.state)?;
        }

        graph = graph.interrupt_before(def.interrupt_before.iter().cloned());

        let ctx = match &def.limits {
            Some(limits) => ctx.with_limits(limits.clone()),
            None => ctx,
        };

        let compiled = graph.compile(ctx)?;
        log::info!(
            "Built graph '{}' with {} nodes",
            def.name,
            compiled.node_names().len()
        );
        Ok(compiled)
    }

    async fn build_node(
        &self,
        node_def: &NodeDefinition,
        schema: &StateSchema,
    ) -> Result<Arc<dyn Node>, GraphError> {
        match &node_def.kind {
            NodeKind::Update { values } => {
                if let Some(field) = values.keys().find(|k| !schema.contains(k)) {
                    return Err(BuildError::InvalidNode {
                        node: node_def.id.clone(),
                        message: format!("updates unknown state field '{}'", field),
                    }
                    .into());
                }
                Ok(Arc::new(UpdateNode::new(values.clone())))
            }
            NodeKind::Command {
                program,
                args,
                env,
                timeout_secs,
            } => {
                if program.trim().is_empty() {
                    return Err(BuildError::InvalidNode {
                        node: node_def.id.clone(),
                        message: "command node needs a program".to_string(),
                    }
                    .into());
                }
                let mut node = CommandNode::new(program.clone())
                    .args(args.iter().cloned())
                    .env(env.clone());
                if let Some(secs) = timeout_secs {
                    node = node.timeout(Duration::from_secs(*secs));
                }
                Ok(Arc::new(node))
            }
            NodeKind::Handler { handler } => self
                .registry
                .get(handler)
                .await
                .ok_or_else(|| BuildError::UnknownHandler(handler.clone()).into()),
        }
    }
}

fn add_edge(
    graph: StateGraph,
    edge: &EdgeDefinition,
    schema: &StateSchema,
) -> Result<StateGraph, GraphError> {
    let sources = edge.from.to_vec();
    let invalid = |message: &str| -> GraphError {
        BuildError::InvalidEdge {
            from: sources.join(", "),
            message: message.to_string(),
        }
        .into()
    };

    if !edge.branches.is_empty() {
        if edge.to.is_some() {
            return Err(invalid("use either 'to' or 'branches', not both"));
        }
        let [from] = sources.as_slice() else {
            return Err(invalid("a conditional edge has exactly one source"));
        };
        let rules = edge
            .branches
            .iter()
            .map(|branch| branch_rule(branch, schema))
            .collect::<Result<Vec<_>, _>>()?;
        let mapping = edge.map.clone().unwrap_or_default();
        return Ok(graph.add_conditional_edges(from.clone(), ConditionRouter::new(rules), mapping));
    }

    if edge.map.is_some() {
        return Err(invalid("'map' only applies to 'branches'"));
    }
    let Some(to) = &edge.to else {
        return Err(invalid("edge needs 'to' or 'branches'"));
    };

    match &edge.from {
        NodeRefs::Multiple(joined) => {
            let [target] = to.to_vec().try_into().map_err(|_: Vec<String>| {
                invalid("a join has exactly one destination")
            })?;
            Ok(graph.add_join(joined.iter().cloned(), target))
        }
        NodeRefs::Single(from) => Ok(to
            .to_vec()
            .into_iter()
            .fold(graph, |graph, dest| graph.add_edge(from.clone(), dest))),
    }
}

fn branch_rule(branch: &BranchDefinition, schema: &StateSchema) -> Result<BranchRule, GraphError> {
    let when = match &branch.when {
        Some(expression) => {
            let condition = parse(expression).map_err(|e| BuildError::InvalidCondition {
                expression: expression.clone(),
                message: e.to_string(),
            })?;
            for path in condition.paths() {
                let field = path.split('.').next().unwrap_or(path);
                if !schema.contains(field) {
                    return Err(BuildError::InvalidCondition {
                        expression: expression.clone(),
                        message: format!("unknown state field '{}'", field),
                    }
                    .into());
                }
            }
            Some(condition)
        }
        None => None,
    };
    Ok(BranchRule {
        when,
        routes: branch.route.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::NodeError;
    use crate::engine::state::{StateUpdate, WorkflowState};
    use crate::stategraph::checkpoint::RunStatus;
    use async_trait::async_trait;
    use serde_json::json;

    struct Feedback;

    #[async_trait]
    impl Node for Feedback {
        async fn run(&self, state: &WorkflowState) -> Result<StateUpdate, NodeError> {
            let feedback = state
                .get("user_feedback")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            Ok(StateUpdate::new().set("log", json!([format!("feedback:{}", feedback)])))
        }
    }

    fn parse_def(yaml: &str) -> GraphDefinition {
        GraphLoader::parse_yaml(yaml).unwrap()
    }

    const FAN_OUT: &str = r#"
name: fan-out
state:
  aggregate: { type: array, reducer: append }
  which: { type: string }
nodes:
  - { id: a, kind: update, values: { aggregate: [A] } }
  - { id: b, kind: update, values: { aggregate: [B] } }
  - { id: c, kind: update, values: { aggregate: [C] } }
  - { id: d, kind: update, values: { aggregate: [D] } }
  - { id: e, kind: update, values: { aggregate: [E] } }
edges:
  - { from: __start__, to: a }
  - from: a
    branches:
      - { when: "which == 'cd'", route: [c, d] }
      - { route: [b, c] }
  - { from: [b, c, d], to: e }
  - { from: e, to: __end__ }
"#;

    #[tokio::test]
    async fn test_build_fan_out() {
        // join over b, c, d never fires when only two of them run
        let builder = GraphBuilder::new(NodeRegistry::new());
        let mut def = parse_def(FAN_OUT);
        let graph = builder.build(&def, GraphContext::in_memory()).await.unwrap();
        let err = graph
            .invoke(Some(json!({"aggregate": [], "which": "cd"})), "t")
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Deadlock { .. }));

        def.edges[2] = serde_yaml::from_str("{ from: b, to: e }").unwrap();
        def.edges.push(serde_yaml::from_str("{ from: c, to: e }").unwrap());
        def.edges.push(serde_yaml::from_str("{ from: d, to: e }").unwrap());
        let graph = builder.build(&def, GraphContext::in_memory()).await.unwrap();
        let outcome = graph
            .invoke(Some(json!({"aggregate": [], "which": "cd"})), "t")
            .await
            .unwrap();
        assert_eq!(outcome.state["aggregate"], json!(["A", "C", "D", "E"]));
    }

    #[tokio::test]
    async fn test_handler_nodes_come_from_registry() {
        let yaml = r#"
name: review
state:
  log: { type: array, reducer: append }
  user_feedback: { type: string }
interrupt_before: [human_feedback]
nodes:
  - { id: human_feedback, kind: handler, handler: feedback }
edges:
  - { from: __start__, to: human_feedback }
  - { from: human_feedback, to: __end__ }
"#;
        let registry = NodeRegistry::new();
        let builder = GraphBuilder::new(registry.clone());
        let err = builder
            .build(&parse_def(yaml), GraphContext::in_memory())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GraphError::Build(BuildError::UnknownHandler(_))));

        registry.register("feedback", Arc::new(Feedback)).await;
        let graph = builder
            .build(&parse_def(yaml), GraphContext::in_memory())
            .await
            .unwrap();
        assert_eq!(graph.interrupt_nodes(), vec!["human_feedback"]);

        let outcome = graph
            .invoke(Some(json!({"log": [], "user_feedback": ""})), "t")
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Paused);
        graph
            .update_state("t", json!({"user_feedback": "go"}), None)
            .await
            .unwrap();
        let outcome = graph.invoke(None, "t").await.unwrap();
        assert_eq!(outcome.state["log"], json!(["feedback:go"]));
    }

    #[tokio::test]
    async fn test_invalid_definitions() {
        let builder = GraphBuilder::new(NodeRegistry::new());
        let base = r#"
name: bad
state:
  which: { type: string }
nodes:
  - { id: a, kind: update, values: { which: x } }
edges:
  - { from: __start__, to: a }
"#;
        let with_edge = |edge: &str| {
            let mut def = parse_def(base);
            def.edges.push(serde_yaml::from_str(edge).unwrap());
            def
        };

        let cases = [
            "{ from: a, branches: [{ when: \"which ==\", route: __end__ }] }",
            "{ from: a, branches: [{ when: \"missing == 1\", route: __end__ }] }",
            "{ from: a, to: __end__, branches: [{ route: __end__ }] }",
            "{ from: [a, a], branches: [{ route: __end__ }] }",
            "{ from: a, to: __end__, map: { x: y } }",
            "{ from: [a], to: [b, c] }",
            "{ from: a }",
        ];
        for edge in cases {
            let err = builder
                .build(&with_edge(edge), GraphContext::in_memory())
                .await
                .err()
                .unwrap();
            assert!(matches!(err, GraphError::Build(_)), "{}: {}", edge, err);
        }

        let mut def = parse_def(base);
        def.nodes[0] = serde_yaml::from_str("{ id: a, kind: update, values: { nope: 1 } }").unwrap();
        def.edges.push(serde_yaml::from_str("{ from: a, to: __end__ }").unwrap());
        let err = builder.build(&def, GraphContext::in_memory()).await.err().unwrap();
        assert!(matches!(err, GraphError::Build(BuildError::InvalidNode { .. })));
    }

    #[tokio::test]
    async fn test_definition_limits_override_context() {
        let yaml = r#"
name: loop
state:
  n: { type: integer }
limits: { max_steps: 4 }
nodes:
  - { id: tick, kind: update, values: { n: 1 } }
edges:
  - { from: __start__, to: tick }
  - from: tick
    branches:
      - { route: tick }
"#;
        let builder = GraphBuilder::new(NodeRegistry::new());
        let graph = builder
            .build(&parse_def(yaml), GraphContext::in_memory())
            .await
            .unwrap();
        assert_eq!(graph.limits().max_steps, 4);
        let err = graph.invoke(Some(json!({"n": 0})), "t").await.unwrap_err();
        assert!(matches!(
            err,
            GraphError::CycleBudgetExceeded { ref scope, limit: 4, ref trace } if scope == "run" && trace.len() == 4
        ));
    }
}
