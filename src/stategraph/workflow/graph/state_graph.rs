// SPDX-License-Identifier: MIT

//! Graph builder
//!
//! ```no_run
//! use stategraph_rs::engine::{FieldType, FnNode, StateFieldDef, StateSchema, StateUpdate, WorkflowState};
//! use stategraph_rs::stategraph::workflow::graph::{GraphContext, StateGraph, END};
//!
//! # async fn demo() -> Result<(), stategraph_rs::engine::GraphError> {
//! let schema = StateSchema::new()
//!     .field("question", StateFieldDef::new(FieldType::String))
//!     .field("answer", StateFieldDef::new(FieldType::String));
//!
//! let _graph = StateGraph::new(schema)
//!     .add_node("answer", FnNode::new(|_state: &WorkflowState| Ok(StateUpdate::new().set("answer", "X"))))
//!     .set_entry_point("answer")
//!     .add_edge("answer", END)
//!     .compile(GraphContext::in_memory())?;
//! # Ok(())
//! # }
//! ```

use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use super::context::GraphContext;
use super::executor::CompiledGraph;
use super::interrupt::InterruptController;
use super::types::{is_reserved, Branch, Join, END, START};
use crate::engine::error::{BuildError, GraphError};
use crate::engine::node::Node;
use crate::engine::router::Router;
use crate::engine::state::StateSchema;

/// Mutable graph definition; `compile` turns it into a runnable graph
pub struct StateGraph {
    schema: StateSchema,
    nodes: BTreeMap<String, Arc<dyn Node>>,
    edges: Vec<(String, String)>,
    branches: Vec<(String, Branch)>,
    joins: Vec<Join>,
    interrupts: Vec<String>,
    errors: Vec<BuildError>,
}

impl StateGraph {
    pub fn new(schema: StateSchema) -> Self {
        Self {
            schema,
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            branches: Vec::new(),
            joins: Vec::new(),
            interrupts: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn add_node(self, name: impl Into<String>, node: impl Node + 'static) -> Self {
        self.add_shared_node(name, Arc::new(node))
    }

    pub fn add_shared_node(mut self, name: impl Into<String>, node: Arc<dyn Node>) -> Self {
        let name = name.into();
        if is_reserved(&name) {
            self.errors.push(BuildError::ReservedName(name));
        } else if self.nodes.contains_key(&name) {
            self.errors.push(BuildError::DuplicateNode(name));
        } else {
            self.nodes.insert(name, node);
        }
        self
    }

    /// Unconditional edge
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    pub fn set_entry_point(self, node: impl Into<String>) -> Self {
        self.add_edge(START, node)
    }

    pub fn set_finish_point(self, node: impl Into<String>) -> Self {
        self.add_edge(node, END)
    }

    /// `target` runs once every node in `sources` has completed
    pub fn add_join<I, S>(mut self, sources: I, target: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.joins.push(Join {
            sources: sources.into_iter().map(Into::into).collect(),
            target: target.into(),
        });
        self
    }

    /// Conditional edge out of `from`.
    ///
    /// `mapping` sends route keys to destinations. An empty mapping means every
    /// route key names its destination directly.
    pub fn add_conditional_edges<I, K, V>(
        self,
        from: impl Into<String>,
        router: impl Router + 'static,
        mapping: I,
    ) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.add_shared_conditional_edges(from, Arc::new(router), mapping)
    }

    pub fn add_shared_conditional_edges<I, K, V>(
        mut self,
        from: impl Into<String>,
        router: Arc<dyn Router>,
        mapping: I,
    ) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut mapping: BTreeMap<String, String> = mapping
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        if mapping.is_empty() {
            mapping = router
                .outcomes()
                .into_iter()
                .map(|key| (key.clone(), key))
                .collect();
        }
        self.branches.push((from.into(), Branch { router, mapping }));
        self
    }

    /// Pause before any of these nodes runs
    pub fn interrupt_before<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interrupts.extend(nodes.into_iter().map(Into::into));
        self
    }

    /// Validate the structure and produce a runnable graph
    pub fn compile(self, ctx: GraphContext) -> Result<CompiledGraph, GraphError> {
        self.schema.validate().map_err(BuildError::from)?;
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err.into());
        }

        let nodes = self.nodes;
        let is_node = |name: &str| nodes.contains_key(name);

        let mut edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (from, to) in &self.edges {
            if from != START && !is_node(from) {
                return Err(unknown(format!("edge {} -> {}", from, to), from));
            }
            if to == START {
                return Err(BuildError::InvalidEdge {
                    from: from.clone(),
                    message: format!("'{}' cannot be a destination", START),
                }
                .into());
            }
            if to != END && !is_node(to) {
                return Err(unknown(format!("edge {} -> {}", from, to), to));
            }
            let targets = edges.entry(from.clone()).or_default();
            if !targets.contains(to) {
                targets.push(to.clone());
            }
        }

        let mut branches: BTreeMap<String, Branch> = BTreeMap::new();
        for (from, branch) in self.branches {
            if from != START && !is_node(&from) {
                return Err(unknown(format!("conditional edge from {}", from), &from));
            }
            let outcomes = branch.router.outcomes();
            if outcomes.is_empty() {
                return Err(BuildError::InvalidEdge {
                    from,
                    message: "router declares no outcomes".to_string(),
                }
                .into());
            }
            for outcome in &outcomes {
                if !branch.mapping.contains_key(outcome) {
                    return Err(GraphError::Routing {
                        node: from,
                        key: Some(outcome.clone()),
                    });
                }
            }
            for dest in branch.mapping.values() {
                if dest == START || (dest != END && !is_node(dest)) {
                    return Err(unknown(format!("conditional edge from {}", from), dest));
                }
            }
            if branches.contains_key(&from) {
                return Err(BuildError::DuplicateBranch(from).into());
            }
            branches.insert(from, branch);
        }

        if !edges.contains_key(START) && !branches.contains_key(START) {
            return Err(BuildError::MissingEntry.into());
        }

        let mut join_targets = BTreeSet::new();
        for join in &self.joins {
            if !is_node(&join.target) {
                return Err(unknown("join".to_string(), &join.target));
            }
            if join.sources.is_empty() {
                return Err(BuildError::InvalidEdge {
                    from: join.target.clone(),
                    message: "join has no sources".to_string(),
                }
                .into());
            }
            for source in &join.sources {
                if !is_node(source) {
                    return Err(unknown(format!("join into {}", join.target), source));
                }
            }
            if join.sources.contains(&join.target) {
                return Err(GraphError::Deadlock {
                    target: join.target.clone(),
                    missing: vec![join.target.clone()],
                });
            }
            if !join_targets.insert(join.target.clone()) {
                return Err(BuildError::DuplicateJoin(join.target.clone()).into());
            }
        }

        for node in &self.interrupts {
            if !is_node(node) {
                return Err(unknown("interrupt_before".to_string(), node));
            }
        }
        for node in ctx.limits().visit_limits.keys() {
            if !is_node(node) {
                return Err(unknown("visit limit".to_string(), node));
            }
        }

        for name in nodes.keys() {
            let has_exit = edges.contains_key(name)
                || branches.contains_key(name)
                || self.joins.iter().any(|j| j.sources.contains(name));
            if !has_exit {
                return Err(BuildError::DeadEnd(name.clone()).into());
            }
        }

        let reachable = reachable_nodes(&edges, &branches, &self.joins);
        for join in &self.joins {
            let missing: Vec<String> = join
                .sources
                .iter()
                .filter(|s| !reachable.contains(*s))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(GraphError::Deadlock {
                    target: join.target.clone(),
                    missing,
                });
            }
        }
        for name in nodes.keys().filter(|n| !reachable.contains(*n)) {
            log::warn!("Node '{}' is unreachable from {}", name, START);
        }

        log::debug!(
            "Compiled graph: {} nodes, {} conditional branches, {} joins",
            nodes.len(),
            branches.len(),
            self.joins.len()
        );

        Ok(CompiledGraph {
            schema: self.schema,
            nodes,
            edges,
            branches,
            joins: self.joins,
            interrupts: InterruptController::new(self.interrupts),
            store: ctx.store(),
            limits: ctx.limits().clone(),
            locks: DashMap::new(),
        })
    }
}

fn unknown(context: String, name: &str) -> GraphError {
    BuildError::UnknownNode {
        context,
        name: name.to_string(),
    }
    .into()
}

/// Nodes reachable from START; a join target counts once all its sources do
fn reachable_nodes(
    edges: &BTreeMap<String, Vec<String>>,
    branches: &BTreeMap<String, Branch>,
    joins: &[Join],
) -> BTreeSet<String> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<String> = VecDeque::from([START.to_string()]);

    while let Some(node) = queue.pop_front() {
        let mut next: Vec<&String> = Vec::new();
        if let Some(targets) = edges.get(&node) {
            next.extend(targets);
        }
        if let Some(branch) = branches.get(&node) {
            next.extend(branch.mapping.values());
        }
        for target in next {
            if target != END && seen.insert(target.clone()) {
                queue.push_back(target.clone());
            }
        }
        if queue.is_empty() {
            for join in joins {
                if !seen.contains(&join.target) && join.sources.is_subset(&seen) {
                    seen.insert(join.target.clone());
                    queue.push_back(join.target.clone());
                }
            }
        }
    }

    seen
}
