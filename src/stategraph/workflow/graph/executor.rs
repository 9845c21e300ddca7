//! Graph executor
//!
//! Runs in supersteps. Every node scheduled for a step runs concurrently
//! against the same state snapshot. Once all of them return, their updates
//! are validated and merged, each node's routes are resolved against the
//! merged state, and only then is one checkpoint per node appended in
//! node-name order. A run can always resume from its last checkpoint.

use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use super::interrupt::InterruptController;
use super::types::{
    Branch, ExecutionLimits, GraphEvent, Join, RunOutcome, StateSnapshot, ThreadState, END,
    OVERRIDE, START,
};
use crate::engine::error::{CheckpointError, GraphError};
use crate::engine::node::Node;
use crate::engine::state::{type_name, SchemaError, StateSchema, StateUpdate, WorkflowState};
use crate::stategraph::checkpoint::{
    self, Checkpoint, CheckpointSource, CheckpointStore, Cursor, NewCheckpoint, RunStatus,
};

/// A validated graph bound to a checkpoint store
pub struct CompiledGraph {
    pub(super) schema: StateSchema,
    pub(super) nodes: BTreeMap<String, Arc<dyn Node>>,
    pub(super) edges: BTreeMap<String, Vec<String>>,
    pub(super) branches: BTreeMap<String, Branch>,
    pub(super) joins: Vec<Join>,
    pub(super) interrupts: InterruptController,
    pub(super) store: Arc<dyn CheckpointStore>,
    pub(super) limits: ExecutionLimits,
    pub(super) locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Mutable bookkeeping of one invocation
struct RunState<'a> {
    thread_id: &'a str,
    run_id: String,
    state: WorkflowState,
    cursor: Cursor,
    snapshots: Vec<StateSnapshot>,
    events: Option<&'a mpsc::Sender<GraphEvent>>,
}

impl RunState<'_> {
    async fn emit(&self, event: GraphEvent) {
        if let Some(tx) = self.events {
            let _ = tx.send(event).await;
        }
    }

    fn outcome(self, status: RunStatus) -> RunOutcome {
        let next = match status {
            RunStatus::Completed => Vec::new(),
            _ => self.cursor.next_nodes(),
        };
        RunOutcome {
            thread_id: self.thread_id.to_string(),
            run_id: self.run_id,
            status,
            state: self.state.to_json(),
            next,
            snapshots: self.snapshots,
        }
    }
}

/// Exclusive access to one thread for the duration of a run or update
struct ThreadLease<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    thread_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ThreadLease<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.thread_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl CompiledGraph {
    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.keys().map(|k| k.as_str()).collect()
    }

    pub fn interrupt_nodes(&self) -> Vec<&str> {
        self.interrupts.nodes().map(|k| k.as_str()).collect()
    }

    pub fn store(&self) -> Arc<dyn CheckpointStore> {
        self.store.clone()
    }

    /// Run the graph on `thread_id`.
    ///
    /// `Some(input)` starts a new run from the entry; the input must carry
    /// exactly the schema's fields. `None` resumes the thread from its latest
    /// checkpoint.
    pub async fn invoke(
        &self,
        input: Option<Value>,
        thread_id: &str,
    ) -> Result<RunOutcome, GraphError> {
        self.run_with_events(input, thread_id, None).await
    }

    /// Like `invoke`, but reports progress as a stream of events.
    ///
    /// The run is spawned onto the runtime; it keeps going even if the stream
    /// is dropped.
    pub fn stream(
        self: &Arc<Self>,
        input: Option<Value>,
        thread_id: &str,
    ) -> ReceiverStream<GraphEvent> {
        let (tx, rx) = mpsc::channel(64);
        let graph = Arc::clone(self);
        let thread_id = thread_id.to_string();

        tokio::spawn(async move {
            let _ = graph.run_with_events(input, &thread_id, Some(&tx)).await;
        });

        ReceiverStream::new(rx)
    }

    async fn run_with_events(
        &self,
        input: Option<Value>,
        thread_id: &str,
        events: Option<&mpsc::Sender<GraphEvent>>,
    ) -> Result<RunOutcome, GraphError> {
        let result = self.execute(input, thread_id, events).await;
        if let Err(e) = &result {
            log::error!("Run on thread '{}' failed: {}", thread_id, e);
            if let Some(tx) = events {
                let _ = tx
                    .send(GraphEvent::Failed {
                        error: e.to_string(),
                    })
                    .await;
            }
        }
        result
    }

    async fn execute(
        &self,
        input: Option<Value>,
        thread_id: &str,
        events: Option<&mpsc::Sender<GraphEvent>>,
    ) -> Result<RunOutcome, GraphError> {
        checkpoint::require_thread(thread_id)?;
        let _lease = self.lease(thread_id).await;

        let (mut run, released) = match input {
            Some(input) => {
                let values = match input {
                    Value::Object(values) => values,
                    other => {
                        return Err(GraphError::schema(
                            "input",
                            SchemaError::NotAnObject(type_name(&other).to_string()),
                        ))
                    }
                };
                let state = WorkflowState::from_values(&self.schema, values)
                    .map_err(|e| GraphError::schema("input", e))?;
                let mut cursor = Cursor::default();
                self.resolve_routes(START, &state, &mut cursor).await?;

                let run_id = Uuid::new_v4().to_string();
                log::info!("Starting run {} on thread '{}'", run_id, thread_id);
                let run = RunState {
                    thread_id,
                    run_id,
                    state,
                    cursor,
                    snapshots: Vec::new(),
                    events,
                };
                (run, BTreeSet::new())
            }
            None => {
                let latest = self
                    .store
                    .latest(thread_id)
                    .await?
                    .ok_or_else(|| GraphError::NothingToResume(thread_id.to_string()))?;
                let state = self.restore_state(&latest)?;
                let released = match latest.status {
                    RunStatus::Paused => latest.cursor.interrupted.clone(),
                    _ => BTreeSet::new(),
                };
                let run = RunState {
                    thread_id,
                    run_id: latest.run_id.clone(),
                    state,
                    cursor: latest.cursor.clone(),
                    snapshots: Vec::new(),
                    events,
                };

                if latest.status == RunStatus::Completed {
                    log::info!("Thread '{}' already completed", thread_id);
                    run.emit(GraphEvent::Completed {
                        state: run.state.to_json(),
                    })
                    .await;
                    return Ok(run.outcome(RunStatus::Completed));
                }
                log::info!(
                    "Resuming {} run {} on thread '{}' at {:?}",
                    latest.status,
                    run.run_id,
                    thread_id,
                    run.cursor.next_nodes()
                );
                (run, released)
            }
        };

        match self.drive(&mut run, released).await {
            Ok(status) => Ok(run.outcome(status)),
            Err(e) => {
                self.record_failure(&run, &e).await;
                Err(e)
            }
        }
    }

    /// Step the run until it completes or pauses
    async fn drive(
        &self,
        run: &mut RunState<'_>,
        mut released: BTreeSet<String>,
    ) -> Result<RunStatus, GraphError> {
        loop {
            if run.cursor.pending.is_empty() {
                if run.cursor.upcoming.is_empty() {
                    if let Some((target, arrived)) = run.cursor.joins.iter().next() {
                        return Err(self.deadlock(target, arrived));
                    }
                    log::info!(
                        "Run {} completed after {} node executions",
                        run.run_id,
                        run.cursor.executions
                    );
                    run.emit(GraphEvent::Completed {
                        state: run.state.to_json(),
                    })
                    .await;
                    return Ok(RunStatus::Completed);
                }

                let pausing = self.interrupts.pausing(&run.cursor.upcoming, &released);
                if let Some(first) = pausing.iter().next().cloned() {
                    run.cursor.interrupted = pausing;
                    let seq = self
                        .store
                        .append(
                            run.thread_id,
                            NewCheckpoint {
                                run_id: run.run_id.clone(),
                                node: first.clone(),
                                source: CheckpointSource::Interrupt,
                                status: RunStatus::Paused,
                                state: run.state.to_json(),
                                update: Value::Object(Default::default()),
                                cursor: run.cursor.clone(),
                            },
                        )
                        .await?;
                    log::info!(
                        "Run {} paused before '{}' (checkpoint {})",
                        run.run_id,
                        first,
                        seq
                    );
                    run.snapshots.push(StateSnapshot {
                        seq,
                        node: first,
                        state: run.state.to_json(),
                    });
                    run.emit(GraphEvent::Paused {
                        seq,
                        next: run.cursor.next_nodes(),
                        state: run.state.to_json(),
                    })
                    .await;
                    return Ok(RunStatus::Paused);
                }

                self.check_budget(run).await?;
                // Released nodes pass only once; a later visit pauses again
                released.clear();
                run.cursor.step += 1;
                run.cursor.interrupted.clear();
                run.cursor.pending = std::mem::take(&mut run.cursor.upcoming);
                log::info!(
                    "Superstep {}: executing {} nodes: {:?}",
                    run.cursor.step,
                    run.cursor.pending.len(),
                    run.cursor.pending
                );
            }

            self.run_superstep(run).await?;
        }
    }

    /// Run every pending node on one snapshot, then merge, route and checkpoint.
    ///
    /// Routers see the updates of every node that succeeded in the step, so
    /// the outcome does not depend on node names or completion order. Nothing
    /// is written until all updates validate and all routes resolve. If a node
    /// failed, its successful siblings are still committed and the first
    /// error is returned afterwards.
    async fn run_superstep(&self, run: &mut RunState<'_>) -> Result<(), GraphError> {
        let mut scheduled: Vec<(String, Arc<dyn Node>)> = Vec::new();
        for name in &run.cursor.pending {
            let node = self
                .nodes
                .get(name)
                .ok_or_else(|| GraphError::UnknownNode(name.clone()))?;
            scheduled.push((name.clone(), node.clone()));
        }

        let snapshot = run.state.clone();
        let results = join_all(scheduled.iter().map(|(_, node)| node.run(&snapshot))).await;

        let mut completed = Vec::new();
        let mut first_error = None;
        for ((name, _), result) in scheduled.into_iter().zip(results) {
            match result {
                Ok(update) => {
                    self.schema
                        .validate_update(update.as_map())
                        .map_err(|e| GraphError::schema(format!("update from '{}'", name), e))?;
                    completed.push((name, update));
                }
                Err(source) => {
                    log::error!("Node '{}' failed: {}", name, source);
                    if first_error.is_none() {
                        first_error = Some(GraphError::Node { node: name, source });
                    }
                }
            }
        }

        let mut merged = run.state.clone();
        for (_, update) in &completed {
            merged.apply(update);
        }

        let mut cursor = run.cursor.clone();
        let mut staged = Vec::with_capacity(completed.len());
        for (name, update) in completed {
            cursor.pending.remove(&name);
            cursor.executions += 1;
            *cursor.visits.entry(name.clone()).or_insert(0) += 1;
            self.resolve_routes(&name, &merged, &mut cursor).await?;
            staged.push((name, update, cursor.clone()));
        }

        for (name, update, cursor) in staged {
            self.commit(run, name, update, cursor).await?;
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Merge one node's update and append its checkpoint with the staged cursor
    async fn commit(
        &self,
        run: &mut RunState<'_>,
        name: String,
        update: StateUpdate,
        cursor: Cursor,
    ) -> Result<(), GraphError> {
        run.state.apply(&update);
        run.cursor = cursor;

        let status = if run.cursor.is_idle() && run.cursor.joins.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Running
        };
        let seq = self
            .store
            .append(
                run.thread_id,
                NewCheckpoint {
                    run_id: run.run_id.clone(),
                    node: name.clone(),
                    source: CheckpointSource::Step,
                    status,
                    state: run.state.to_json(),
                    update: update.to_value(),
                    cursor: run.cursor.clone(),
                },
            )
            .await?;
        log::info!("Node '{}' completed (checkpoint {})", name, seq);

        run.snapshots.push(StateSnapshot {
            seq,
            node: name.clone(),
            state: run.state.to_json(),
        });
        run.emit(GraphEvent::Step {
            seq,
            node: name,
            update: update.to_value(),
            state: run.state.to_json(),
        })
        .await;
        Ok(())
    }

    /// Mark the thread as failed at its last good state and cursor.
    ///
    /// Storage errors are not recorded; the store is what failed.
    async fn record_failure(&self, run: &RunState<'_>, error: &GraphError) {
        if matches!(error, GraphError::Checkpoint(_)) {
            return;
        }
        let node = match error {
            GraphError::Node { node, .. }
            | GraphError::Router { node, .. }
            | GraphError::Routing { node, .. } => node.clone(),
            _ => run
                .cursor
                .next_nodes()
                .into_iter()
                .next()
                .unwrap_or_else(|| END.to_string()),
        };
        let marker = NewCheckpoint {
            run_id: run.run_id.clone(),
            node,
            source: CheckpointSource::Failure,
            status: RunStatus::Failed,
            state: run.state.to_json(),
            update: Value::Object(Default::default()),
            cursor: run.cursor.clone(),
        };
        match self.store.append(run.thread_id, marker).await {
            Ok(seq) => log::warn!("Run {} marked failed (checkpoint {})", run.run_id, seq),
            Err(e) => log::warn!("Could not record failure of run {}: {}", run.run_id, e),
        }
    }

    /// Schedule whatever follows `node` on the given (post-merge) state
    async fn resolve_routes(
        &self,
        node: &str,
        state: &WorkflowState,
        cursor: &mut Cursor,
    ) -> Result<(), GraphError> {
        let mut destinations: Vec<String> = self.edges.get(node).cloned().unwrap_or_default();

        if let Some(branch) = self.branches.get(node) {
            let keys = branch
                .router
                .route(state)
                .await
                .map_err(|source| GraphError::Router {
                    node: node.to_string(),
                    source,
                })?;
            if keys.is_empty() {
                return Err(GraphError::Routing {
                    node: node.to_string(),
                    key: None,
                });
            }
            for key in keys {
                match branch.mapping.get(&key) {
                    Some(dest) => destinations.push(dest.clone()),
                    None => {
                        return Err(GraphError::Routing {
                            node: node.to_string(),
                            key: Some(key),
                        })
                    }
                }
            }
        }

        for dest in destinations {
            if dest != END {
                cursor.upcoming.insert(dest);
            }
        }

        for join in self.joins.iter().filter(|j| j.sources.contains(node)) {
            let arrived = cursor.joins.entry(join.target.clone()).or_default();
            arrived.insert(node.to_string());
            if join.sources.is_subset(arrived) {
                cursor.joins.remove(&join.target);
                cursor.upcoming.insert(join.target.clone());
            }
        }

        Ok(())
    }

    async fn check_budget(&self, run: &RunState<'_>) -> Result<(), GraphError> {
        let scheduled = run.cursor.upcoming.len() as u32;
        if run.cursor.executions + scheduled > self.limits.max_steps {
            return Err(GraphError::CycleBudgetExceeded {
                scope: "run".to_string(),
                limit: self.limits.max_steps,
                trace: self.trace(run).await,
            });
        }

        for node in &run.cursor.upcoming {
            if let Some(limit) = self.limits.visit_limits.get(node) {
                let visits = run.cursor.visits.get(node).copied().unwrap_or(0);
                if visits + 1 > *limit {
                    return Err(GraphError::CycleBudgetExceeded {
                        scope: format!("node '{}'", node),
                        limit: *limit,
                        trace: self.trace(run).await,
                    });
                }
            }
        }
        Ok(())
    }

    /// Node executions of the run so far, in checkpoint order
    async fn trace(&self, run: &RunState<'_>) -> Vec<String> {
        match self.store.history(run.thread_id).await {
            Ok(history) => history
                .into_iter()
                .filter(|c| c.run_id == run.run_id && c.source == CheckpointSource::Step)
                .map(|c| c.node)
                .collect(),
            Err(e) => {
                log::warn!("Could not load execution trace: {}", e);
                Vec::new()
            }
        }
    }

    fn deadlock(&self, target: &str, arrived: &BTreeSet<String>) -> GraphError {
        let missing = self
            .joins
            .iter()
            .find(|j| j.target == target)
            .map(|j| j.sources.difference(arrived).cloned().collect())
            .unwrap_or_default();
        GraphError::Deadlock {
            target: target.to_string(),
            missing,
        }
    }

    fn restore_state(&self, checkpoint: &Checkpoint) -> Result<WorkflowState, GraphError> {
        let context = format!("checkpoint {}", checkpoint.seq);
        let values = match &checkpoint.state {
            Value::Object(values) => values.clone(),
            other => {
                return Err(GraphError::schema(
                    context,
                    SchemaError::NotAnObject(type_name(other).to_string()),
                ))
            }
        };
        WorkflowState::from_values(&self.schema, values).map_err(|e| GraphError::schema(context, e))
    }

    /// Hold the thread's lock; the map entry goes away with the last holder
    async fn lease(&self, thread_id: &str) -> ThreadLease<'_> {
        let lock = self
            .locks
            .entry(thread_id.to_string())
            .or_default()
            .value()
            .clone();
        ThreadLease {
            locks: &self.locks,
            thread_id: thread_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Latest values and resume point of a thread
    pub async fn get_state(&self, thread_id: &str) -> Result<Option<ThreadState>, GraphError> {
        let latest = self.store.latest(thread_id).await?;
        Ok(latest.map(|checkpoint| {
            let next = match checkpoint.status {
                RunStatus::Completed => Vec::new(),
                _ => checkpoint.cursor.next_nodes(),
            };
            ThreadState {
                thread_id: checkpoint.thread_id,
                run_id: checkpoint.run_id,
                values: checkpoint.state,
                next,
                status: checkpoint.status,
                seq: checkpoint.seq,
                node: checkpoint.node,
                created_at: checkpoint.created_at,
            }
        }))
    }

    /// Apply an out-of-band update to a thread and persist it as its own checkpoint.
    ///
    /// With `as_node`, the update counts as that node's result: the node is no
    /// longer scheduled and its outgoing routes are resolved on the updated
    /// state. Without it, only the values change and the paused node sees
    /// them when it runs.
    pub async fn update_state(
        &self,
        thread_id: &str,
        values: Value,
        as_node: Option<&str>,
    ) -> Result<ThreadState, GraphError> {
        checkpoint::require_thread(thread_id)?;
        let _lease = self.lease(thread_id).await;

        let latest = self
            .store
            .latest(thread_id)
            .await?
            .ok_or_else(|| GraphError::NothingToResume(thread_id.to_string()))?;
        let update =
            StateUpdate::try_from(values).map_err(|e| GraphError::schema("manual update", e))?;
        self.schema
            .validate_update(update.as_map())
            .map_err(|e| GraphError::schema("manual update", e))?;
        if let Some(node) = as_node {
            if !self.nodes.contains_key(node) {
                return Err(GraphError::UnknownNode(node.to_string()));
            }
        }

        let mut state = self.restore_state(&latest)?;
        state.apply(&update);
        let mut cursor = latest.cursor.clone();
        if let Some(node) = as_node {
            cursor.pending.remove(node);
            cursor.upcoming.remove(node);
            cursor.interrupted.remove(node);
            self.resolve_routes(node, &state, &mut cursor).await?;
        }

        let status = if cursor.is_idle() && cursor.joins.is_empty() {
            RunStatus::Completed
        } else {
            match latest.status {
                RunStatus::Running => RunStatus::Running,
                RunStatus::Failed if as_node.is_none() => RunStatus::Failed,
                RunStatus::Failed => RunStatus::Running,
                _ => RunStatus::Paused,
            }
        };
        let node = as_node.unwrap_or(OVERRIDE).to_string();
        let seq = self
            .store
            .append(
                thread_id,
                NewCheckpoint {
                    run_id: latest.run_id.clone(),
                    node: node.clone(),
                    source: CheckpointSource::Update,
                    status,
                    state: state.to_json(),
                    update: update.to_value(),
                    cursor,
                },
            )
            .await?;
        log::info!(
            "Manual update on thread '{}' as '{}' (checkpoint {})",
            thread_id,
            node,
            seq
        );

        self.get_state(thread_id)
            .await?
            .ok_or_else(|| GraphError::Checkpoint(CheckpointError::Storage(
                format!("checkpoint {} of thread '{}' vanished", seq, thread_id),
            )))
    }

    /// Every checkpoint of a thread, oldest first
    pub async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, GraphError> {
        Ok(self.store.history(thread_id).await?)
    }

    /// Rebuild the latest run's final state from its log
    pub async fn replay(
        &self,
        thread_id: &str,
        initial: &serde_json::Map<String, Value>,
    ) -> Result<WorkflowState, GraphError> {
        let history = self.store.history(thread_id).await?;
        checkpoint::replay(&self.schema, initial, checkpoint::latest_run(&history))
    }

    /// Forget a thread entirely
    pub async fn purge(&self, thread_id: &str) -> Result<u64, GraphError> {
        let removed = {
            let _lease = self.lease(thread_id).await;
            self.store.purge(thread_id).await?
        };
        log::info!("Purged {} checkpoints of thread '{}'", removed, thread_id);
        Ok(removed)
    }

    pub async fn threads(&self) -> Result<Vec<String>, GraphError> {
        Ok(self.store.threads().await?)
    }
}
