//! The unit of work a graph schedules

use async_trait::async_trait;
use std::future::Future;

use super::error::NodeError;
use super::state::{StateUpdate, WorkflowState};

/// A named step of a graph.
///
/// A node reads the full current state and returns a partial update. It never
/// mutates shared state directly; the executor merges the update through the
/// schema's reducers.
#[async_trait]
pub trait Node: Send + Sync {
    async fn run(&self, state: &WorkflowState) -> Result<StateUpdate, NodeError>;
}

/// Node backed by a synchronous closure
pub struct FnNode<F> {
    f: F,
}

impl<F> FnNode<F>
where
    F: Fn(&WorkflowState) -> Result<StateUpdate, NodeError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Node for FnNode<F>
where
    F: Fn(&WorkflowState) -> Result<StateUpdate, NodeError> + Send + Sync,
{
    async fn run(&self, state: &WorkflowState) -> Result<StateUpdate, NodeError> {
        (self.f)(state)
    }
}

/// Node backed by an async closure; the closure receives its own copy of the state
pub struct AsyncFnNode<F> {
    f: F,
}

impl<F, Fut> AsyncFnNode<F>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StateUpdate, NodeError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Node for AsyncFnNode<F>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StateUpdate, NodeError>> + Send,
{
    async fn run(&self, state: &WorkflowState) -> Result<StateUpdate, NodeError> {
        (self.f)(state.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// A mock node that appends a fixed letter (used in tests)
    struct MockLetterNode {
        letter: &'static str,
    }

    #[async_trait]
    impl Node for MockLetterNode {
        async fn run(&self, _state: &WorkflowState) -> Result<StateUpdate, NodeError> {
            Ok(StateUpdate::new().set("aggregate", json!([self.letter])))
        }
    }

    #[tokio::test]
    async fn test_struct_node() {
        let node = MockLetterNode { letter: "A" };
        let update = node.run(&WorkflowState::empty()).await.unwrap();
        assert_eq!(update.get("aggregate"), Some(&json!(["A"])));
    }

    #[tokio::test]
    async fn test_fn_node_reads_state() {
        let node = FnNode::new(|state: &WorkflowState| {
            let question = state
                .get("question")
                .and_then(|v| v.as_str())
                .ok_or("question missing")?;
            Ok(StateUpdate::new().set("answer", format!("re: {}", question)))
        });

        let mut state = WorkflowState::empty();
        state.update("question", json!("Q"));
        let update = node.run(&state).await.unwrap();
        assert_eq!(update.get("answer"), Some(&json!("re: Q")));

        assert!(node.run(&WorkflowState::empty()).await.is_err());
    }

    #[tokio::test]
    async fn test_async_fn_node() {
        let node = AsyncFnNode::new(|state: WorkflowState| async move {
            tokio::task::yield_now().await;
            let n = state.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(StateUpdate::new().set("n", n + 1))
        });

        let mut state = WorkflowState::empty();
        state.update("n", json!(41));
        let update = node.run(&state).await.unwrap();
        assert_eq!(update.get("n"), Some(&json!(42)));
    }
}
