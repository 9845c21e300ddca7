// SPDX-License-Identifier: MIT

//! Execution context handed to a graph at compile time

use std::sync::Arc;

use super::types::ExecutionLimits;
use crate::stategraph::checkpoint::{CheckpointStore, MemoryCheckpointStore};

/// Shared collaborators of compiled graphs: where checkpoints go and how much
/// work a run may do. Several graphs may share one context.
#[derive(Clone)]
pub struct GraphContext {
    store: Arc<dyn CheckpointStore>,
    limits: ExecutionLimits,
}

impl GraphContext {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            limits: ExecutionLimits::default(),
        }
    }

    /// Context with a fresh in-memory checkpoint store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCheckpointStore::new()))
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn store(&self) -> Arc<dyn CheckpointStore> {
        self.store.clone()
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Tear down the checkpoint backend
    pub async fn close(&self) {
        self.store.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_context_defaults() {
        let ctx = GraphContext::in_memory();
        assert_eq!(ctx.limits(), &ExecutionLimits::default());
        assert!(ctx.store().threads().await.unwrap().is_empty());

        let ctx = ctx.with_limits(ExecutionLimits::default().max_steps(3));
        assert_eq!(ctx.limits().max_steps, 3);
        ctx.close().await;
    }
}
