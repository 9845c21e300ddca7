// SPDX-License-Identifier: MIT

use crate::engine::node::Node;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Host-provided nodes that YAML graphs reference by `handler` name
#[derive(Clone)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<String, Arc<dyn Node>>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, name: impl Into<String>, node: Arc<dyn Node>) {
        let mut nodes = self.nodes.write().await;
        nodes.insert(name.into(), node);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Node>> {
        let nodes = self.nodes.read().await;
        nodes.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let nodes = self.nodes.read().await;
        let mut names: Vec<String> = nodes.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
