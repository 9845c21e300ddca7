//! Graph loader - YAML file loading and parsing

use super::types::GraphDefinition;
use crate::engine::error::GraphError;
use std::fs;
use std::path::Path;

/// Loads graph definitions from YAML files
pub struct GraphLoader;

impl GraphLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load a graph definition from a YAML file
    pub fn load_graph<P: AsRef<Path>>(&self, path: P) -> Result<GraphDefinition, GraphError> {
        let content = fs::read_to_string(path.as_ref())?;
        let def = Self::parse_yaml(&content)?;
        log::debug!(
            "Loaded graph '{}' from {} ({} nodes, {} edges)",
            def.name,
            path.as_ref().display(),
            def.nodes.len(),
            def.edges.len()
        );
        Ok(def)
    }

    /// Parse a graph definition from a YAML string
    pub fn parse_yaml(content: &str) -> Result<GraphDefinition, GraphError> {
        let def: GraphDefinition = serde_yaml::from_str(content)?;
        Ok(def)
    }
}

impl Default for GraphLoader {
    fn default() -> Self {
        Self::new()
    }
}
