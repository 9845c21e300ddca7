// SPDX-License-Identifier: MIT

//! Typed error handling for stategraph-rs
//!
//! Node and router bodies are opaque to the executor, so they keep returning
//! `Box<dyn Error + Send + Sync>`. Everything the builder, the executor and the
//! checkpoint stores raise on their own is typed here.

use thiserror::Error;

use super::state::SchemaError;

/// Error returned by node and router implementations
pub type NodeError = Box<dyn std::error::Error + Send + Sync>;

/// Top-level error type for stategraph-rs
#[derive(Debug, Error)]
pub enum GraphError {
    /// State or update does not fit the declared schema
    #[error("Schema mismatch in {context}: {source}")]
    SchemaMismatch {
        context: String,
        #[source]
        source: SchemaError,
    },

    /// A router produced a key with no mapped destination
    #[error("Routing error at '{node}': {}", describe_route(.key))]
    Routing { node: String, key: Option<String> },

    /// The router callable itself failed
    #[error("Router for '{node}' failed: {source}")]
    Router {
        node: String,
        #[source]
        source: NodeError,
    },

    /// A join can never fire
    #[error("Deadlock: join into '{target}' still waits on {missing:?}")]
    Deadlock { target: String, missing: Vec<String> },

    /// Execution budget exhausted
    #[error("Cycle budget exceeded: {scope} allows {limit} executions (trace: {trace:?})")]
    CycleBudgetExceeded {
        scope: String,
        limit: u32,
        trace: Vec<String>,
    },

    /// A node returned an error
    #[error("Node '{node}' failed: {source}")]
    Node {
        node: String,
        #[source]
        source: NodeError,
    },

    /// Checkpoint store failure
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Invalid graph structure
    #[error("Invalid graph: {0}")]
    Build(#[from] BuildError),

    /// Resume requested on a thread without checkpoints
    #[error("Thread '{0}' has no checkpoint to resume from")]
    NothingToResume(String),

    /// Reference to a node the graph does not have
    #[error("Unknown node '{0}'")]
    UnknownNode(String),

    /// Configuration errors (bad env vars, bad CLI values)
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

fn describe_route(key: &Option<String>) -> String {
    match key {
        Some(key) => format!("route '{}' has no mapped destination", key),
        None => "router returned no route".to_string(),
    }
}

impl GraphError {
    pub fn schema(context: impl Into<String>, source: SchemaError) -> Self {
        Self::SchemaMismatch {
            context: context.into(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Structural problems found while compiling a graph
#[derive(Debug, Error, PartialEq)]
pub enum BuildError {
    #[error("graph has no entry point")]
    MissingEntry,

    #[error("'{0}' is a reserved node name")]
    ReservedName(String),

    #[error("node '{0}' is defined more than once")]
    DuplicateNode(String),

    #[error("{context} references unknown node '{name}'")]
    UnknownNode { context: String, name: String },

    #[error("node '{0}' has no outgoing edge")]
    DeadEnd(String),

    #[error("node '{0}' has more than one conditional branch")]
    DuplicateBranch(String),

    #[error("node '{0}' is the target of more than one join")]
    DuplicateJoin(String),

    #[error("edge from '{from}' is invalid: {message}")]
    InvalidEdge { from: String, message: String },

    #[error("node '{node}' is invalid: {message}")]
    InvalidNode { node: String, message: String },

    #[error("condition '{expression}' is invalid: {message}")]
    InvalidCondition { expression: String, message: String },

    #[error("no handler registered under '{0}'")]
    UnknownHandler(String),

    #[error("invalid state schema: {0}")]
    InvalidSchema(#[from] SchemaError),
}

/// Error type for checkpoint store operations
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("thread_id required")]
    ThreadIdRequired,

    #[error("checkpoint serialization: {0}")]
    Serialization(String),

    #[error("checkpoint storage: {0}")]
    Storage(String),

    #[error("corrupt checkpoint {seq} in thread '{thread_id}': {message}")]
    Corrupt {
        thread_id: String,
        seq: u64,
        message: String,
    },
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for CheckpointError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
