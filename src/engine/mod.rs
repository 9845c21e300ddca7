// SPDX-License-Identifier: MIT

//! Engine primitives - the pieces every graph is made of
//!
//! This module provides:
//! - `Node` - a named unit of work returning a partial state update
//! - `Router` - picks the outgoing route(s) of a conditional edge
//! - `state` - the schema-checked state container and its merge policies
//! - `error` - the typed error hierarchy shared by the whole crate

pub mod error;
pub mod node;
pub mod router;
pub mod state;

pub use error::{BuildError, CheckpointError, GraphError, NodeError};
pub use node::{AsyncFnNode, FnNode, Node};
pub use router::{EnumRouter, FnRouter, RouteKey, Router};
pub use state::{
    FieldType, ReducerType, SchemaError, StateFieldDef, StateSchema, StateUpdate, WorkflowState,
};
