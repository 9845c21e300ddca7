// SPDX-License-Identifier: MIT

//! State management for graph execution
//!
//! This module provides:
//! - `StateSchema` - defines the shape and types of graph state
//! - `WorkflowState` - runtime state storage with reducer support
//! - `StateUpdate` - the partial mapping a node returns

mod schema;
mod store;
mod update;

pub use schema::{type_name, FieldType, ReducerType, SchemaError, StateFieldDef, StateSchema};
pub use store::WorkflowState;
pub use update::StateUpdate;
