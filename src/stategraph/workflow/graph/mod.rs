// SPDX-License-Identifier: MIT

//! Graph-based workflow execution
//!
//! `StateGraph` collects nodes and edges; compiling it against a
//! `GraphContext` validates the structure and yields a `CompiledGraph` that
//! runs in checkpointed supersteps.

mod context;
mod executor;
mod interrupt;
mod state_graph;
pub mod types;

pub use context::GraphContext;
pub use executor::CompiledGraph;
pub use interrupt::InterruptController;
pub use state_graph::StateGraph;
pub use types::{
    Branch, ExecutionLimits, GraphEvent, Join, RunOutcome, StateSnapshot, ThreadState,
    DEFAULT_MAX_STEPS, END, OVERRIDE, START,
};
