// SPDX-License-Identifier: MIT

pub mod builder;
pub mod condition;
pub mod graph;
pub mod loader;
pub mod registry;
pub mod types;
