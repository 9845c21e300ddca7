// SPDX-License-Identifier: MIT

pub mod checkpoint;
pub mod config;
pub mod nodes;
pub mod server;
pub mod workflow;
