// SPDX-License-Identifier: MIT

//! Built-in node kinds available to YAML graphs

mod command;
mod update;

pub use command::CommandNode;
pub use update::UpdateNode;
