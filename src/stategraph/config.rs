// SPDX-License-Identifier: MIT

//! Process settings read from the environment
//!
//! `main` loads `.env` before reading these; CLI flags override them.

use crate::engine::error::GraphError;
use crate::stategraph::checkpoint::default_database_url;
use crate::stategraph::workflow::graph::DEFAULT_MAX_STEPS;

pub const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// `sqlite://...` URL of the checkpoint database
    pub database_url: String,
    pub max_steps: u32,
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            max_steps: DEFAULT_MAX_STEPS,
            port: DEFAULT_PORT,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, GraphError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GraphError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            database_url: lookup("STATEGRAPH_DATABASE_URL").unwrap_or(defaults.database_url),
            max_steps: parse_var(&lookup, "STATEGRAPH_MAX_STEPS", defaults.max_steps)?,
            port: parse_var(&lookup, "STATEGRAPH_PORT", defaults.port)?,
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, GraphError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| GraphError::config(format!("{}={:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}
