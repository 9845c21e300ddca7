// SPDX-License-Identifier: MIT

//! Checkpoint persistence
//!
//! Every completed node, every pause, every manual override and every failed
//! run appends one immutable entry to its thread's log. Entries carry the full state, the
//! partial update that produced it and the cursor needed to resume.
//!
//! Backends:
//! - `MemoryCheckpointStore` - process-local, per-thread locks
//! - `SqliteCheckpointStore` - durable, one row per checkpoint

mod memory;
mod replay;
mod sqlite;

pub use memory::MemoryCheckpointStore;
pub use replay::{latest_run, replay};
pub use sqlite::{default_database_url, SqliteCheckpointStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::engine::error::CheckpointError;

/// Where a run stands; persisted alongside every checkpoint.
///
/// A `Failed` thread resumes like a `Running` one: whatever was pending when
/// the error struck runs again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

/// What produced a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    /// A node finished and its update was merged
    Step,
    /// The run paused before an interrupt node
    Interrupt,
    /// A caller applied an out-of-band update
    Update,
    /// The run stopped on an error; state and cursor are the last good ones
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "paused" => Ok(RunStatus::Paused),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("invalid run status: {}", other)),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CheckpointSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointSource::Step => "step",
            CheckpointSource::Interrupt => "interrupt",
            CheckpointSource::Update => "update",
            CheckpointSource::Failure => "failure",
        }
    }
}

impl FromStr for CheckpointSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "step" => Ok(CheckpointSource::Step),
            "interrupt" => Ok(CheckpointSource::Interrupt),
            "update" => Ok(CheckpointSource::Update),
            "failure" => Ok(CheckpointSource::Failure),
            other => Err(format!("invalid checkpoint source: {}", other)),
        }
    }
}

/// Resume point of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Superstep counter within the run
    pub step: u32,
    /// Nodes of the current superstep whose updates are not merged yet
    #[serde(default)]
    pub pending: BTreeSet<String>,
    /// Nodes scheduled for the next superstep
    #[serde(default)]
    pub upcoming: BTreeSet<String>,
    /// Join target -> sources that already arrived
    #[serde(default)]
    pub joins: BTreeMap<String, BTreeSet<String>>,
    /// Nodes the run is currently paused in front of
    #[serde(default)]
    pub interrupted: BTreeSet<String>,
    /// Node executions so far
    #[serde(default)]
    pub executions: u32,
    #[serde(default)]
    pub visits: BTreeMap<String, u32>,
}

impl Cursor {
    /// Nodes that run next: the rest of the current superstep, else the next one
    pub fn next_nodes(&self) -> Vec<String> {
        if self.pending.is_empty() {
            self.upcoming.iter().cloned().collect()
        } else {
            self.pending.iter().cloned().collect()
        }
    }

    /// Nothing left to run
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.upcoming.is_empty()
    }
}

/// A checkpoint about to be appended
#[derive(Debug, Clone, PartialEq)]
pub struct NewCheckpoint {
    pub run_id: String,
    pub node: String,
    pub source: CheckpointSource,
    pub status: RunStatus,
    pub state: Value,
    pub update: Value,
    pub cursor: Cursor,
}

/// A stored checkpoint; `seq` is its id within the thread, starting at 1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub seq: u64,
    pub run_id: String,
    pub node: String,
    pub source: CheckpointSource,
    pub status: RunStatus,
    pub state: Value,
    pub update: Value,
    pub cursor: Cursor,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn from_new(
        thread_id: &str,
        seq: u64,
        created_at: DateTime<Utc>,
        new: NewCheckpoint,
    ) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            seq,
            run_id: new.run_id,
            node: new.node,
            source: new.source,
            status: new.status,
            state: new.state,
            update: new.update,
            cursor: new.cursor,
            created_at,
        }
    }
}

/// Append-only, per-thread checkpoint log.
///
/// Appends to one thread are serialized; different threads never block each
/// other. An append is atomic: it is stored completely or not at all.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint and return its sequence number
    async fn append(&self, thread_id: &str, checkpoint: NewCheckpoint)
        -> Result<u64, CheckpointError>;

    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// All checkpoints of a thread, oldest first
    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError>;

    /// Drop a thread's log; returns the number of removed checkpoints
    async fn purge(&self, thread_id: &str) -> Result<u64, CheckpointError>;

    async fn threads(&self) -> Result<Vec<String>, CheckpointError>;

    /// Release backend resources
    async fn close(&self) {}
}

pub(crate) fn require_thread(thread_id: &str) -> Result<(), CheckpointError> {
    if thread_id.trim().is_empty() {
        Err(CheckpointError::ThreadIdRequired)
    } else {
        Ok(())
    }
}
