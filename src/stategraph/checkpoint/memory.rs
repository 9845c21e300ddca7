// SPDX-License-Identifier: MIT

//! In-process checkpoint store

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{require_thread, Checkpoint, CheckpointStore, NewCheckpoint};
use crate::engine::error::CheckpointError;

type ThreadLog = Arc<Mutex<Vec<Checkpoint>>>;

/// Checkpoint store kept in memory, one lock per thread
#[derive(Default, Clone)]
pub struct MemoryCheckpointStore {
    threads: Arc<DashMap<String, ThreadLog>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, thread_id: &str) -> Option<ThreadLog> {
        self.threads.get(thread_id).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn append(
        &self,
        thread_id: &str,
        checkpoint: NewCheckpoint,
    ) -> Result<u64, CheckpointError> {
        require_thread(thread_id)?;
        let log = self
            .threads
            .entry(thread_id.to_string())
            .or_default()
            .value()
            .clone();

        let mut entries = log.lock().await;
        let seq = entries.last().map(|c| c.seq).unwrap_or(0) + 1;
        entries.push(Checkpoint::from_new(thread_id, seq, Utc::now(), checkpoint));
        Ok(seq)
    }

    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        require_thread(thread_id)?;
        match self.log(thread_id) {
            Some(log) => Ok(log.lock().await.last().cloned()),
            None => Ok(None),
        }
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        require_thread(thread_id)?;
        match self.log(thread_id) {
            Some(log) => Ok(log.lock().await.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn purge(&self, thread_id: &str) -> Result<u64, CheckpointError> {
        require_thread(thread_id)?;
        match self.threads.remove(thread_id) {
            Some((_, log)) => Ok(log.lock().await.len() as u64),
            None => Ok(0),
        }
    }

    async fn threads(&self) -> Result<Vec<String>, CheckpointError> {
        let mut ids: Vec<String> = self.threads.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}
