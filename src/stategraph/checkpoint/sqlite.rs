// SPDX-License-Identifier: MIT

//! SQLite checkpoint store
//!
//! SQLite allows only one writer at a time, so appends go through a
//! single-connection writer pool while reads use a separate reader pool. Both
//! run in WAL mode. Each append is one `INSERT ... SELECT` statement that picks
//! the next sequence number for the thread, so a checkpoint is either stored
//! completely or not at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

use super::{require_thread, Checkpoint, CheckpointStore, Cursor, NewCheckpoint};
use crate::engine::error::CheckpointError;

const SELECT_COLUMNS: &str = "thread_id, seq, run_id, node, source, status, state, \
                              update_values, cursor, created_at";

/// Durable checkpoint store backed by a SQLite database
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    reader: SqlitePool,
    writer: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Open (creating if needed) the database at `database_url` and run migrations.
    ///
    /// `sqlite::memory:` databases live inside one connection, so reads share
    /// the writer connection there.
    pub async fn connect(database_url: &str) -> Result<Self, CheckpointError> {
        let in_memory = database_url.contains(":memory:");
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);
        let base_opts = if in_memory {
            base_opts
        } else {
            base_opts.journal_mode(SqliteJournalMode::Wal)
        };

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(base_opts.clone())
            .await?;

        sqlx::migrate!("./migrations")
            .run(&writer)
            .await
            .map_err(|e| CheckpointError::Storage(format!("migration failed: {}", e)))?;

        let reader = if in_memory {
            writer.clone()
        } else {
            SqlitePoolOptions::new()
                .max_connections(8)
                .connect_with(base_opts.read_only(true))
                .await?
        };

        log::debug!("Opened checkpoint database {}", database_url);
        Ok(Self { reader, writer })
    }
}

/// Default database URL: `STATEGRAPH_DATA_DIR`, falling back to `~/.stategraph`
pub fn default_database_url() -> String {
    let data_dir = std::env::var("STATEGRAPH_DATA_DIR").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}/.stategraph")
    });
    format!("sqlite://{data_dir}/checkpoints.db")
}

struct CheckpointRow {
    thread_id: String,
    seq: i64,
    run_id: String,
    node: String,
    source: String,
    status: String,
    state: String,
    update_values: String,
    cursor: String,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            thread_id: row.try_get("thread_id")?,
            seq: row.try_get("seq")?,
            run_id: row.try_get("run_id")?,
            node: row.try_get("node")?,
            source: row.try_get("source")?,
            status: row.try_get("status")?,
            state: row.try_get("state")?,
            update_values: row.try_get("update_values")?,
            cursor: row.try_get("cursor")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, CheckpointError> {
        let seq = self.seq as u64;
        let thread_id = self.thread_id;
        let corrupt = |message: String| CheckpointError::Corrupt {
            thread_id: thread_id.clone(),
            seq,
            message,
        };

        let source = self.source.parse().map_err(corrupt)?;
        let status = self.status.parse().map_err(corrupt)?;
        let state = serde_json::from_str(&self.state)
            .map_err(|e| corrupt(format!("invalid state JSON: {e}")))?;
        let update = serde_json::from_str(&self.update_values)
            .map_err(|e| corrupt(format!("invalid update JSON: {e}")))?;
        let cursor: Cursor = serde_json::from_str(&self.cursor)
            .map_err(|e| corrupt(format!("invalid cursor JSON: {e}")))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| corrupt(format!("invalid timestamp: {e}")))?;

        Ok(Checkpoint {
            thread_id,
            seq,
            run_id: self.run_id,
            node: self.node,
            source,
            status,
            state,
            update,
            cursor,
            created_at,
        })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn append(
        &self,
        thread_id: &str,
        checkpoint: NewCheckpoint,
    ) -> Result<u64, CheckpointError> {
        require_thread(thread_id)?;
        let state = serde_json::to_string(&checkpoint.state)?;
        let update = serde_json::to_string(&checkpoint.update)?;
        let cursor = serde_json::to_string(&checkpoint.cursor)?;
        let created_at = Utc::now().to_rfc3339();

        let row = sqlx::query(
            "INSERT INTO checkpoints (thread_id, seq, run_id, node, source, status, state, \
                                      update_values, cursor, created_at) \
             SELECT ?, COALESCE(MAX(seq), 0) + 1, ?, ?, ?, ?, ?, ?, ?, ? \
             FROM checkpoints WHERE thread_id = ? \
             RETURNING seq",
        )
        .bind(thread_id)
        .bind(&checkpoint.run_id)
        .bind(&checkpoint.node)
        .bind(checkpoint.source.as_str())
        .bind(checkpoint.status.as_str())
        .bind(&state)
        .bind(&update)
        .bind(&cursor)
        .bind(&created_at)
        .bind(thread_id)
        .fetch_one(&self.writer)
        .await?;

        let seq: i64 = row.try_get("seq")?;
        log::debug!(
            "Checkpoint {}#{} written ({} after '{}')",
            thread_id,
            seq,
            checkpoint.source.as_str(),
            checkpoint.node
        );
        Ok(seq as u64)
    }

    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        require_thread(thread_id)?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM checkpoints WHERE thread_id = ? ORDER BY seq DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(thread_id)
            .fetch_optional(&self.reader)
            .await?;

        match row {
            Some(row) => Ok(Some(CheckpointRow::from_row(&row)?.into_checkpoint()?)),
            None => Ok(None),
        }
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        require_thread(thread_id)?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM checkpoints WHERE thread_id = ? ORDER BY seq ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(thread_id)
            .fetch_all(&self.reader)
            .await?;

        rows.iter()
            .map(|row| CheckpointRow::from_row(row)?.into_checkpoint())
            .collect()
    }

    async fn purge(&self, thread_id: &str) -> Result<u64, CheckpointError> {
        require_thread(thread_id)?;
        let result = sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.writer)
            .await?;
        Ok(result.rows_affected())
    }

    async fn threads(&self) -> Result<Vec<String>, CheckpointError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT thread_id FROM checkpoints ORDER BY thread_id")
                .fetch_all(&self.reader)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn close(&self) {
        self.writer.close().await;
        self.reader.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stategraph::checkpoint::{CheckpointSource, RunStatus};
    use serde_json::json;

    fn temp_url(dir: &tempfile::TempDir, name: &str) -> String {
        format!("sqlite://{}?mode=rwc", dir.path().join(name).display())
    }

    fn entry(node: &str, state: serde_json::Value) -> NewCheckpoint {
        let mut cursor = Cursor::default();
        cursor.upcoming.insert("next".to_string());
        NewCheckpoint {
            run_id: "run-1".to_string(),
            node: node.to_string(),
            source: CheckpointSource::Step,
            status: RunStatus::Running,
            state,
            update: json!({"answer": "X"}),
            cursor,
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::connect(&temp_url(&dir, "cp.db"))
            .await
            .unwrap();

        assert_eq!(store.append("t1", entry("a", json!({"n": 1}))).await.unwrap(), 1);
        assert_eq!(store.append("t1", entry("b", json!({"n": 2}))).await.unwrap(), 2);
        assert_eq!(store.append("t2", entry("a", json!({"n": 3}))).await.unwrap(), 1);

        let latest = store.latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.seq, 2);
        assert_eq!(latest.node, "b");
        assert_eq!(latest.state, json!({"n": 2}));
        assert_eq!(latest.update, json!({"answer": "X"}));
        assert_eq!(latest.source, CheckpointSource::Step);
        assert!(latest.cursor.upcoming.contains("next"));

        let history = store.history("t1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].node, "a");
        assert_eq!(store.threads().await.unwrap(), vec!["t1", "t2"]);

        assert_eq!(store.purge("t1").await.unwrap(), 2);
        assert!(store.latest("t1").await.unwrap().is_none());
        assert_eq!(store.history("t2").await.unwrap().len(), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = temp_url(&dir, "durable.db");

        let store = SqliteCheckpointStore::connect(&url).await.unwrap();
        store.append("t", entry("a", json!({"n": 1}))).await.unwrap();
        store.close().await;

        let reopened = SqliteCheckpointStore::connect(&url).await.unwrap();
        let latest = reopened.latest("t").await.unwrap().unwrap();
        assert_eq!(latest.state, json!({"n": 1}));
        assert_eq!(reopened.append("t", entry("b", json!({}))).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_wal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::connect(&temp_url(&dir, "wal.db"))
            .await
            .unwrap();

        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&store.writer)
            .await
            .unwrap();
        assert_eq!(result.0.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_in_memory_database() {
        let store = SqliteCheckpointStore::connect("sqlite::memory:").await.unwrap();
        store.append("t", entry("a", json!({"n": 1}))).await.unwrap();
        assert_eq!(store.history("t").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_row_is_reported() {
        let store = SqliteCheckpointStore::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "INSERT INTO checkpoints VALUES ('t', 1, 'r', 'a', 'step', 'sideways', '{}', '{}', '{}', 'now')",
        )
        .execute(&store.writer)
        .await
        .unwrap();

        let err = store.latest("t").await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { seq: 1, .. }));
    }

    #[test]
    fn test_default_database_url() {
        let url = default_database_url();
        assert!(url.starts_with("sqlite://"));
        assert!(url.ends_with("checkpoints.db"));
    }
}
