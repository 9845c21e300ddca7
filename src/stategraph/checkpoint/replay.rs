//! Rebuild state from a checkpoint log

use serde_json::{Map, Value};

use super::Checkpoint;
use crate::engine::error::GraphError;
use crate::engine::state::{StateSchema, StateUpdate, WorkflowState};

/// Fold the logged updates, oldest first, over `initial`.
///
/// Pure: replaying the same log twice yields the same state.
pub fn replay(
    schema: &StateSchema,
    initial: &Map<String, Value>,
    log: &[Checkpoint],
) -> Result<WorkflowState, GraphError> {
    let mut state = WorkflowState::from_values(schema, initial.clone())
        .map_err(|e| GraphError::schema("replay input", e))?;

    for checkpoint in log {
        let update = StateUpdate::try_from(checkpoint.update.clone())
            .map_err(|e| GraphError::schema(format!("checkpoint {}", checkpoint.seq), e))?;
        schema
            .validate_update(update.as_map())
            .map_err(|e| GraphError::schema(format!("checkpoint {}", checkpoint.seq), e))?;
        state.apply(&update);
    }

    Ok(state)
}

/// The checkpoints of the most recent run in a thread's log
pub fn latest_run(log: &[Checkpoint]) -> &[Checkpoint] {
    let Some(last) = log.last() else {
        return log;
    };
    let start = log
        .iter()
        .rposition(|c| c.run_id != last.run_id)
        .map(|i| i + 1)
        .unwrap_or(0);
    &log[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::{FieldType, ReducerType, StateFieldDef};
    use crate::stategraph::checkpoint::{CheckpointSource, Cursor, RunStatus};
    use chrono::Utc;
    use serde_json::json;

    fn schema() -> StateSchema {
        StateSchema::new()
            .field(
                "aggregate",
                StateFieldDef::new(FieldType::Array).reducer(ReducerType::Append),
            )
            .field("which", StateFieldDef::new(FieldType::String))
    }

    fn checkpoint(seq: u64, run_id: &str, update: Value) -> Checkpoint {
        Checkpoint {
            thread_id: "t".to_string(),
            seq,
            run_id: run_id.to_string(),
            node: "n".to_string(),
            source: CheckpointSource::Step,
            status: RunStatus::Running,
            state: json!({}),
            update,
            cursor: Cursor::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_replay_folds_updates() {
        let initial = json!({"aggregate": [], "which": "cd"});
        let log = vec![
            checkpoint(1, "r", json!({"aggregate": ["A"]})),
            checkpoint(2, "r", json!({"aggregate": ["C"]})),
            checkpoint(3, "r", json!({})),
            checkpoint(4, "r", json!({"aggregate": "E", "which": "done"})),
        ];

        let first = replay(&schema(), initial.as_object().unwrap(), &log).unwrap();
        let second = replay(&schema(), initial.as_object().unwrap(), &log).unwrap();
        assert_eq!(first.to_json(), json!({"aggregate": ["A", "C", "E"], "which": "done"}));
        assert_eq!(first, second);
    }

    #[test]
    fn test_replay_rejects_foreign_fields() {
        let initial = json!({"aggregate": [], "which": ""});
        let log = vec![checkpoint(1, "r", json!({"other": 1}))];
        let err = replay(&schema(), initial.as_object().unwrap(), &log).unwrap_err();
        assert!(matches!(err, GraphError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_latest_run() {
        let log = vec![
            checkpoint(1, "old", json!({})),
            checkpoint(2, "old", json!({})),
            checkpoint(3, "new", json!({})),
            checkpoint(4, "new", json!({})),
        ];
        let run = latest_run(&log);
        assert_eq!(run.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(latest_run(&log[..2]).len(), 2);
        assert!(latest_run(&[]).is_empty());
    }
}
